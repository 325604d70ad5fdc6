//! Typed errors for the parts of a build that callers branch on.
//!
//! Everything else in the crate propagates `anyhow::Error`; these variants
//! exist where the orchestrator or the HTTP layer needs to tell one failure
//! class from another.

use thiserror::Error;

/// A build request that cannot be turned into a [`crate::model::BuildJob`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error("buildId must not be empty")]
    MissingBuildId,

    #[error("invalid webhook url `{url}`: {reason}")]
    InvalidWebhookUrl { url: String, reason: String },

    #[error("budgetLimitUsd must be a non-negative finite number, got {0}")]
    InvalidBudget(f64),

    #[error("invalid request document: {0}")]
    Malformed(String),
}

/// A malformed implementation plan.
#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("implementation plan must be a JSON object")]
    NotAnObject,

    #[error("`{field}` must be an array of objects")]
    NotAList { field: &'static str },

    #[error("`{field}[{index}]` must be an object")]
    NotAnItem { field: &'static str, index: usize },
}

/// Failures reported by a sandbox lifecycle client.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox bridge rejected `{action}`: {message}")]
    Rejected { action: String, message: String },

    #[error("sandbox bridge request failed: {0}")]
    Transport(#[from] reqwest::Error),
}
