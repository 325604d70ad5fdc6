//! Typed identifiers for the things a build is made of.
//!
//! Build, task and sandbox ids are all plain strings on the wire; wrapping
//! them keeps a task id from being passed where a sandbox id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a string-backed id type that (de)serializes as a bare string.
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Caller-supplied identifier for one build request.
    ///
    /// Every progress event, sandbox name and persisted record is keyed by
    /// this value.
    BuildId
);

string_id!(
    /// Identifier of a partitioned unit of work.
    ///
    /// Either the id carried by the plan item or a positional fallback such
    /// as `phase-2`.
    TaskId
);

string_id!(
    /// Identifier of a sandbox, e.g. `build-42-main` or `build-42-build-0`.
    SandboxId
);

impl SandboxId {
    /// Id of the main sandbox for a build.
    pub fn main_for(build_id: &BuildId) -> Self {
        Self(format!("{build_id}-main"))
    }

    /// Id of the `index`-th build sandbox for a build.
    pub fn build_for(build_id: &BuildId, index: usize) -> Self {
        Self(format!("{build_id}-build-{index}"))
    }
}
