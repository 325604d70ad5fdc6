//! Intent verification of the merged main sandbox.
//!
//! Scoring lives in an external service; the orchestrator only needs the
//! verdict and a score.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub satisfied: bool,
    #[serde(default)]
    pub score: f64,
}

#[async_trait]
pub trait IntentVerifier: Send + Sync {
    async fn verify(&self, main: &Sandbox, intent_contract: &Value) -> Result<Verification>;
}

/// Fixed verdict, for deployments without a verification service.
#[derive(Debug, Clone, Copy)]
pub struct StaticVerifier {
    verdict: Verification,
}

impl StaticVerifier {
    pub fn new(satisfied: bool, score: f64) -> Self {
        Self {
            verdict: Verification { satisfied, score },
        }
    }

    pub fn accepting() -> Self {
        Self::new(true, 100.0)
    }
}

#[async_trait]
impl IntentVerifier for StaticVerifier {
    async fn verify(&self, _main: &Sandbox, _intent_contract: &Value) -> Result<Verification> {
        Ok(self.verdict)
    }
}

/// Asks a verification service: `POST {sandboxId, tunnelUrl, intentContract}`
/// → `{satisfied, score}`.
pub struct HttpIntentVerifier {
    url: Url,
    client: reqwest::Client,
}

impl HttpIntentVerifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url).with_context(|| format!("invalid verifier url `{}`", url))?,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("failed to build verifier HTTP client")?,
        })
    }
}

#[async_trait]
impl IntentVerifier for HttpIntentVerifier {
    async fn verify(&self, main: &Sandbox, intent_contract: &Value) -> Result<Verification> {
        let verification = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "sandboxId": main.id,
                "tunnelUrl": main.tunnel_url,
                "intentContract": intent_contract,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<Verification>()
            .await
            .context("verification service returned an unexpected body")?;

        Ok(verification)
    }
}
