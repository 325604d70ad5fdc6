use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, env, fmt, fs, io::Read, time::Duration};

use crate::model::BuildRequest;

pub const DEFAULT_MAX_PARALLEL_SANDBOXES: usize = 5;
pub const DEFAULT_BUDGET_LIMIT_USD: f64 = 100.0;
pub const DEFAULT_PARTITION_STRATEGY: &str = "by-phase";
/// Upper bound on a single run: 24 hours.
pub const DEFAULT_MAX_DURATION_SECS: u64 = 86_400;
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 3_600;

/// Per-build orchestration knobs carried in the request's `config` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationConfig {
    #[serde(default = "default_max_parallel_sandboxes")]
    pub max_parallel_sandboxes: usize,
    /// Reserved; accepted and echoed in telemetry only.
    #[serde(default)]
    pub tournament_mode: bool,
    #[serde(default = "default_budget_limit_usd")]
    pub budget_limit_usd: f64,
    /// Echoed in the `tasksPartitioned` event. Partitioning itself is fixed.
    #[serde(default = "default_partition_strategy")]
    pub task_partition_strategy: String,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

fn default_max_parallel_sandboxes() -> usize {
    DEFAULT_MAX_PARALLEL_SANDBOXES
}

fn default_budget_limit_usd() -> f64 {
    DEFAULT_BUDGET_LIMIT_USD
}

fn default_partition_strategy() -> String {
    DEFAULT_PARTITION_STRATEGY.to_string()
}

fn default_max_duration_secs() -> u64 {
    DEFAULT_MAX_DURATION_SECS
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel_sandboxes: DEFAULT_MAX_PARALLEL_SANDBOXES,
            tournament_mode: false,
            budget_limit_usd: DEFAULT_BUDGET_LIMIT_USD,
            task_partition_strategy: DEFAULT_PARTITION_STRATEGY.to_string(),
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

impl OrchestrationConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Number of build sandboxes to start for `task_count` tasks.
    ///
    /// `min(maxParallelSandboxes, taskCount)`, but at least one whenever
    /// there is work to do.
    pub fn build_sandbox_count(&self, task_count: usize) -> usize {
        if task_count == 0 {
            return 0;
        }
        self.max_parallel_sandboxes.clamp(1, task_count)
    }
}

/// Secrets handed to the sandbox substrate. Never logged or emitted.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable SHA-256 over the sorted `key=value` pairs, for correlating
    /// builds in logs without exposing the values.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.0 {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Replace `${VAR}` references in every value from the process env.
    pub fn expand_env(self) -> Self {
        self.expand_with(|name| env::var(name).ok())
    }

    fn expand_with(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|(k, v)| {
                    let expanded = expand_vars(&v, &lookup);
                    (k, expanded)
                })
                .collect(),
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// Expand `${NAME}` references; unknown names are left untouched.
fn expand_vars(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Some(val) = lookup(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Process-wide settings for the engine's external collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the sandbox bridge service.
    pub sandbox_bridge_url: Option<String>,
    /// Verification service; when unset every merged build is accepted.
    pub verifier_url: Option<String>,
    pub webhook_timeout: Duration,
    /// Per-request ceiling for sandbox bridge calls.
    pub sandbox_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox_bridge_url: env::var("BUILDFLEET_SANDBOX_BRIDGE_URL").ok(),
            verifier_url: env::var("BUILDFLEET_VERIFIER_URL").ok(),
            webhook_timeout: env_secs("BUILDFLEET_WEBHOOK_TIMEOUT_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_WEBHOOK_TIMEOUT_SECS)),
            sandbox_timeout: env_secs("BUILDFLEET_SANDBOX_TIMEOUT_SECS")
                .unwrap_or(Duration::from_secs(DEFAULT_SANDBOX_TIMEOUT_SECS)),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Load a build request document from a file, or from stdin when `path` is `-`.
pub fn load_request(path: &str) -> anyhow::Result<BuildRequest> {
    let raw = if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read build request `{}`: {}", path, e))?
    };

    parse_request(&raw)
}

pub fn parse_request(raw: &str) -> anyhow::Result<BuildRequest> {
    let mut request: BuildRequest = serde_json::from_str(raw)?;
    request.credentials = request.credentials.expand_env();
    Ok(request)
}
