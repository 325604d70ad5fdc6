// Core modules
pub mod budget;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod merge;
pub mod model;
pub mod progress;
pub mod sandbox;
pub mod types;
pub mod verify;

pub mod api;
pub mod orchestrator;

// Re-export key types and functions
pub use api::{ApiState, AppState};
pub use config::{Credentials, EngineConfig, OrchestrationConfig, load_request, parse_request};
pub use db::{BuildStore, DatabaseConfig, create_connection, ensure_schema};
pub use model::{BuildJob, BuildRequest, BuildResult, Task, TaskResult};
pub use orchestrator::{BuildState, Orchestrator};
pub use progress::{EventSink, ProgressEmitter, WebhookSink};
pub use sandbox::{HttpSandboxClient, SandboxClient};
pub use verify::{HttpIntentVerifier, IntentVerifier, StaticVerifier};
