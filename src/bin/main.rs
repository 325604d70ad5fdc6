use anyhow::{Context, Result};
use buildfleet::config::{DEFAULT_SANDBOX_TIMEOUT_SECS, DEFAULT_WEBHOOK_TIMEOUT_SECS};
use buildfleet::{ApiState, BuildJob, BuildStore, DatabaseConfig, EngineConfig, Orchestrator, load_request};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildfleet")]
#[command(about = "Parallel multi-sandbox build orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single build from a request document and print its result
    Run {
        /// Path to the JSON build request, or `-` for stdin
        #[arg(long)]
        request: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Start the build REST API (Axum HTTP)
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Initialize the database
    Init {
        #[arg(long, env = "BUILDFLEET_DB_URL", default_value = "memory")]
        db_url: String,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Sandbox bridge endpoint
    #[arg(long, env = "BUILDFLEET_SANDBOX_BRIDGE_URL")]
    sandbox_bridge_url: Option<String>,
    /// Intent verification endpoint; builds are accepted as merged when unset
    #[arg(long, env = "BUILDFLEET_VERIFIER_URL")]
    verifier_url: Option<String>,
    #[arg(long, env = "BUILDFLEET_WEBHOOK_TIMEOUT_SECS", default_value_t = DEFAULT_WEBHOOK_TIMEOUT_SECS)]
    webhook_timeout_secs: u64,
    #[arg(long, env = "BUILDFLEET_SANDBOX_TIMEOUT_SECS", default_value_t = DEFAULT_SANDBOX_TIMEOUT_SECS)]
    sandbox_timeout_secs: u64,
    #[arg(long, env = "BUILDFLEET_DB_URL", default_value = "memory")]
    db_url: String,
}

impl EngineArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sandbox_bridge_url: self.sandbox_bridge_url.clone(),
            verifier_url: self.verifier_url.clone(),
            webhook_timeout: Duration::from_secs(self.webhook_timeout_secs),
            sandbox_timeout: Duration::from_secs(self.sandbox_timeout_secs),
        }
    }

    async fn build_store(&self) -> Result<BuildStore> {
        let db_config = DatabaseConfig {
            url: self.db_url.clone(),
            ..Default::default()
        };
        info!("Using database url: {}", db_config.url);

        let db = buildfleet::create_connection(db_config).await?;
        buildfleet::ensure_schema(&db).await?;
        Ok(BuildStore::new(db))
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping task dispatch");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("buildfleet=info".parse()?))
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { request, engine } => {
            let request = load_request(&request)?;
            let job = BuildJob::try_from(request).context("invalid build request")?;
            info!("Running build {} with {:?}", job.build_id, job.config);

            let store = engine.build_store().await?;
            let orchestrator = Orchestrator::from_config(&engine.engine_config())?.with_store(store);

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let result = orchestrator.run_with_cancel(job, cancel).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.success() {
                std::process::exit(1);
            }
        }
        Commands::Serve { bind, engine } => {
            let store = engine.build_store().await?;
            let orchestrator = Orchestrator::from_config(&engine.engine_config())?.with_store(store.clone());

            let shutdown = CancellationToken::new();
            let state = Arc::new(ApiState::new(Arc::new(orchestrator), store, shutdown.clone()));
            let app = buildfleet::api::create_router(state);

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("Build API listening on http://{}", bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Shutting down, cancelling running builds");
                    shutdown.cancel();
                })
                .await?;
        }
        Commands::Init { db_url } => {
            let db_config = DatabaseConfig {
                url: db_url,
                ..Default::default()
            };
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = buildfleet::create_connection(db_config).await?;
            buildfleet::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}
