use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("BUILDFLEET_DB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("BUILDFLEET_DB_NAMESPACE").unwrap_or_else(|_| "buildfleet".to_string()),
            database: env::var("BUILDFLEET_DB_DATABASE").unwrap_or_else(|_| "builds".to_string()),
            username: env::var("BUILDFLEET_DB_USERNAME").ok(),
            password: env::var("BUILDFLEET_DB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// In-process store that disappears with the process.
    pub fn in_memory() -> Self {
        Self {
            url: "memory".to_string(),
            namespace: "buildfleet".to_string(),
            database: "builds".to_string(),
            username: None,
            password: None,
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // One row per build, keyed by build id
        "DEFINE TABLE IF NOT EXISTS build SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS build_id ON TABLE build TYPE string;
         DEFINE FIELD IF NOT EXISTS state ON TABLE build TYPE string;
         DEFINE FIELD IF NOT EXISTS credentials_fingerprint ON TABLE build TYPE string;
         DEFINE FIELD IF NOT EXISTS started_at ON TABLE build TYPE string;
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE build TYPE string;",

        // Per-task outcomes, including tasks that never ran
        "DEFINE TABLE IF NOT EXISTS task_result SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS build_id ON TABLE task_result TYPE string;
         DEFINE FIELD IF NOT EXISTS task_id ON TABLE task_result TYPE string;
         DEFINE FIELD IF NOT EXISTS status ON TABLE task_result TYPE string;
         DEFINE FIELD IF NOT EXISTS success ON TABLE task_result TYPE bool;
         DEFINE FIELD IF NOT EXISTS recorded_at ON TABLE task_result TYPE string;",

        "DEFINE INDEX IF NOT EXISTS task_result_build ON TABLE task_result COLUMNS build_id;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}
