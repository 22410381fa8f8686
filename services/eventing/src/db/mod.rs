//! Event persistence.
//!
//! [`EventStore`] is the contract the delivery manager and the API work
//! against. `PgEventStore` backs clustered deployments; `MemoryEventStore`
//! backs single-node development and tests.

mod error;
mod event_store;
mod memory;
mod postgres;

pub use error::DbError;
pub use event_store::{EventStore, RetryPlan, StatusCounts};
pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use std::path::PathBuf;
use std::time::Duration;

use sgw_events::TokenSpace;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/sgw".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Directories searched for migrations, in order. The first two cover
/// running from the crate or the workspace root.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("./migrations"),
        PathBuf::from("services/eventing/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dirs = migration_dirs();
        let mut last_error = None;

        for dir in &dirs {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            info!(migrations_dir = %dir.display(), "Running database migrations");
            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            return Ok(());
        }

        Err(DbError::MigrationDirNotFound {
            tried: dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error
                .map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
        })
    }

    /// Event store holding the rows of `node_id`.
    pub fn event_store(&self, node_id: &str, space: TokenSpace) -> PgEventStore {
        PgEventStore::new(self.pool.clone(), node_id, space)
    }
}
