use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::db::DbConfig;
use crate::delivery::{Backoff, DeliveryConfig};

/// Where staged events are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local map. Events do not survive a restart.
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,

    /// Identity of this node in the cluster membership.
    pub node_id: String,
    /// Base URL peers use to reach this node.
    pub node_url: String,
    pub token_space: u32,

    pub store: StoreBackend,
    pub database: DbConfig,

    /// Membership coordinator. Without one the node owns the whole space.
    pub coordinator_url: Option<String>,
    pub membership_refresh: Duration,

    pub gateway_url: String,
    pub functions_url: String,
    pub http_timeout: Duration,

    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub credential_refresh_before: Duration,

    pub rules_file: Option<PathBuf>,

    pub delivery: DeliveryConfig,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Pool settings. `DATABASE_URL` is honoured so sqlx tooling and the
/// service share one variable.
fn database_config() -> Result<DbConfig> {
    let defaults = DbConfig::default();
    let database_url = std::env::var("SGW_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .unwrap_or(defaults.database_url);

    Ok(DbConfig {
        database_url,
        max_connections: env_parse("SGW_DB_MAX_CONNECTIONS", defaults.max_connections)?,
        min_connections: env_parse("SGW_DB_MIN_CONNECTIONS", defaults.min_connections)?,
        acquire_timeout: env_millis("SGW_DB_ACQUIRE_TIMEOUT_MS", defaults.acquire_timeout)?,
        ..defaults
    })
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = env_or("SGW_LISTEN_ADDR", "127.0.0.1:8090").parse()?;

        let log_level = env_or("SGW_LOG_LEVEL", "info");

        let dev_mode = std::env::var("SGW_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let node_id = env_or("SGW_NODE_ID", "node-local");
        let node_url = env_or("SGW_NODE_URL", &format!("http://{listen_addr}"));
        let token_space = env_parse("SGW_TOKEN_SPACE", sgw_events::DEFAULT_TOKEN_SPACE)?;
        if token_space == 0 {
            bail!("SGW_TOKEN_SPACE must be at least 1");
        }

        let store = match env_or("SGW_STORE", "memory").to_lowercase().as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" | "pg" => StoreBackend::Postgres,
            other => bail!("unknown SGW_STORE backend {other:?} (expected memory or postgres)"),
        };

        let coordinator_url = std::env::var("SGW_COORDINATOR_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let jwt_secret = match std::env::var("SGW_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if dev_mode => "sgw-dev-secret".to_string(),
            _ => bail!("SGW_JWT_SECRET is required outside dev mode"),
        };

        let defaults = DeliveryConfig::default();
        let backoff = Backoff {
            base: env_millis("SGW_BACKOFF_BASE_MS", defaults.backoff.base)?,
            max: env_millis("SGW_BACKOFF_MAX_MS", defaults.backoff.max)?,
            ..defaults.backoff
        };
        let delivery = DeliveryConfig {
            concurrency: env_parse("SGW_DELIVERY_CONCURRENCY", defaults.concurrency)?,
            batch_size: env_parse("SGW_DELIVERY_BATCH_SIZE", defaults.batch_size)?,
            poll_interval: env_millis("SGW_POLL_INTERVAL_MS", defaults.poll_interval)?,
            max_retries: env_parse("SGW_MAX_RETRIES", defaults.max_retries)?,
            backoff,
            dispatch_timeout: env_millis("SGW_DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout)?,
            recovery_interval: env_millis("SGW_RECOVERY_INTERVAL_MS", defaults.recovery_interval)?,
            processing_lease: env_millis("SGW_PROCESSING_LEASE_MS", defaults.processing_lease)?,
            shutdown_grace: defaults.shutdown_grace,
        };
        if delivery.processing_lease <= delivery.dispatch_timeout {
            bail!("SGW_PROCESSING_LEASE_MS must exceed SGW_DISPATCH_TIMEOUT_MS");
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            node_id,
            node_url,
            token_space,
            store,
            database: database_config()?,
            coordinator_url,
            membership_refresh: env_millis("SGW_MEMBERSHIP_REFRESH_MS", Duration::from_secs(5))?,
            gateway_url: env_or("SGW_GATEWAY_URL", "http://127.0.0.1:4122"),
            functions_url: env_or("SGW_FUNCTIONS_URL", "http://127.0.0.1:4122"),
            http_timeout: env_millis("SGW_HTTP_TIMEOUT_MS", Duration::from_secs(30))?,
            jwt_secret,
            token_ttl: Duration::from_secs(env_parse("SGW_TOKEN_TTL_SECS", 3600u64)?),
            credential_refresh_before: Duration::from_secs(60),
            rules_file: std::env::var("SGW_RULES_FILE").ok().map(PathBuf::from),
            delivery,
        })
    }
}
