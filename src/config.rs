//! Configuration loader for the `sensorflow-harmonize` service.
//!
//! All runtime configuration values and their defaults are read here from
//! environment variables (with optional `.env` support provided by the
//! caller), so no other module calls `env::var` directly.
use std::env;
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Which backend holds the fact store and reference data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local; everything is lost on exit.
    Memory,
}

/// Strongly typed application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub store: StoreKind,

    /// PostgreSQL connection string. Empty for the memory store.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP surface binds to.
    pub listen_addr: SocketAddr,

    /// How long a staging buffer stays mergeable.
    pub staging_retention_hours: u32,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (unless `HARMONIZE_STORE=memory`)
///
/// Optional:
/// - `HARMONIZE_STORE` – `postgres` (default) or `memory`
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_ADDR` – bind address (default: `0.0.0.0:8080`)
/// - `STAGING_RETENTION_HOURS` – staging buffer lifetime (default: 168)
pub fn load_from_env() -> Result<Config> {
    // ---
    let store = match env::var("HARMONIZE_STORE").ok().as_deref() {
        None | Some("postgres") => StoreKind::Postgres,
        Some("memory") => StoreKind::Memory,
        Some(other) => bail!("Invalid HARMONIZE_STORE: {other} (expected postgres or memory)"),
    };
    let db_url = match store {
        StoreKind::Postgres => require_env!("DATABASE_URL"),
        StoreKind::Memory => env::var("DATABASE_URL").unwrap_or_default(),
    };
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let staging_retention_hours = parse_env_u32!("STAGING_RETENTION_HOURS", 168);
    let listen_addr = env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("Invalid LISTEN_ADDR: {}", e))?;

    if staging_retention_hours == 0 {
        bail!("STAGING_RETENTION_HOURS must be positive");
    }

    Ok(Config {
        store,
        db_url,
        db_pool_max,
        listen_addr,
        staging_retention_hours,
    })
}

impl Config {
    pub fn staging_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.staging_retention_hours))
    }

    /// Log the loaded configuration with the database password masked.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  HARMONIZE_STORE         : {:?}", self.store);
        tracing::info!("  DATABASE_URL            : {}", mask_password(&self.db_url));
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  LISTEN_ADDR             : {}", self.listen_addr);
        tracing::info!("  STAGING_RETENTION_HOURS : {}", self.staging_retention_hours);
    }
}

fn mask_password(db_url: &str) -> String {
    // ---
    let Some(at_pos) = db_url.rfind('@') else {
        return db_url.to_string();
    };
    match db_url[..at_pos].rfind(':') {
        // `postgres://host@...` has only the scheme colon before the '@'
        Some(colon_pos) if !db_url[colon_pos..].starts_with("://") => {
            format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..])
        }
        _ => db_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_mask_password() {
        // ---
        assert_eq!(
            mask_password("postgres://app:s3cret@db:5432/harmonize"),
            "postgres://app:****@db:5432/harmonize"
        );
        assert_eq!(
            mask_password("postgres://db:5432/harmonize"),
            "postgres://db:5432/harmonize"
        );
        assert_eq!(mask_password("postgres://app@db/harmonize"), "postgres://app@db/harmonize");
    }
}
