//! Application entry point for the `sensorflow-harmonize` service.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the configured store (PostgreSQL pool + schema, or in-memory)
//! - Mounting all API routes via the `routes` gateway
//! - Serving until Ctrl-C, which also cancels any running multi-date job
//!   at its next date boundary
//!
//! # Environment Variables
//! - `DATABASE_URL` – PostgreSQL connection string (required for postgres)
//! - `HARMONIZE_STORE` (optional) – `postgres` (default) or `memory`
//! - `DB_POOL_MAX` (optional) – maximum number of DB connections (default: 5)
//! - `LISTEN_ADDR` (optional) – bind address (default: `0.0.0.0:8080`)
//! - `STAGING_RETENTION_HOURS` (optional) – staging lifetime (default: 168)
//! - `HARMONIZE_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `HARMONIZE_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sensorflow_harmonize::config::{self, Config, StoreKind};
use sensorflow_harmonize::{routes, schema, MemoryStore, PgStore, Pipeline, Store};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    match cfg.store {
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            serve(MemoryStore::new(), &cfg).await
        }
        StoreKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(&cfg.db_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            serve(PgStore::new(pool), &cfg).await
        }
    }
}

async fn serve<S: Store>(store: S, cfg: &Config) -> Result<()> {
    // ---
    let pipeline = Arc::new(Pipeline::new(store, cfg.staging_retention()));
    let cancel = pipeline.cancel_flag();
    let app = routes::router(pipeline);

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
    tracing::info!("Listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            tracing::info!("Shutdown requested, cancelling running jobs");
            cancel.cancel();
        })
        .await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR`:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by `HARMONIZE_SPAN_EVENTS`:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, else `HARMONIZE_LOG_LEVEL`
///
/// Call once at startup, before any logging macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("HARMONIZE_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("HARMONIZE_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
