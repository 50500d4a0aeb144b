// gatespy - authenticating, observing API proxy
//
// Sits between API clients and an upstream gateway. Plain HTTP requests are
// re-authenticated with a cached OAuth bearer token and forwarded; CONNECT
// requests become transparent tunnels whose plaintext traffic is passively
// reassembled. Every logical exchange lands exactly once in an in-memory
// ring buffer and a per-session JSON Lines file.
//
// Architecture:
// - Proxy core (tokio TCP): framing, tunnels, upstream forwarding
// - Credential cache: OAuth2 client-credentials tokens for upstream auth
// - SSE reducer: folds streamed responses back into one logical message
// - Logger: ring buffer + JSONL storage task, fed over an mpsc channel

mod auth;
mod cli;
mod config;
mod logger;
mod pricing;
mod proxy;
mod sse;
mod usage;
mod util;

use anyhow::{Context, Result};
use chrono::Utc;
use config::{Config, LogRotation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Generate a unique session ID for log file naming
/// Format: YYYYMMDD-HHMMSS-XXXX (timestamp + 4 random hex chars)
fn generate_session_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    // Use RandomState to get a random value without adding a dependency
    let random = RandomState::new().build_hasher().finish();
    let short_hash = format!("{:04x}", random & 0xFFFF);

    format!("{}-{}", timestamp, short_hash)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --edit, --path)
    // If a command was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Initialize tracing: stderr always, optionally a rotating JSON file.
    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("gatespy={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // The guard must be kept alive for the duration of the program to
    // ensure buffered log lines flush
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard> =
        if config.logging.file_enabled {
            if let Err(e) = std::fs::create_dir_all(&config.logging.file_dir) {
                eprintln!(
                    "Warning: Could not create log directory {:?}: {}",
                    config.logging.file_dir, e
                );
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                None
            } else {
                let file_appender = match config.logging.file_rotation {
                    LogRotation::Hourly => tracing_appender::rolling::hourly(
                        &config.logging.file_dir,
                        &config.logging.file_prefix,
                    ),
                    LogRotation::Daily => tracing_appender::rolling::daily(
                        &config.logging.file_dir,
                        &config.logging.file_prefix,
                    ),
                    LogRotation::Never => tracing_appender::rolling::never(
                        &config.logging.file_dir,
                        &config.logging.file_prefix,
                    ),
                };
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // File layer uses JSON format for structured log parsing
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .with(
                        tracing_subscriber::fmt::layer()
                            .json()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init();
                Some(guard)
            }
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        };

    let session_id = generate_session_id();
    tracing::debug!("Session ID: {}", session_id);

    if !config.credentials.is_configured() {
        tracing::warn!(
            "No token endpoint configured (GATESPY_TOKEN_URL); forwarded requests will fail to authenticate"
        );
    }

    // One shared upstream client: HTTP/1.1 only, generous streaming timeout
    let http = reqwest::Client::builder()
        .http1_only()
        .pool_max_idle_per_host(10)
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()
        .context("Failed to build upstream HTTP client")?;

    let credentials = Arc::new(auth::CredentialCache::new(Box::new(
        auth::OAuthClientCredentials::new(
            http.clone(),
            config.credentials.token_url.clone(),
            config.credentials.client_id.clone(),
            config.credentials.client_secret.clone(),
        ),
    )));

    // Exchange records flow proxy -> logger ring (sync) and, over this
    // bounded channel, to the JSONL storage task
    let (record_tx, record_rx) = mpsc::channel(1000);
    let logger = logger::Logger::new(record_tx);

    let writer = logger::ExchangeWriter::new(config.log_dir.clone(), session_id, record_rx)
        .context("Failed to create exchange writer")?;
    let writer_handle = tokio::spawn(async move {
        if let Err(e) = writer.run().await {
            tracing::error!("Exchange writer failed: {:?}", e);
        }
    });

    let forwarder = Arc::new(proxy::forwarder::Forwarder::new(
        http,
        config.api_url.clone(),
        credentials.clone(),
        logger.clone(),
        config.limits.max_logged_body,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server = proxy::ProxyServer::new(
        config.bind_addr.to_string(),
        forwarder,
        logger.clone(),
        config.limits.max_logged_body,
    );
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            tracing::error!("Proxy server failed: {:?}", e);
        }
    });

    tracing::info!(
        "gatespy {} proxying {} -> {}",
        config::VERSION,
        config.bind_addr,
        config.api_url
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");

    // Cached token dies with the process
    credentials.clear();

    // Signal the proxy to shut down gracefully
    // If the send fails, the proxy has already shut down (which is fine)
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    // Dropping our logger clone closes the record channel once in-flight
    // connection tasks finish, letting the writer drain and exit
    drop(logger);
    let _ = writer_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
