#![forbid(unsafe_code)]

//! `fleet-relay`: pipeline orchestrator server binary.
//!
//! Bootstraps configuration and the `SQLite` store, wires the resilience
//! layer around the stage agents, starts the background maintenance tasks
//! and serves the HTTP API until a shutdown signal arrives.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use fleet_relay::api::{self, ApiState};
use fleet_relay::config::GlobalConfig;
use fleet_relay::orchestrator::memory::KeywordMemory;
use fleet_relay::orchestrator::pipeline::PipelineOrchestrator;
use fleet_relay::orchestrator::registry::HttpAgentRegistry;
use fleet_relay::orchestrator::session_manager::SessionManager;
use fleet_relay::orchestrator::timeout_scanner::spawn_timeout_scanner;
use fleet_relay::persistence::archive_repo::ArchiveRepo;
use fleet_relay::persistence::dlq_repo::DeadLetterQueue;
use fleet_relay::persistence::{db, retention};
use fleet_relay::resilience::circuit_breaker::CircuitBreakerManager;
use fleet_relay::resilience::recovery::RecoveryProcessor;
use fleet_relay::resilience::retry::{RetryExecutor, RetryPolicy};
use fleet_relay::resilience::transport::{HttpTransport, StageTransport};
use fleet_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fleet-relay", about = "Resilient incident pipeline orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("fleet-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(agents = config.agents.len(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "database connected");

    // ── Build the resilience layer ──────────────────────
    let transport: Arc<dyn StageTransport> =
        Arc::new(HttpTransport::new(concat!("fleet-relay/", env!("CARGO_PKG_VERSION")))?);
    let dlq = DeadLetterQueue::new(Arc::clone(&db));
    let retry = Arc::new(RetryExecutor::new(
        RetryPolicy::from_config(&config.retry),
        Arc::clone(&transport),
        config.retry.enable_dead_letter_queue.then(|| dlq.clone()),
    ));
    let breakers = Arc::new(CircuitBreakerManager::new(&config.circuit_breaker));
    let recovery = Arc::new(RecoveryProcessor::new(
        dlq,
        Arc::clone(&transport),
        config.recovery.clone(),
    ));

    // ── Build the orchestrator ──────────────────────────
    let sessions = Arc::new(SessionManager::new(
        ArchiveRepo::new(Arc::clone(&db)),
        config.sessions.clone(),
    ));
    let pipeline = Arc::new(PipelineOrchestrator::new(
        &config,
        Arc::clone(&sessions),
        Arc::new(HttpAgentRegistry::from_config(&config)?),
        Arc::new(KeywordMemory::new()),
        retry,
        breakers,
    ));

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let scanner_handle = spawn_timeout_scanner(
        Arc::clone(&sessions),
        Duration::from_secs(config.sessions.scan_interval_seconds),
        ct.clone(),
    );
    let retention_handle = retention::spawn_retention_task(
        Arc::clone(&sessions),
        Duration::from_secs(config.sessions.cleanup_interval_seconds),
        config.sessions.max_archive_age_days,
        ct.clone(),
    );
    let recovery_handle = Arc::clone(&recovery).spawn(ct.clone());
    info!("background tasks started");

    // ── Start the HTTP API ──────────────────────────────
    let bind = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind http api to {bind}: {err}")))?;
    let api_ct = ct.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(listener, ApiState { pipeline, recovery }, api_ct).await {
            error!(%err, "http api failed");
        }
    });

    info!(%bind, "fleet-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(api_handle, scanner_handle, retention_handle, recovery_handle);
    info!(
        active_sessions = sessions.active_count().await,
        "fleet-relay shut down"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
