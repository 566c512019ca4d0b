//! Continuum worker process.
//!
//! Claims queued tasks from the task store, screens each script, and
//! executes it inside a persistent, pre-hardened sandbox container
//! reused across consecutive tasks. Configuration is environment-only
//! (see `DbConfig::from_env` and `WorkerConfig::from_env`); there is no
//! CLI surface to parse.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use continuum_core::config::WorkerConfig;
use continuum_core::error::ConfigError;
use continuum_core::sandbox::runtime::DockerCliRuntime;
use continuum_core::sandbox::{ensure_sandbox_network, SandboxManager};
use continuum_core::screener::DenyListScreener;
use continuum_core::stats::WorkerStats;
use continuum_core::worker;
use continuum_db::config::DbConfig;
use continuum_db::pool;

/// Grace period given to container removal during shutdown.
const SANDBOX_DISPOSE_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("continuum=info")),
        )
        .init();

    if let Err(err) = run().await {
        error!(error = format!("{err:#}"), "continuum-worker exiting after startup failure");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let db_config = DbConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    validate_priority_band(&worker_config).context("invalid worker configuration")?;
    let worker_id = Uuid::new_v4();

    info!(worker_id = %worker_id, "starting continuum worker");

    pool::ensure_database_exists(&db_config)
        .await
        .map_err(ConfigError::StoreUnreachable)
        .context("failed to ensure task-store database exists")?;

    let db_pool = pool::create_pool(&db_config)
        .await
        .map_err(ConfigError::StoreUnreachable)
        .context("failed to connect to task store")?;

    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .map_err(ConfigError::StoreUnreachable)
        .context("failed to run database migrations")?;

    let runtime = Arc::new(DockerCliRuntime::new());
    ensure_sandbox_network(runtime.as_ref(), &worker_config.sandbox.network_name)
        .await
        .map_err(|source| ConfigError::NetworkSetup {
            name: worker_config.sandbox.network_name.clone(),
            source: source.into(),
        })
        .context("failed to ensure sandbox network exists")?;

    let sandbox = Arc::new(SandboxManager::new(
        runtime,
        worker_config.sandbox.clone(),
        worker_id.to_string(),
    ));
    let stats = Arc::new(WorkerStats::new(worker_id));
    let screener = DenyListScreener::default();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let reaper_handle = sandbox.spawn_idle_reaper(cancel.clone());

    let loop_result = worker::run(
        &db_pool,
        worker_id,
        &worker_config,
        &screener,
        sandbox.as_ref(),
        stats.as_ref(),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    reaper_handle.abort();

    match tokio::time::timeout(SANDBOX_DISPOSE_GRACE, sandbox.dispose()).await {
        Ok(Ok(())) => info!("sandbox container disposed"),
        Ok(Err(err)) => error!(error = %err, "failed to dispose sandbox container during shutdown"),
        Err(_) => error!("timed out disposing sandbox container during shutdown"),
    }

    db_pool.close().await;

    loop_result.context("worker loop exited with an error")?;

    info!("continuum-worker shut down cleanly");
    Ok(())
}

/// Reject an incoherent priority band before any connection is attempted.
/// `0` on either side means unbounded, so only a fully-specified, inverted
/// band (`min > max`, both non-zero) is an error.
fn validate_priority_band(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.min_priority != 0 && config.max_priority != 0 && config.min_priority > config.max_priority
    {
        return Err(ConfigError::InvalidEnv(format!(
            "MIN_PRIORITY ({}) is greater than MAX_PRIORITY ({})",
            config.min_priority, config.max_priority
        )));
    }
    Ok(())
}

/// Cancel the worker loop on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining in-flight task");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
