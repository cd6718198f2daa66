//! gatekeep server binary
//!
//! Serves the HTTP API and runs the worker pools, the cron scheduler and
//! the expiry sweep in the same process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatekeep::clock::{Clock, SystemClock};
use gatekeep::store::{
    connect, JobStore, MemoryJobStore, MemoryStore, RedisJobStore, RedisStore, StateStore,
};
use gatekeep::{create_router, spawn_cleanup_task, AppState, Collaborators, Config};

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Connect the shared store (Redis when `STORE_URL` is set) and wire the components
/// 4. Start worker pools, the scheduler and, for the in-process store, the expiry sweep
/// 5. Serve HTTP until SIGINT/SIGTERM
/// 6. Stop the scheduler, drain the workers, abort the sweep
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatekeep=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gatekeep");

    let config = Config::from_env();
    info!(
        port = config.server_port,
        shared_store = config.store_url.is_some(),
        max_entries = config.max_entries,
        fail_mode = ?config.rate_limit_fail_mode,
        worker_concurrency = config.worker_concurrency,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (store, job_store, local_store) = match &config.store_url {
        Some(url) => {
            let conn = connect(url)
                .await
                .context("Failed to connect to the shared store")?;
            let store: Arc<dyn StateStore> = Arc::new(RedisStore::new(
                conn.clone(),
                config.store_prefix.clone(),
                clock.clone(),
            ));
            let job_store: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(
                conn,
                config.store_prefix.clone(),
                config.job_retention(),
            ));
            (store, job_store, None)
        }
        None => {
            warn!("STORE_URL not set, using the in-process store; jobs will not survive a restart");
            let local = Arc::new(MemoryStore::new(config.max_entries, clock.clone()));
            let store: Arc<dyn StateStore> = local.clone();
            let job_store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
            (store, job_store, Some(local))
        }
    };

    let state = AppState::new(&config, store, job_store, clock, Collaborators::default())
        .context("Failed to build HTTP client")?;

    let cleanup_handle =
        local_store.map(|store| spawn_cleanup_task(store, config.cleanup_interval));
    let workers = state.start_workers(&config);
    let scheduler = state
        .scheduler(&config)
        .await
        .context("Failed to register default triggers")?;
    let scheduler_handle = Arc::new(scheduler).start(AppState::scheduler_tick(&config));
    info!(workers = workers.len(), "Background processing started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler_handle.shutdown().await;
    for worker in workers {
        worker.shutdown().await;
    }
    if let Some(cleanup_handle) = cleanup_handle {
        cleanup_handle.abort();
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
