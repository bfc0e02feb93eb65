use std::sync::Arc;
use std::time::Duration;

use drover_core::config::ExecutionConfig;
use drover_pipeline::dispatcher::Dispatcher;
use drover_pipeline::executor::RequestExecutor;
use drover_pipeline::store::{PgStore, SharedStore};
use drover_worker::poller::TriggerPoller;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drover_worker=debug,drover_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ExecutionConfig::from_env().expect("Invalid execution configuration");
    tracing::info!(
        playbooks_directory = %config.playbook.playbooks_directory.display(),
        concurrency = config.worker_concurrency,
        timeout_secs = config.timeout.as_secs(),
        "Loaded execution configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = drover_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    drover_db::health_check(&pool)
        .await
        .expect("Database health check failed");

    drover_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Recovery ---
    let abandoned = drover_db::repositories::RequestRepo::fail_abandoned(&pool)
        .await
        .expect("Failed to recover abandoned requests");
    if abandoned > 0 {
        tracing::warn!(count = abandoned, "Marked requests abandoned by a previous run as failed");
    }

    // --- Pipeline ---
    let store: SharedStore = Arc::new(PgStore::new(pool.clone(), config.sync_batch_size));
    let executor = Arc::new(RequestExecutor::new(store, &config));
    let dispatcher = Dispatcher::new(executor, config.worker_concurrency);
    let poller = TriggerPoller::new(pool.clone(), dispatcher.handle(), config.poll_interval);

    let cancel = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher.run(cancel.clone()));
    let poller_cancel = cancel.clone();
    let poller_handle = tokio::spawn(async move {
        poller.run(poller_cancel).await;
    });
    tracing::info!("Worker started");

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    let _ = poller_handle.await;
    // In-flight playbooks run to completion; give them the execution timeout.
    if tokio::time::timeout(config.timeout + Duration::from_secs(5), dispatcher_handle)
        .await
        .is_err()
    {
        tracing::warn!("In-flight requests did not finish before shutdown");
    }
    pool.close().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
