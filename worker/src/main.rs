//! Fulfillment worker.
//!
//! Runs everything that happens outside a request:
//!
//! - the post-commit worker (stock cache refresh, deferred cart cleanup,
//!   event publication to Redpanda)
//! - the expired-reservation sweeper
//! - the pending-order reconciler
//! - the Prometheus metrics listener
//!
//! All loops share one shutdown signal, sent on SIGINT or SIGTERM.

mod config;

use anyhow::Context;
use chrono::Duration;
use config::Config;
use fulfillment_core::environment::{Clock, SystemClock};
use fulfillment_core::events::EventPublisher;
use fulfillment_postgres::PostgresDatabase;
use fulfillment_redpanda::RedpandaEventPublisher;
use fulfillment_runtime::metrics::MetricsServer;
use fulfillment_runtime::{
    InventoryManager, PendingOrderReconciler, PostCommitQueue, PostCommitWorker,
    ReservationSweeper, StockLevelCache,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long a refreshed stock level stays in the cache.
const STOCK_CACHE_TTL: Duration = Duration::minutes(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fulfillment=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fulfillment worker");
    let config = Config::from_env().context("invalid configuration")?;

    MetricsServer::new(config.server.metrics_addr()?)
        .start()
        .context("failed to start metrics exporter")?;

    let db = PostgresDatabase::connect_with(&config.postgres.url, &config.postgres.pool_settings())
        .await
        .context("failed to connect to PostgreSQL")?
        .with_lock_timeout(config.postgres.lock_timeout());
    if config.postgres.run_migrations {
        db.migrate().await.context("failed to run migrations")?;
    }

    let publisher: Arc<dyn EventPublisher> = Arc::new(
        RedpandaEventPublisher::builder()
            .brokers(&config.redpanda.brokers)
            .topic(&config.redpanda.topic)
            .producer_acks(&config.redpanda.acks)
            .compression(&config.redpanda.compression)
            .timeout(std::time::Duration::from_millis(config.redpanda.timeout_ms))
            .build()
            .context("failed to create Redpanda publisher")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(StockLevelCache::new(STOCK_CACHE_TTL, Arc::clone(&clock)));
    let (queue, receiver) = PostCommitQueue::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let post_commit =
        PostCommitWorker::new(receiver, db.clone(), publisher, cache, Arc::clone(&clock));
    let inventory = InventoryManager::new(db.clone(), Arc::clone(&clock))
        .with_manual_hold_ttl(config.manual_hold_ttl);
    let sweeper = ReservationSweeper::new(inventory)
        .with_interval(std::time::Duration::from_secs(config.sweeper.sweep_interval_secs))
        .with_batch_size(config.sweeper.sweep_batch_size);
    let reconciler = PendingOrderReconciler::new(db, clock, queue)
        .with_reservation_ttl(config.engine.reservation_ttl)
        .with_grace(Duration::seconds(config.sweeper.reconcile_grace_secs))
        .with_interval(std::time::Duration::from_secs(config.sweeper.reconcile_interval_secs));

    let tasks = vec![
        tokio::spawn(post_commit.run(shutdown_rx.clone())),
        tokio::spawn(sweeper.run(shutdown_rx.clone())),
        tokio::spawn(reconciler.run(shutdown_rx)),
    ];
    info!(
        sweep_interval_secs = config.sweeper.sweep_interval_secs,
        reconcile_interval_secs = config.sweeper.reconcile_interval_secs,
        "Background jobs started"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let grace = std::time::Duration::from_secs(config.server.shutdown_timeout);
    let drained = tokio::time::timeout(grace, join_jobs(tasks)).await;
    if drained.is_err() {
        warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Background jobs did not stop in time"
        );
    }

    info!("Worker stopped");
    Ok(())
}

async fn join_jobs(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        if let Err(error) = task.await {
            warn!(error = %error, "Background job ended abnormally");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
