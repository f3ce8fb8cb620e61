//! fleetprobe - Probe scheduling and diagnostic job processor
//!
//! Runs paced probe cycles over a reconciled target set and executes
//! external diagnostic tools through a bounded job queue.

mod config;
mod db;
mod jobs;
mod probe;
mod publish;
mod scheduler;
mod web;

use config::ProcessorConfig;
use db::Store;
use jobs::{JobQueue, SystemToolFactory};
use probe::NetworkConnectorFactory;
use publish::{run_publication_logger, ChannelPublisher};
use scheduler::ProbeScheduler;
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleetprobe=info".parse()?))
        .init();

    // Load configuration
    let cfg = ProcessorConfig::load();
    tracing::info!("Starting fleetprobe on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let (publisher, publications) = ChannelPublisher::new(1000);
    let publisher = Arc::new(publisher);
    tokio::spawn(run_publication_logger(publications));

    // Restore engine state
    match store.blob_updated_at(scheduler::RECORDS_KEY) {
        Ok(Some(saved)) => tracing::info!("Restoring state saved at {}", saved),
        Ok(None) => tracing::info!("No saved state, starting empty"),
        Err(e) => tracing::warn!("Could not read saved state timestamp: {}", e),
    }
    let scheduler = Arc::new(ProbeScheduler::new(
        Arc::new(NetworkConnectorFactory),
        publisher.clone(),
        store,
    ));
    scheduler.restore().await;
    tracing::info!("Probe parameters: {:?}", scheduler.params().await);

    if !cfg.exec_allow.is_empty() {
        tracing::warn!("Exec jobs allowed for: {}", cfg.exec_allow.join(", "));
    }
    let tools = SystemToolFactory::new(cfg.exec_allow.clone());
    let jobs = Arc::new(JobQueue::new(cfg.job_settings(), Arc::new(tools), publisher));
    jobs.start().await;

    let (stop_tx, _) = broadcast::channel(1);
    let cycles = tokio::spawn(run_cycle_driver(scheduler.clone(), cfg.clone(), stop_tx.subscribe()));

    // Start control API
    let server = Server::new(cfg, scheduler.clone(), jobs.clone());
    server.start(shutdown_signal()).await?;

    let _ = stop_tx.send(());
    let _ = cycles.await;
    jobs.stop().await;
    scheduler.shutdown().await;

    Ok(())
}

/// Run a cycle every configured interval until stopped.
async fn run_cycle_driver(
    scheduler: Arc<ProbeScheduler>,
    cfg: ProcessorConfig,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let cycle = cfg.cycle_config();
    let mut interval = tokio::time::interval(Duration::from_millis(cfg.cycle_interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let result = scheduler.run_cycle(&cycle).await;
                if result.success {
                    tracing::info!(
                        "Cycle finished in {} ms: {} dispatched, {} abandoned",
                        result.elapsed_ms, result.dispatched, result.abandoned
                    );
                } else {
                    tracing::warn!("Cycle unsuccessful: {}", result.messages.join("; "));
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
