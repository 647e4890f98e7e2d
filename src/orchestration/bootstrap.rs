//! # Lifecycle
//!
//! Boot sequence: pool, migrations, dangling-order recovery, then the
//! worker pool and poller. Shutdown on the first SIGTERM/SIGINT: the poller
//! stops claiming immediately, in-flight workers get a grace deadline,
//! stragglers are abandoned and surface as dangling on the next boot.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use super::poller::DatabasePoller;
use super::worker::OrderPipeline;
use super::worker_pool::WorkerPool;
use crate::config::AdiConfig;
use crate::database::{connect_pool, Migrator};
use crate::error::{AdiError, Result};
use crate::omero::OmeroCliGateway;
use crate::state_machine::Stage;
use crate::tracker::IngestTracker;

/// Run the service until a shutdown signal arrives. Errors returned here
/// are fatal boot errors; the caller exits non-zero.
pub async fn run(config: AdiConfig) -> Result<()> {
    let pool = connect_pool(&config.ingest_tracking_db, config.max_workers).await?;
    Migrator::default().run(&pool).await?;

    let tracker = IngestTracker::new(pool.clone());
    recover_dangling_orders(&tracker).await?;

    let gateway = Arc::new(OmeroCliGateway::from_env()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline = Arc::new(OrderPipeline::new(
        config.clone(),
        tracker.clone(),
        gateway,
        shutdown_rx.clone(),
    ));

    let worker_pool = WorkerPool::new(config.max_workers);
    let poller = DatabasePoller::new(
        tracker,
        pipeline,
        config.poll_interval(),
        shutdown_rx,
    );
    let poller_handle = tokio::spawn(poller.run(worker_pool, config.shutdown_timeout()));

    info!("service ready, waiting for upload orders");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller_handle.await {
        warn!(error = %e, "poller task ended abnormally");
    }

    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Orders left in `Import Started` by a previous run can have no worker;
/// fail each one exactly once so producers can resubmit.
///
/// Recovery is not serialized across replicas, so another instance booting
/// at the same time may fail an order first. Its terminal event makes our
/// write a stage-machine rejection, which is the expected outcome here, not
/// a boot failure.
pub async fn recover_dangling_orders(tracker: &IngestTracker) -> Result<()> {
    let dangling = tracker.list_dangling().await?;
    if dangling.is_empty() {
        return Ok(());
    }

    warn!(count = dangling.len(), "failing dangling orders from previous run");
    for uuid in dangling {
        match tracker
            .record(uuid, Stage::ImportFailed, Some("stale order at service startup"))
            .await
        {
            Ok(_) => info!(uuid = %uuid, "dangling order failed"),
            Err(AdiError::StageTransition { .. }) => {
                info!(uuid = %uuid, "dangling order already recovered by another instance");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler, relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
