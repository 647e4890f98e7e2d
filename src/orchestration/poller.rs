//! # Poller
//!
//! Single loop that scans for pending orders and dispatches them to the
//! worker pool. Each tick: skip when the pool is saturated, otherwise claim
//! one order and submit it. The claim call is the only external I/O the
//! poller performs; everything slow happens inside workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use super::worker::OrderPipeline;
use super::worker_pool::WorkerPool;
use crate::tracker::IngestTracker;

pub struct DatabasePoller {
    tracker: IngestTracker,
    pipeline: Arc<OrderPipeline>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DatabasePoller {
    pub fn new(
        tracker: IngestTracker,
        pipeline: Arc<OrderPipeline>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tracker,
            pipeline,
            poll_interval,
            shutdown,
        }
    }

    /// Run until shutdown, then drain the pool within `grace`.
    pub async fn run(mut self, mut pool: WorkerPool, grace: Duration) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            max_workers = pool.max_workers(),
            "poller started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            pool.reap_finished();

            if !pool.has_capacity() {
                self.sleep_one_interval().await;
                continue;
            }

            match self.tracker.claim_next().await {
                Ok(Some(order)) => {
                    let pipeline = Arc::clone(&self.pipeline);
                    pool.submit(async move {
                        pipeline.process(order).await;
                    });
                    // Claim again immediately; there may be more pending.
                }
                Ok(None) => self.sleep_one_interval().await,
                Err(e) => {
                    // Retries are already exhausted inside the tracker.
                    error!(error = %e, "claim failed");
                    self.sleep_one_interval().await;
                }
            }
        }

        info!("poller stopped claiming, draining workers");
        pool.shutdown(grace).await;
    }

    async fn sleep_one_interval(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}
