//! Bounded pool of order executors.
//!
//! A semaphore caps concurrency at `max_workers`; each submitted order runs
//! as its own tokio task holding one permit. The pool size is the hard
//! upper bound on concurrent OMERO sessions and container runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            tasks: JoinSet::new(),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Whether a free executor slot exists right now.
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Discard results of tasks that already finished.
    pub fn reap_finished(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }

    /// Spawn an order task. The permit is taken synchronously when one is
    /// free, so `has_capacity` stays accurate for the poller's next tick;
    /// an over-submitted task waits on the semaphore and the bound holds
    /// either way.
    pub fn submit<F>(&mut self, order_task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.tasks.spawn(async move {
                    let _permit = permit;
                    order_task.await;
                });
            }
            Err(_) => {
                let semaphore = Arc::clone(&self.semaphore);
                self.tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("worker pool semaphore never closes");
                    order_task.await;
                });
            }
        }
    }

    /// Join in-flight workers up to the grace deadline, then abandon the
    /// rest. Abandoned orders surface as dangling on the next startup.
    pub async fn shutdown(mut self, grace: Duration) {
        let in_flight = self.tasks.len();
        if in_flight == 0 {
            return;
        }
        info!(in_flight, grace_secs = grace.as_secs(), "waiting for workers");

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("grace deadline reached, abandoning in-flight workers");
        }
    }
}
