//! Orchestration: the poller/worker machinery that drains the order queue,
//! and the service lifecycle around it.

pub mod bootstrap;
pub mod poller;
pub mod worker;
pub mod worker_pool;

pub use poller::DatabasePoller;
pub use worker::OrderPipeline;
pub use worker_pool::WorkerPool;
