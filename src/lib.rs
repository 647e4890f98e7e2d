//! # omero-adi
//!
//! Automated data import service for an OMERO installation: a PostgreSQL
//! backed queue of upload orders, a bounded worker pool that drives each
//! order through validation, optional container preprocessing and an
//! in-place CLI import, and an event-sourced progress log that doubles as
//! the audit trail.

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod execution;
pub mod import;
pub mod logging;
pub mod models;
pub mod omero;
pub mod orchestration;
pub mod preprocess;
pub mod state_machine;
pub mod tracker;
pub mod validation;

pub use config::AdiConfig;
pub use error::{AdiError, PipelineError, Result};
pub use state_machine::Stage;
pub use tracker::IngestTracker;
