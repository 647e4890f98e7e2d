//! Persistence-layer records for the ingestion queue.

pub mod order;
pub mod preprocessing;

pub use order::{DestinationType, NewOrder, OrderRecord};
pub use preprocessing::PreprocessingSpec;
