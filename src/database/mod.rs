//! Database pool construction and schema migrations.

pub mod connection;
pub mod migrations;

pub use connection::connect_pool;
pub use migrations::Migrator;
