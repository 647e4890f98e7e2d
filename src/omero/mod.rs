//! The seam to the external image repository.
//!
//! Everything the service needs from OMERO — identity resolution,
//! destination existence, sudo'd sessions, map annotations — goes through
//! the [`OmeroGateway`] trait. The production implementation shells out to
//! the `omero` CLI; tests substitute a mock.

pub mod cli_gateway;
pub mod gateway;

pub use cli_gateway::OmeroCliGateway;
pub use gateway::{ObjectRef, OmeroGateway, OmeroSession};
