//! # Importer
//!
//! Drives the repository's import CLI per order: session handling,
//! destination checks, CLI invocation with captured output, object-id
//! parsing, post-import symlink rewiring and metadata annotation.

pub mod annotations;
pub mod importer;
pub mod rewire;

pub use importer::Importer;
