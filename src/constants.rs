//! Well-known names shared across the service.

/// Directory under the OMERO data root used for fast-local staging of
/// preprocessing output, scoped per order uuid.
pub const INPLACE_STAGING_DIR: &str = "OMERO_inplace";

/// The repository's managed file tree under the OMERO data root.
pub const MANAGED_REPO_DIR: &str = "ManagedRepository";

/// Reserved subdirectory of a source file's parent directory where
/// preprocessing results land on shared storage.
pub const PROCESSED_SUBDIR: &str = ".processed";

/// Namespace for map annotations attached to imported objects.
pub const ANNOTATION_NS: &str = "omeroadi.import";

/// Default registry prefix applied to bare container image references.
pub const DEFAULT_REGISTRY: &str = "docker.io/";

/// Directory for the service log and the per-order import CLI logs.
pub const LOG_DIR: &str = "logs";

/// Per-order import CLI log file, keyed by order uuid.
pub fn cli_log_file(uuid: &uuid::Uuid) -> String {
    format!("{LOG_DIR}/cli.{uuid}.logs")
}

/// Per-order import CLI error file, keyed by order uuid.
pub fn cli_err_file(uuid: &uuid::Uuid) -> String {
    format!("{LOG_DIR}/cli.{uuid}.errs")
}
