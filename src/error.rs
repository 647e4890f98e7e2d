//! Service-level and per-order error types.
//!
//! `AdiError` covers infrastructure failures (configuration, database,
//! subprocess plumbing). `PipelineError` covers the per-order failure kinds
//! that end up as a single `Import Failed` event; its `Display` output is the
//! one-line message recorded on that event.

use thiserror::Error;

/// Errors raised by the service infrastructure.
#[derive(Debug, Error)]
pub enum AdiError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid stage transition for {uuid}: {from} -> {to}")]
    StageTransition {
        uuid: uuid::Uuid,
        from: String,
        to: String,
    },

    #[error("OMERO gateway error: {0}")]
    Gateway(String),

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdiError {
    /// Whether a retry against the database may succeed. Transport-level
    /// failures are transient; integrity violations and stage-machine
    /// rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AdiError::Database(err) => is_transient_db_error(err),
            _ => false,
        }
    }
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => {
            // Connection-class SQLSTATEs (08xxx) are transient; constraint
            // violations (23xxx) and friends are not.
            db.code().map(|c| c.starts_with("08")).unwrap_or(false)
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, AdiError>;

/// Per-order failure kinds. One of these becomes the terminal
/// `Import Failed` event for the attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ORDER_INVALID: {0}")]
    OrderInvalid(String),

    #[error("PREPROCESS_FAILED: {0}")]
    PreprocessFailed(String),

    #[error("IMPORT_FAILED: {0}")]
    ImportFailed(String),

    #[error("REWIRE_FAILED: {0}")]
    RewireFailed(String),

    #[error("TRANSIENT_DB: {0}")]
    TransientDb(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::OrderInvalid(_) => "ORDER_INVALID",
            PipelineError::PreprocessFailed(_) => "PREPROCESS_FAILED",
            PipelineError::ImportFailed(_) => "IMPORT_FAILED",
            PipelineError::RewireFailed(_) => "REWIRE_FAILED",
            PipelineError::TransientDb(_) => "TRANSIENT_DB",
        }
    }
}

impl From<AdiError> for PipelineError {
    fn from(err: AdiError) -> Self {
        if err.is_transient() {
            return PipelineError::TransientDb(err.to_string());
        }
        match err {
            AdiError::Gateway(msg) => PipelineError::ImportFailed(msg),
            other => PipelineError::ImportFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_messages_carry_kind_prefix() {
        let err = PipelineError::OrderInvalid("destination_type 'Folder' not allowed".into());
        assert_eq!(
            err.to_string(),
            "ORDER_INVALID: destination_type 'Folder' not allowed"
        );
        assert_eq!(err.kind(), "ORDER_INVALID");
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = AdiError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn gateway_error_is_not_transient() {
        let err = AdiError::Gateway("session expired".into());
        assert!(!err.is_transient());
    }
}
