use serde::{Deserialize, Serialize};
use std::fmt;

/// Order lifecycle stages.
///
/// The persisted strings are part of the queue's public contract with its
/// producers and are kept verbatim for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Written by producers when an order is enqueued.
    ImportPending,
    /// Written by the poller when a worker claims the order.
    ImportStarted,
    /// Terminal: the import finished and all post-steps succeeded.
    ImportCompleted,
    /// Terminal: any pipeline step failed, or the order went stale.
    ImportFailed,
}

impl Stage {
    /// Check if this is a terminal stage (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ImportCompleted | Self::ImportFailed)
    }

    /// Whether the machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::ImportPending, Stage::ImportStarted)
                | (Stage::ImportStarted, Stage::ImportCompleted)
                | (Stage::ImportStarted, Stage::ImportFailed)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImportPending => write!(f, "Import Pending"),
            Self::ImportStarted => write!(f, "Import Started"),
            Self::ImportCompleted => write!(f, "Import Completed"),
            Self::ImportFailed => write!(f, "Import Failed"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Import Pending" => Ok(Self::ImportPending),
            "Import Started" => Ok(Self::ImportStarted),
            "Import Completed" => Ok(Self::ImportCompleted),
            "Import Failed" => Ok(Self::ImportFailed),
            _ => Err(format!("Invalid stage: {s}")),
        }
    }
}
