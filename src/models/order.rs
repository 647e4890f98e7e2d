//! Order event rows.
//!
//! The `imports` table is append-only: one row per progress event, all rows
//! of a uuid carrying the full order payload. The maximum-`(timestamp, id)`
//! row is the authoritative current stage. The JSON `files` blob is an
//! encoding detail of the persistence boundary; in memory the file list is
//! an ordered `Vec<PathBuf>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::state_machine::Stage;

/// Allowed import destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationType {
    Dataset,
    Screen,
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dataset => write!(f, "Dataset"),
            Self::Screen => write!(f, "Screen"),
        }
    }
}

impl std::str::FromStr for DestinationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dataset" => Ok(Self::Dataset),
            "Screen" => Ok(Self::Screen),
            _ => Err(format!("Invalid destination type: {s}")),
        }
    }
}

/// One event row of the `imports` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub stage: String,
    pub group_name: String,
    pub user_name: String,
    pub destination_id: String,
    pub destination_type: String,
    /// Ordered list of absolute paths, preserved verbatim across events.
    pub files: sqlx::types::Json<Vec<String>>,
    pub file_names: Option<sqlx::types::Json<Vec<String>>>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub preprocessing_id: Option<i64>,
}

impl OrderRecord {
    /// Typed view of the stage column.
    pub fn stage(&self) -> Result<Stage, String> {
        self.stage.parse()
    }

    /// The order's file list as paths.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.0.iter().map(PathBuf::from).collect()
    }
}

/// Producer-side payload for a new order, written at `Import Pending`.
/// The production producer is an external tool; this type backs tests and
/// operator tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub uuid: Uuid,
    pub group_name: String,
    pub user_name: String,
    pub destination_id: String,
    pub destination_type: String,
    pub files: Vec<String>,
    pub file_names: Option<Vec<String>>,
    pub preprocessing: Option<crate::models::preprocessing::NewPreprocessing>,
}
