//! Order validation.
//!
//! Normalises a raw claimed queue row into a [`ValidatedOrder`]: shape
//! checks, filesystem checks on every input path, and identity resolution
//! against the repository. Validation failures are terminal for the
//! attempt and surface as `ORDER_INVALID`.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{DestinationType, OrderRecord};
use crate::omero::OmeroGateway;

/// A fully checked order, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct ValidatedOrder {
    pub uuid: Uuid,
    pub user_name: String,
    pub group_name: String,
    pub user_id: i64,
    pub group_id: i64,
    pub destination_type: DestinationType,
    pub destination_id: i64,
    pub files: Vec<PathBuf>,
    pub preprocessing_id: Option<i64>,
}

pub struct OrderValidator<'a> {
    gateway: &'a dyn OmeroGateway,
}

impl<'a> OrderValidator<'a> {
    pub fn new(gateway: &'a dyn OmeroGateway) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, record), fields(uuid = %record.uuid))]
    pub async fn validate(&self, record: &OrderRecord) -> Result<ValidatedOrder, PipelineError> {
        let destination_type: DestinationType = record
            .destination_type
            .parse()
            .map_err(PipelineError::OrderInvalid)?;

        let destination_id: i64 = record.destination_id.trim().parse().map_err(|_| {
            PipelineError::OrderInvalid(format!(
                "destination_id '{}' is not an integer",
                record.destination_id
            ))
        })?;
        if destination_id < 0 {
            return Err(PipelineError::OrderInvalid(format!(
                "destination_id {destination_id} is negative"
            )));
        }

        let files = record.file_paths();
        if files.is_empty() {
            return Err(PipelineError::OrderInvalid("order has no files".into()));
        }
        for path in &files {
            if !path.is_absolute() {
                return Err(PipelineError::OrderInvalid(format!(
                    "path '{}' is not absolute",
                    path.display()
                )));
            }
            check_readable(path)?;
        }

        let user_id = self
            .gateway
            .resolve_user(&record.user_name)
            .await
            .map_err(|e| PipelineError::OrderInvalid(e.to_string()))?
            .ok_or_else(|| {
                PipelineError::OrderInvalid(format!("unknown user '{}'", record.user_name))
            })?;

        let group_id = self
            .gateway
            .resolve_group(&record.group_name)
            .await
            .map_err(|e| PipelineError::OrderInvalid(e.to_string()))?
            .ok_or_else(|| {
                PipelineError::OrderInvalid(format!("unknown group '{}'", record.group_name))
            })?;

        let member = self
            .gateway
            .is_member(&record.user_name, &record.group_name)
            .await
            .map_err(|e| PipelineError::OrderInvalid(e.to_string()))?;
        if !member {
            return Err(PipelineError::OrderInvalid(format!(
                "user '{}' is not a member of group '{}'",
                record.user_name, record.group_name
            )));
        }

        debug!(
            user_id,
            group_id,
            files = files.len(),
            "order validated"
        );

        Ok(ValidatedOrder {
            uuid: record.uuid,
            user_name: record.user_name.clone(),
            group_name: record.group_name.clone(),
            user_id,
            group_id,
            destination_type,
            destination_id,
            files,
            preprocessing_id: record.preprocessing_id,
        })
    }
}

/// The path must exist and be readable by the service account. Opening is
/// the only reliable readability check.
fn check_readable(path: &std::path::Path) -> Result<(), PipelineError> {
    let metadata = fs::metadata(path).map_err(|e| {
        PipelineError::OrderInvalid(format!("path '{}' is not accessible: {e}", path.display()))
    })?;

    let readable = if metadata.is_dir() {
        fs::read_dir(path).is_ok()
    } else {
        fs::File::open(path).is_ok()
    };
    if !readable {
        return Err(PipelineError::OrderInvalid(format!(
            "path '{}' is not readable",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as AdiResult;
    use crate::omero::{ObjectRef, OmeroSession};
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubGateway {
        known_user: Option<&'static str>,
        known_group: Option<&'static str>,
        member: bool,
    }

    #[async_trait]
    impl OmeroGateway for StubGateway {
        async fn resolve_user(&self, user_name: &str) -> AdiResult<Option<i64>> {
            Ok((self.known_user == Some(user_name)).then_some(7))
        }
        async fn resolve_group(&self, group_name: &str) -> AdiResult<Option<i64>> {
            Ok((self.known_group == Some(group_name)).then_some(3))
        }
        async fn is_member(&self, _user: &str, _group: &str) -> AdiResult<bool> {
            Ok(self.member)
        }
        async fn destination_exists(&self, _d: DestinationType, _id: i64) -> AdiResult<bool> {
            Ok(true)
        }
        async fn open_session(&self, _u: &str, _g: &str, _ttl: u64) -> AdiResult<OmeroSession> {
            unimplemented!("not used by validation")
        }
        async fn close_session(&self, _s: &OmeroSession) -> AdiResult<()> {
            Ok(())
        }
        async fn annotate(
            &self,
            _s: &OmeroSession,
            _o: &ObjectRef,
            _ns: &str,
            _p: &[(String, String)],
        ) -> AdiResult<()> {
            Ok(())
        }
    }

    fn record_with(files: Vec<String>, destination_type: &str, destination_id: &str) -> OrderRecord {
        OrderRecord {
            id: 1,
            uuid: Uuid::new_v4(),
            stage: "Import Started".to_string(),
            group_name: "Demo".to_string(),
            user_name: "researcher".to_string(),
            destination_id: destination_id.to_string(),
            destination_type: destination_type.to_string(),
            files: sqlx::types::Json(files),
            file_names: None,
            error_message: None,
            timestamp: Utc::now(),
            preprocessing_id: None,
        }
    }

    fn happy_gateway() -> StubGateway {
        StubGateway {
            known_user: Some("researcher"),
            known_group: Some("Demo"),
            member: true,
        }
    }

    #[tokio::test]
    async fn valid_order_passes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.tif");
        fs::write(&file, b"data").unwrap();

        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(
            vec![file.to_string_lossy().into_owned()],
            "Dataset",
            "151",
        );

        let validated = validator.validate(&record).await.unwrap();
        assert_eq!(validated.destination_type, DestinationType::Dataset);
        assert_eq!(validated.destination_id, 151);
        assert_eq!(validated.user_id, 7);
        assert_eq!(validated.group_id, 3);
        assert_eq!(validated.files, vec![file]);
    }

    #[tokio::test]
    async fn unknown_destination_type_fails() {
        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec!["/tmp/x".into()], "Folder", "1");

        let err = validator.validate(&record).await.unwrap_err();
        assert_eq!(err.kind(), "ORDER_INVALID");
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec!["/nonexistent/file.tif".into()], "Dataset", "1");

        let err = validator.validate(&record).await.unwrap_err();
        assert!(err.to_string().contains("not accessible"));
    }

    #[tokio::test]
    async fn relative_path_fails() {
        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec!["relative/x.tif".into()], "Dataset", "1");

        let err = validator.validate(&record).await.unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }

    #[tokio::test]
    async fn empty_file_list_fails() {
        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec![], "Dataset", "1");

        let err = validator.validate(&record).await.unwrap_err();
        assert!(err.to_string().contains("no files"));
    }

    #[tokio::test]
    async fn non_member_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.tif");
        fs::write(&file, b"data").unwrap();

        let gateway = StubGateway {
            member: false,
            ..happy_gateway()
        };
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec![file.to_string_lossy().into_owned()], "Dataset", "1");

        let err = validator.validate(&record).await.unwrap_err();
        assert!(err.to_string().contains("not a member"));
    }

    #[tokio::test]
    async fn negative_destination_id_fails() {
        let gateway = happy_gateway();
        let validator = OrderValidator::new(&gateway);
        let record = record_with(vec!["/tmp".into()], "Dataset", "-5");

        let err = validator.validate(&record).await.unwrap_err();
        assert!(err.to_string().contains("negative"));
    }
}
