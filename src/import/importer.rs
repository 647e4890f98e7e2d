//! Import CLI orchestration.
//!
//! One session per order, one CLI invocation per input path, identifiers
//! collected from stdout. When preprocessing ran, the inputs are the staged
//! `alt_path`s and the managed symlinks are rewired to shared storage after
//! the CLI finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::config::AdiConfig;
use crate::constants::{cli_err_file, cli_log_file, ANNOTATION_NS, MANAGED_REPO_DIR};
use crate::error::PipelineError;
use crate::execution::CapturedCommand;
use crate::models::DestinationType;
use crate::omero::{ObjectRef, OmeroGateway, OmeroSession};
use crate::preprocess::{Preprocessor, StagedFile};
use crate::validation::ValidatedOrder;
use crate::import::{annotations, rewire};

pub struct Importer {
    config: AdiConfig,
    gateway: Arc<dyn OmeroGateway>,
}

impl Importer {
    pub fn new(config: AdiConfig, gateway: Arc<dyn OmeroGateway>) -> Self {
        Self { config, gateway }
    }

    /// Import a validated order. `staged` is `Some` when preprocessing ran;
    /// its entries replace the order's own files as CLI inputs.
    #[instrument(skip(self, order, staged), fields(uuid = %order.uuid))]
    pub async fn import_order(
        &self,
        order: &ValidatedOrder,
        staged: Option<&[StagedFile]>,
    ) -> Result<(), PipelineError> {
        let exists = self
            .gateway
            .destination_exists(order.destination_type, order.destination_id)
            .await
            .map_err(|e| PipelineError::ImportFailed(e.to_string()))?;
        if !exists {
            return Err(PipelineError::ImportFailed(format!(
                "{} {} does not exist",
                order.destination_type, order.destination_id
            )));
        }

        let session = self
            .gateway
            .open_session(&order.user_name, &order.group_name, self.config.ttl_for_user_conn)
            .await
            .map_err(|e| PipelineError::ImportFailed(e.to_string()))?;

        let result = self.import_with_session(&session, order, staged).await;

        if let Err(e) = self.gateway.close_session(&session).await {
            warn!(uuid = %order.uuid, error = %e, "session close failed");
        }

        result
    }

    async fn import_with_session(
        &self,
        session: &OmeroSession,
        order: &ValidatedOrder,
        staged: Option<&[StagedFile]>,
    ) -> Result<(), PipelineError> {
        let inputs: Vec<PathBuf> = match staged {
            Some(staged) => staged.iter().map(|s| s.alt_path.clone()).collect(),
            None => order.files.clone(),
        };

        // (input, imported objects) pairs; ids drive rewiring and metadata.
        let mut imported: Vec<(PathBuf, Vec<ObjectRef>)> = Vec::new();
        for input in inputs {
            let objects = self.run_import_cli(session, order, &input).await?;
            // A clean exit without identifiers means nothing was imported.
            if objects.is_empty() {
                return Err(PipelineError::ImportFailed(format!(
                    "import CLI produced no object identifiers for {}",
                    input.display()
                )));
            }
            info!(
                uuid = %order.uuid,
                input = %input.display(),
                objects = objects.len(),
                "import CLI finished"
            );
            imported.push((input, objects));
        }

        if let Some(staged) = staged {
            let preprocessor = Preprocessor::new(&self.config.omero_data_root);
            let staging = preprocessor.staging_dir(&order.uuid);
            let managed_root = Path::new(&self.config.omero_data_root).join(MANAGED_REPO_DIR);

            rewire::rewire_staged_symlinks(&managed_root, &staging, staged)?;
            rewire::remove_staging_dir(&staging)?;
        }

        self.annotate_imported(session, order, staged, &imported)
            .await;

        Ok(())
    }

    /// Invoke the CLI for one input and collect the identifiers it prints.
    async fn run_import_cli(
        &self,
        session: &OmeroSession,
        order: &ValidatedOrder,
        input: &Path,
    ) -> Result<Vec<ObjectRef>, PipelineError> {
        let command = if self.config.use_register_zarr && is_zarr(input) {
            self.build_register_zarr_command(session, order, input)
        } else {
            self.build_import_command(session, order, input)
        };

        let output = command
            .run()
            .await
            .map_err(|e| PipelineError::ImportFailed(e.to_string()))?;

        if !output.success() {
            return Err(PipelineError::ImportFailed(format!(
                "import CLI exited with status {:?} for {}",
                output.status_code,
                input.display()
            )));
        }

        Ok(output
            .stdout
            .lines()
            .flat_map(ObjectRef::parse_line)
            .collect())
    }

    /// Argument list mirrors the repository's import plugin; the CLI writes
    /// its own log and error files keyed by the order uuid.
    fn build_import_command(
        &self,
        session: &OmeroSession,
        order: &ValidatedOrder,
        input: &Path,
    ) -> CapturedCommand {
        let mut command = CapturedCommand::new("omero")
            .arg("import")
            .args(["-s", &session.host, "-p", &session.port.to_string()])
            .args(["-k", &session.key])
            .arg("--transfer=ln_s")
            .args(["--file", &cli_log_file(&order.uuid)])
            .args(["--errs", &cli_err_file(&order.uuid)]);

        if let Some(n) = self.config.parallel_upload_per_worker {
            command = command.args(["--parallel-upload", &n.to_string()]);
        }
        if let Some(n) = self.config.parallel_filesets_per_worker {
            command = command.args(["--parallel-fileset", &n.to_string()]);
        }

        if self.config.skip_all {
            command = command.args(["--skip", "all"]);
        } else {
            if self.config.skip_checksum {
                command = command.args(["--skip", "checksum"]);
            }
            if self.config.skip_minmax {
                command = command.args(["--skip", "minmax"]);
            }
            if self.config.skip_thumbnails {
                command = command.args(["--skip", "thumbnails"]);
            }
            if self.config.skip_upgrade {
                command = command.args(["--skip", "upgrade"]);
            }
        }

        if input.is_dir() {
            command = command.args(["--depth", "10"]);
        }

        command = match order.destination_type {
            // Screens take the plate import route.
            DestinationType::Screen => command.args(["-r", &order.destination_id.to_string()]),
            DestinationType::Dataset => command.args(["-d", &order.destination_id.to_string()]),
        };

        command.arg(input.display().to_string())
    }

    /// The zarr-register code path: metadata-only registration of an
    /// OME-Zarr tree, linked to the destination.
    fn build_register_zarr_command(
        &self,
        session: &OmeroSession,
        order: &ValidatedOrder,
        input: &Path,
    ) -> CapturedCommand {
        CapturedCommand::new("omero")
            .arg("register-zarr")
            .args(["-s", &session.host, "-p", &session.port.to_string()])
            .args(["-k", &session.key])
            .args(["--target", &order.destination_id.to_string()])
            .arg(input.display().to_string())
    }

    /// Best-effort metadata pass; annotation problems are logged, never
    /// fatal for an already-imported order.
    async fn annotate_imported(
        &self,
        session: &OmeroSession,
        order: &ValidatedOrder,
        staged: Option<&[StagedFile]>,
        imported: &[(PathBuf, Vec<ObjectRef>)],
    ) {
        for (input, objects) in imported {
            let (source, keyvalues) = match staged {
                Some(staged) => match staged.iter().find(|s| &s.alt_path == input) {
                    Some(entry) => (entry.full_path.clone(), entry.keyvalues.clone()),
                    None => (input.clone(), Vec::new()),
                },
                None => (input.clone(), Vec::new()),
            };

            let pairs =
                annotations::collect(&order.uuid, &source, &self.config.metadata_file, &keyvalues);

            for object in objects {
                if let Err(e) = self
                    .gateway
                    .annotate(session, object, ANNOTATION_NS, &pairs)
                    .await
                {
                    error!(
                        uuid = %order.uuid,
                        object = %object,
                        error = %e,
                        "annotation failed"
                    );
                }
            }
        }
    }
}

fn is_zarr(input: &Path) -> bool {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with(".zarr") || name.ends_with(".ome.zarr")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as AdiResult;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullGateway;

    #[async_trait]
    impl OmeroGateway for NullGateway {
        async fn resolve_user(&self, _u: &str) -> AdiResult<Option<i64>> {
            Ok(Some(1))
        }
        async fn resolve_group(&self, _g: &str) -> AdiResult<Option<i64>> {
            Ok(Some(1))
        }
        async fn is_member(&self, _u: &str, _g: &str) -> AdiResult<bool> {
            Ok(true)
        }
        async fn destination_exists(&self, _d: DestinationType, _id: i64) -> AdiResult<bool> {
            Ok(true)
        }
        async fn open_session(&self, _u: &str, _g: &str, _t: u64) -> AdiResult<OmeroSession> {
            Ok(test_session())
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

    fn test_session() -> OmeroSession {
        OmeroSession {
            key: "sess-key".into(),
            host: "omero.example".into(),
            port: 4064,
            user_name: "researcher".into(),
            group_name: "Demo".into(),
        }
    }

    fn test_config() -> AdiConfig {
        serde_yaml::from_str("ingest_tracking_db: \"postgresql://x/y\"\n").unwrap()
    }

    fn test_order(destination_type: DestinationType) -> ValidatedOrder {
        ValidatedOrder {
            uuid: Uuid::new_v4(),
            user_name: "researcher".into(),
            group_name: "Demo".into(),
            user_id: 7,
            group_id: 3,
            destination_type,
            destination_id: 151,
            files: vec![PathBuf::from("/data/g/x.tif")],
            preprocessing_id: None,
        }
    }

    fn importer_with(config: AdiConfig) -> Importer {
        Importer::new(config, Arc::new(NullGateway))
    }

    #[test]
    fn dataset_import_command_shape() {
        let importer = importer_with(test_config());
        let order = test_order(DestinationType::Dataset);
        let rendered = importer
            .build_import_command(&test_session(), &order, Path::new("/data/g/x.tif"))
            .render();

        assert!(rendered.starts_with("omero import"));
        assert!(rendered.contains("-s omero.example -p 4064 -k sess-key"));
        assert!(rendered.contains("--transfer=ln_s"));
        assert!(rendered.contains(&format!("--file logs/cli.{}.logs", order.uuid)));
        assert!(rendered.contains(&format!("--errs logs/cli.{}.errs", order.uuid)));
        assert!(rendered.contains("-d 151"));
        assert!(rendered.ends_with("/data/g/x.tif"));
        assert!(!rendered.contains("--skip"));
        assert!(!rendered.contains("--depth"));
    }

    #[test]
    fn screen_import_targets_with_r_flag() {
        let importer = importer_with(test_config());
        let order = test_order(DestinationType::Screen);
        let rendered = importer
            .build_import_command(&test_session(), &order, Path::new("/data/g/plate.db"))
            .render();
        assert!(rendered.contains("-r 151"));
        assert!(!rendered.contains("-d 151"));
    }

    #[test]
    fn skip_all_wins_over_individual_skips() {
        let mut config = test_config();
        config.skip_all = true;
        config.skip_checksum = true;

        let importer = importer_with(config);
        let order = test_order(DestinationType::Dataset);
        let rendered = importer
            .build_import_command(&test_session(), &order, Path::new("/data/g/x.tif"))
            .render();
        assert!(rendered.contains("--skip all"));
        assert!(!rendered.contains("--skip checksum"));
    }

    #[test]
    fn individual_skips_and_parallel_flags_are_forwarded() {
        let mut config = test_config();
        config.skip_checksum = true;
        config.skip_upgrade = true;
        config.parallel_upload_per_worker = Some(2);
        config.parallel_filesets_per_worker = Some(1);

        let importer = importer_with(config);
        let order = test_order(DestinationType::Dataset);
        let rendered = importer
            .build_import_command(&test_session(), &order, Path::new("/data/g/x.tif"))
            .render();
        assert!(rendered.contains("--parallel-upload 2"));
        assert!(rendered.contains("--parallel-fileset 1"));
        assert!(rendered.contains("--skip checksum"));
        assert!(rendered.contains("--skip upgrade"));
        assert!(!rendered.contains("--skip all"));
    }

    #[test]
    fn zarr_inputs_select_the_register_path() {
        assert!(is_zarr(Path::new("/data/g/plate.ome.zarr")));
        assert!(is_zarr(Path::new("/data/g/img.zarr")));
        assert!(!is_zarr(Path::new("/data/g/x.tif")));

        let mut config = test_config();
        config.use_register_zarr = true;
        let importer = importer_with(config);
        let order = test_order(DestinationType::Dataset);
        let rendered = importer
            .build_register_zarr_command(&test_session(), &order, Path::new("/data/g/p.ome.zarr"))
            .render();
        assert!(rendered.starts_with("omero register-zarr"));
        assert!(rendered.contains("--target 151"));
    }
}
