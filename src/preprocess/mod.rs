//! # Preprocessor
//!
//! Runs the order's preprocessing container once per input file and
//! materialises the derived inputs the importer will consume.
//!
//! Each run bind-mounts the file's parent directory (shared storage) at the
//! spec's `output_folder` and the uuid-scoped fast-local staging directory
//! at `alt_output_folder`. The container announces its results as a JSON
//! array on the last non-empty stdout line; when that is missing or
//! malformed, a recursive scan of the staging directory stands in.
//!
//! The returned [`StagedFile`] list replaces the order's original files for
//! the importer: `alt_path` is imported, `full_path` is where the managed
//! symlinks are re-pointed afterwards, `keyvalues` become annotations.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::constants::{cli_err_file, cli_log_file, DEFAULT_REGISTRY, INPLACE_STAGING_DIR, PROCESSED_SUBDIR};
use crate::error::PipelineError;
use crate::execution::{CapturedCommand, MountSpec};
use crate::models::PreprocessingSpec;

/// Token in `input_file` (and extra-param values) replaced with the
/// container-side path of the current file.
const FILES_TOKEN: &str = "{Files}";

/// One derived input produced by a preprocessing container.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub name: String,
    /// Path on shared storage the managed symlink will ultimately point at.
    pub full_path: PathBuf,
    /// Path on fast-local storage that is actually imported.
    pub alt_path: PathBuf,
    pub keyvalues: Vec<(String, String)>,
}

/// Structured tail element as emitted by the container.
#[derive(Debug, Deserialize)]
struct TailEntry {
    name: String,
    full_path: String,
    alt_path: String,
    #[serde(default)]
    keyvalues: Vec<serde_json::Map<String, serde_json::Value>>,
}

pub struct Preprocessor {
    omero_data_root: PathBuf,
}

impl Preprocessor {
    pub fn new(omero_data_root: impl Into<PathBuf>) -> Self {
        Self {
            omero_data_root: omero_data_root.into(),
        }
    }

    /// Fast-local staging directory for an order.
    pub fn staging_dir(&self, uuid: &Uuid) -> PathBuf {
        self.omero_data_root
            .join(INPLACE_STAGING_DIR)
            .join(uuid.to_string())
    }

    /// Run the container for every input file and collect the staged
    /// results.
    #[instrument(skip(self, spec, files), fields(uuid = %uuid, container = %spec.container))]
    pub async fn run(
        &self,
        uuid: &Uuid,
        spec: &PreprocessingSpec,
        files: &[PathBuf],
    ) -> Result<Vec<StagedFile>, PipelineError> {
        let staging = self.staging_dir(uuid);
        fs::create_dir_all(&staging).map_err(|e| {
            PipelineError::PreprocessFailed(format!(
                "cannot create staging directory {}: {e}",
                staging.display()
            ))
        })?;

        let log_file = PathBuf::from(cli_log_file(uuid));
        let err_file = PathBuf::from(cli_err_file(uuid));

        let mut staged = Vec::new();
        for file in files {
            let command = self.build_command(uuid, spec, file)?;
            info!(file = %file.display(), "running preprocessing container");

            let output = command
                .run_with_logs(&log_file, &err_file)
                .await
                .map_err(|e| PipelineError::PreprocessFailed(e.to_string()))?;

            if !output.success() {
                return Err(PipelineError::PreprocessFailed(format!(
                    "container exited with status {:?} for {}",
                    output.status_code,
                    file.display()
                )));
            }

            let parent = file_parent(file)?;
            let alt_root = spec.alt_output_folder.as_deref().unwrap_or_default();
            match output
                .stdout_tail()
                .and_then(|t| parse_tail(t, &parent, alt_root, &staging))
            {
                Some(entries) if !entries.is_empty() => {
                    debug!(count = entries.len(), "structured tail parsed");
                    staged.extend(entries);
                }
                _ => {
                    warn!(file = %file.display(), "no structured tail, scanning staging directory");
                    staged.extend(scan_staging(&staging, &parent));
                }
            }
        }

        // Repeated staging scans may surface the same file more than once.
        let mut seen = std::collections::HashSet::new();
        staged.retain(|entry| seen.insert(entry.alt_path.clone()));
        if staged.is_empty() {
            return Err(PipelineError::PreprocessFailed(
                "preprocessing produced no files".into(),
            ));
        }
        Ok(staged)
    }

    /// Build the container invocation for one input file.
    pub fn build_command(
        &self,
        uuid: &Uuid,
        spec: &PreprocessingSpec,
        file: &Path,
    ) -> Result<CapturedCommand, PipelineError> {
        let alt_output_folder = spec.alt_output_folder.as_deref().ok_or_else(|| {
            PipelineError::PreprocessFailed("preprocessing row has no alt_output_folder".into())
        })?;

        let parent = file_parent(file)?;
        let basename = file
            .file_name()
            .ok_or_else(|| {
                PipelineError::PreprocessFailed(format!("path '{}' has no file name", file.display()))
            })?
            .to_string_lossy();

        // The parent directory is mounted at `output_folder`, so this is the
        // file's path as seen inside the container.
        let container_input = format!("{}/{}", spec.output_folder.trim_end_matches('/'), basename);
        let substituted_input = spec.input_file.replace(FILES_TOKEN, &container_input);

        let image = if spec.container.contains('/') {
            spec.container.clone()
        } else {
            format!("{DEFAULT_REGISTRY}{}", spec.container)
        };

        let userns = std::env::var("PODMAN_USERNS_MODE").unwrap_or_else(|_| "keep-id".to_string());

        let mounts = [
            MountSpec::new(&parent, &spec.output_folder),
            MountSpec::new(self.staging_dir(uuid), alt_output_folder),
        ];

        let mut command = CapturedCommand::new("podman")
            .args(["run", "--rm"])
            .arg(format!("--userns={userns}"));
        for mount in &mounts {
            command = command.arg("-v").arg(mount.as_volume_arg());
        }
        command = command.arg(image);
        for (key, value) in spec.extra_params_vec() {
            command = command
                .arg(format!("--{key}"))
                .arg(value.replace(FILES_TOKEN, &container_input));
        }
        command = command
            .args(["--inputfile", &substituted_input])
            .args(["--outputfolder", &spec.output_folder])
            .args(["--altoutputfolder", alt_output_folder]);

        Ok(command)
    }
}

fn file_parent(file: &Path) -> Result<PathBuf, PipelineError> {
    file.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            PipelineError::PreprocessFailed(format!(
                "path '{}' has no parent directory",
                file.display()
            ))
        })
}

/// Parse the structured tail. Relative `full_path` values resolve against
/// the source file's parent directory; `alt_path` values are container-side
/// paths under `alt_root` and are translated onto the host staging
/// directory.
fn parse_tail(
    tail: &str,
    parent: &Path,
    alt_root: &str,
    staging: &Path,
) -> Option<Vec<StagedFile>> {
    let entries: Vec<TailEntry> = serde_json::from_str(tail).ok()?;
    Some(
        entries
            .into_iter()
            .map(|entry| {
                let full_path = if Path::new(&entry.full_path).is_absolute() {
                    PathBuf::from(&entry.full_path)
                } else {
                    parent.join(&entry.full_path)
                };
                let alt_path = match Path::new(&entry.alt_path).strip_prefix(alt_root) {
                    Ok(rel) if !alt_root.is_empty() => staging.join(rel),
                    _ => PathBuf::from(&entry.alt_path),
                };
                let keyvalues = entry
                    .keyvalues
                    .iter()
                    .flat_map(|map| map.iter())
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect();
                StagedFile {
                    name: entry.name,
                    full_path,
                    alt_path,
                    keyvalues,
                }
            })
            .collect(),
    )
}

/// Fallback: every regular file under the staging directory becomes a
/// staged entry with a `.processed/` shared-storage counterpart.
fn scan_staging(staging: &Path, parent: &Path) -> Vec<StagedFile> {
    let processed_root = parent.join(PROCESSED_SUBDIR);
    WalkDir::new(staging)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(staging).ok()?;
            Some(StagedFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                full_path: processed_root.join(rel),
                alt_path: entry.path().to_path_buf(),
                keyvalues: Vec::new(),
            })
        })
        .collect()
}
