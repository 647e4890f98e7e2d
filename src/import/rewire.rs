//! Post-import symlink rewiring.
//!
//! After an in-place import of preprocessed files, the repository's managed
//! tree holds symlinks into the order's fast-local staging directory. This
//! module re-points each of them at the corresponding shared-storage path
//! (the `.processed/` subtree), so the staging area can be reclaimed and
//! the bytes live exactly once, on shared storage.
//!
//! Replacement is create-new-then-rename: the repository never observes a
//! missing link, at worst a briefly stale one.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::preprocess::StagedFile;

/// Outcome of a rewiring pass.
#[derive(Debug, Default, PartialEq)]
pub struct RewireReport {
    pub replaced: usize,
}

/// Re-point every managed symlink that targets `staging_dir` at its
/// shared-storage counterpart.
///
/// Exact staged-pair matches win; any other target under the staging
/// directory falls back to a prefix swap onto the `.processed` root derived
/// from the staged pairs. A target with no counterpart fails the pass, and
/// the staging directory is left in place for inspection.
#[instrument(skip(staged), fields(managed_root = %managed_root.display()))]
pub fn rewire_staged_symlinks(
    managed_root: &Path,
    staging_dir: &Path,
    staged: &[StagedFile],
) -> Result<RewireReport, PipelineError> {
    let exact: HashMap<&Path, &Path> = staged
        .iter()
        .map(|s| (s.alt_path.as_path(), s.full_path.as_path()))
        .collect();
    let processed_root = derive_processed_root(staging_dir, staged);

    let mut report = RewireReport::default();

    for entry in WalkDir::new(managed_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path_is_symlink())
    {
        let link = entry.path();
        let target = match fs::read_link(link) {
            Ok(target) => target,
            Err(e) => {
                warn!(link = %link.display(), error = %e, "unreadable symlink, skipping");
                continue;
            }
        };
        if !target.starts_with(staging_dir) {
            continue;
        }

        let new_target = match exact.get(target.as_path()) {
            Some(full) => full.to_path_buf(),
            None => {
                let rel = target
                    .strip_prefix(staging_dir)
                    .expect("target verified under staging_dir");
                match &processed_root {
                    Some(root) => root.join(rel),
                    None => {
                        return Err(PipelineError::RewireFailed(format!(
                            "no shared-storage counterpart for staged target '{}'",
                            target.display()
                        )))
                    }
                }
            }
        };

        replace_symlink(link, &new_target).map_err(|e| {
            PipelineError::RewireFailed(format!(
                "replacing '{}' -> '{}': {e}",
                link.display(),
                new_target.display()
            ))
        })?;
        debug!(link = %link.display(), target = %new_target.display(), "symlink rewired");
        report.replaced += 1;
    }

    info!(replaced = report.replaced, "symlink rewiring complete");
    Ok(report)
}

/// Delete the order's staging directory after a fully successful rewiring
/// pass.
pub fn remove_staging_dir(staging_dir: &Path) -> Result<(), PipelineError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir).map_err(|e| {
            PipelineError::RewireFailed(format!(
                "removing staging directory '{}': {e}",
                staging_dir.display()
            ))
        })?;
    }
    Ok(())
}

/// The shared `.processed` root implied by the staged pairs: the pair's
/// `full_path` minus its path relative to the staging directory.
fn derive_processed_root(staging_dir: &Path, staged: &[StagedFile]) -> Option<PathBuf> {
    staged.iter().find_map(|pair| {
        let rel = pair.alt_path.strip_prefix(staging_dir).ok()?;
        let full = pair.full_path.to_string_lossy();
        let suffix = format!("/{}", rel.to_string_lossy());
        full.strip_suffix(suffix.as_str())
            .map(|root| PathBuf::from(root))
    })
}

/// Atomic replacement: create the new link under a temporary name in the
/// same directory, then rename over the old one.
fn replace_symlink(link: &Path, new_target: &Path) -> std::io::Result<()> {
    let dir = link.parent().unwrap_or_else(|| Path::new("."));
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "link".to_string());
    let tmp = dir.join(format!(".{name}.adi-rewire"));

    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }
    symlink(new_target, &tmp)?;
    fs::rename(&tmp, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(alt: &Path, full: &Path) -> StagedFile {
        StagedFile {
            name: alt
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            full_path: full.to_path_buf(),
            alt_path: alt.to_path_buf(),
            keyvalues: Vec::new(),
        }
    }

    #[test]
    fn staged_symlinks_are_repointed_and_counted() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("OMERO_inplace/uuid-1");
        let managed = root.path().join("ManagedRepository/researcher_7/d");
        let shared = root.path().join("data/group/.processed");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&managed).unwrap();
        fs::create_dir_all(&shared).unwrap();

        let alt_file = staging.join("plate.ome.tiff");
        let full_file = shared.join("plate.ome.tiff");
        fs::write(&alt_file, b"pixels").unwrap();
        fs::write(&full_file, b"pixels").unwrap();

        let link = managed.join("plate.ome.tiff");
        symlink(&alt_file, &link).unwrap();
        // A link to something else entirely must survive untouched.
        let outside = root.path().join("data/group/raw.tif");
        fs::write(&outside, b"raw").unwrap();
        let other_link = managed.join("raw.tif");
        symlink(&outside, &other_link).unwrap();

        let report = rewire_staged_symlinks(
            root.path().join("ManagedRepository").as_path(),
            &staging,
            &[staged(&alt_file, &full_file)],
        )
        .unwrap();

        assert_eq!(report.replaced, 1);
        assert_eq!(fs::read_link(&link).unwrap(), full_file);
        assert_eq!(fs::read_link(&other_link).unwrap(), outside);
        // The replaced link resolves.
        assert_eq!(fs::read(&link).unwrap(), b"pixels");
    }

    #[test]
    fn unmatched_target_falls_back_to_prefix_swap() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("OMERO_inplace/uuid-2");
        let managed = root.path().join("ManagedRepository");
        let shared = root.path().join("data/group/.processed");
        fs::create_dir_all(staging.join("well")).unwrap();
        fs::create_dir_all(&managed).unwrap();
        fs::create_dir_all(shared.join("well")).unwrap();

        let listed = staging.join("plate.ome.tiff");
        fs::write(&listed, b"x").unwrap();
        let companion = staging.join("well/field1.tiff");
        fs::write(&companion, b"y").unwrap();

        let link = managed.join("field1.tiff");
        symlink(&companion, &link).unwrap();

        let report = rewire_staged_symlinks(
            &managed,
            &staging,
            &[staged(&listed, &shared.join("plate.ome.tiff"))],
        )
        .unwrap();

        assert_eq!(report.replaced, 1);
        assert_eq!(fs::read_link(&link).unwrap(), shared.join("well/field1.tiff"));
    }

    #[test]
    fn missing_counterpart_fails_and_preserves_staging() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("OMERO_inplace/uuid-3");
        let managed = root.path().join("ManagedRepository");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&managed).unwrap();

        let orphan = staging.join("orphan.tiff");
        fs::write(&orphan, b"x").unwrap();
        symlink(&orphan, managed.join("orphan.tiff")).unwrap();

        // No staged pairs at all: nothing to derive a processed root from.
        let err = rewire_staged_symlinks(&managed, &staging, &[]).unwrap_err();
        assert_eq!(err.kind(), "REWIRE_FAILED");
        assert!(staging.exists());
    }

    #[test]
    fn staging_removal_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("OMERO_inplace/uuid-4");
        fs::create_dir_all(&staging).unwrap();

        remove_staging_dir(&staging).unwrap();
        assert!(!staging.exists());
        remove_staging_dir(&staging).unwrap();
    }
}
