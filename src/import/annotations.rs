//! Annotation assembly for imported objects.
//!
//! Each object gets one map annotation merging the base pairs (order uuid,
//! source path), an optional `metadata.csv` sidecar (two columns, first row
//! is a header), and the keyvalues the preprocessor reported.

use std::path::Path;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::PROCESSED_SUBDIR;

/// Read a `key,value` CSV sidecar. The first row is a header and is
/// skipped; rows without exactly two fields are ignored.
pub fn read_metadata_csv(path: &Path) -> Vec<(String, String)> {
    let mut reader = match csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
    {
        Ok(reader) => reader,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open metadata sidecar");
            return Vec::new();
        }
    };

    let mut pairs = Vec::new();
    for record in reader.records() {
        match record {
            Ok(row) if row.len() == 2 => {
                let key = row[0].to_string();
                if !key.is_empty() {
                    pairs.push((key, row[1].to_string()));
                }
            }
            Ok(row) => warn!(path = %path.display(), ?row, "ignoring malformed metadata row"),
            Err(e) => warn!(path = %path.display(), error = %e, "metadata sidecar read error"),
        }
    }
    pairs
}

/// Assemble the full annotation set for one imported object.
///
/// `source` is the path recorded on the annotation (the shared-storage path
/// for preprocessed files). The sidecar is looked up next to `source` and
/// in its `.processed/` subdirectory.
pub fn collect(
    uuid: &Uuid,
    source: &Path,
    metadata_file: &str,
    keyvalues: &[(String, String)],
) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("UUID".to_string(), uuid.to_string()),
        ("Filepath".to_string(), source.display().to_string()),
    ];

    if let Some(dir) = source.parent() {
        let candidates = [
            dir.join(metadata_file),
            dir.join(PROCESSED_SUBDIR).join(metadata_file),
        ];
        if let Some(sidecar) = candidates.iter().find(|p| p.is_file()) {
            debug!(path = %sidecar.display(), "reading metadata sidecar");
            pairs.extend(read_metadata_csv(sidecar));
        }
    }

    pairs.extend(keyvalues.iter().cloned());
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn csv_header_is_skipped_and_rows_collected() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("metadata.csv");
        fs::write(&sidecar, "key,value\nstain,DAPI\nmagnification,40x\n").unwrap();

        let pairs = read_metadata_csv(&sidecar);
        assert_eq!(
            pairs,
            vec![
                ("stain".to_string(), "DAPI".to_string()),
                ("magnification".to_string(), "40x".to_string())
            ]
        );
    }

    #[test]
    fn malformed_rows_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = dir.path().join("metadata.csv");
        fs::write(&sidecar, "key,value\nonlyone\na,b,c\nok,fine\n").unwrap();

        let pairs = read_metadata_csv(&sidecar);
        assert_eq!(pairs, vec![("ok".to_string(), "fine".to_string())]);
    }

    #[test]
    fn collect_merges_base_sidecar_and_keyvalues() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("x.tif");
        fs::write(&source, b"img").unwrap();
        fs::write(dir.path().join("metadata.csv"), "key,value\nstain,GFP\n").unwrap();

        let uuid = Uuid::new_v4();
        let keyvalues = vec![("round".to_string(), "2".to_string())];
        let pairs = collect(&uuid, &source, "metadata.csv", &keyvalues);

        assert_eq!(pairs[0], ("UUID".to_string(), uuid.to_string()));
        assert_eq!(pairs[1].0, "Filepath");
        assert!(pairs.contains(&("stain".to_string(), "GFP".to_string())));
        assert!(pairs.contains(&("round".to_string(), "2".to_string())));
    }

    #[test]
    fn collect_finds_sidecar_in_processed_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let processed = dir.path().join(".processed");
        fs::create_dir(&processed).unwrap();
        fs::write(processed.join("metadata.csv"), "key,value\nplate,P1\n").unwrap();
        let source = dir.path().join("plate.db");
        fs::write(&source, b"db").unwrap();

        let pairs = collect(&Uuid::new_v4(), &source, "metadata.csv", &[]);
        assert!(pairs.contains(&("plate".to_string(), "P1".to_string())));
    }

    #[test]
    fn missing_sidecar_yields_base_pairs_only() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("x.tif");
        fs::write(&source, b"img").unwrap();

        let pairs = collect(&Uuid::new_v4(), &source, "metadata.csv", &[]);
        assert_eq!(pairs.len(), 2);
    }
}
