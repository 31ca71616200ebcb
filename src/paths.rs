//! Input path resolution.
//!
//! CSV inputs may be named as individual files, directories of files, or a
//! mix; unreadable entries are logged and skipped so one bad path does not
//! abort a long-running job. Parquet inputs are always a single directory,
//! and an empty listing there is fatal.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("parquet file(s) not found under {}", dir.display())]
    ParquetNotFound { dir: PathBuf },
    #[error("failed to list {}: {source}", dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Expand user-supplied data paths into a flat file list.
///
/// Files pass through as-is; directories contribute their (non-hidden) files
/// in sorted order, recursing when asked. Paths that cannot be read are
/// skipped with a warning instead of failing the run.
pub fn resolve_data_paths(paths: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    let mut resolved = Vec::new();
    for path in paths {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => resolved.push(path.clone()),
            Ok(meta) if meta.is_dir() => resolved.extend(expand_dir(path, recursive)),
            Ok(_) => warn!("skipping {}: not a regular file or directory", path.display()),
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    resolved
}

fn expand_dir(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    let walk = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name();
    for entry in walk {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                if is_hidden(entry.file_name()) {
                    continue;
                }
                files.push(entry.into_path());
            }
            Ok(_) => {}
            Err(err) => warn!("skipping an entry under {}: {err}", dir.display()),
        }
    }
    files
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// List the `*.parquet` files directly under `dir`, sorted by name.
///
/// An empty result is an error: a transform or analyse pointed at a
/// directory with no parquet data is a misconfiguration, not a no-op.
pub fn list_parquet_files(dir: &Path) -> Result<Vec<PathBuf>, PathError> {
    let entries = fs::read_dir(dir).map_err(|source| PathError::List {
        dir: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PathError::List {
            dir: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file
            && !is_hidden(&entry.file_name())
            && path.extension().is_some_and(|ext| ext == "parquet")
        {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(PathError::ParquetNotFound {
            dir: dir.to_path_buf(),
        });
    }
    Ok(files)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn files_pass_through_and_missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let day0 = dir.path().join("day_0.csv");
        touch(&day0);
        let missing = dir.path().join("day_1.csv");
        let resolved = resolve_data_paths(&[day0.clone(), missing], false);
        assert_eq!(resolved, vec![day0]);
    }

    #[test]
    fn directories_expand_sorted_without_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("day_1.csv"));
        touch(&dir.path().join("day_0.csv"));
        touch(&dir.path().join(".crc"));
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested").join("day_2.csv"));

        let flat = resolve_data_paths(&[dir.path().to_path_buf()], false);
        assert_eq!(
            flat,
            vec![dir.path().join("day_0.csv"), dir.path().join("day_1.csv")]
        );

        let deep = resolve_data_paths(&[dir.path().to_path_buf()], true);
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("nested").join("day_2.csv")));
    }

    #[test]
    fn mixed_files_and_directories_keep_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        let lone = dir.path().join("z_lone.csv");
        touch(&lone);
        let sub = dir.path().join("days");
        std::fs::create_dir(&sub).unwrap();
        touch(&sub.join("day_0.csv"));
        let resolved = resolve_data_paths(&[lone.clone(), sub.clone()], false);
        assert_eq!(resolved, vec![lone, sub.join("day_0.csv")]);
    }

    #[test]
    fn parquet_listing_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["part_00001.parquet", "part_00000.parquet", "notes.txt"] {
            let mut f = File::create(dir.path().join(name)).unwrap();
            f.write_all(b"x").unwrap();
        }
        let files = list_parquet_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("part_00000.parquet"),
                dir.path().join("part_00001.parquet"),
            ]
        );
    }

    #[test]
    fn empty_parquet_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = list_parquet_files(dir.path()).unwrap_err();
        assert!(matches!(err, PathError::ParquetNotFound { .. }));
        assert!(err.to_string().contains("parquet file(s) not found"));
    }

    #[test]
    fn missing_parquet_directory_reports_listing_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let err = list_parquet_files(&gone).unwrap_err();
        assert!(matches!(err, PathError::List { .. }));
    }
}
