//! Batch archival
//!
//! Every processed batch is packed into one timestamp-named tar.gz under the
//! backup directory. The originals are removed only after the archive is
//! fully written and flushed; any failure before that leaves every source
//! file in place for a retry or manual inspection.

use crate::error::{PipelineError, Result};
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Naming format of the per-run archive, e.g. `20240101@061500.tar.gz`.
const STAMP_FORMAT: &str = "%Y%m%d@%H%M%S";

/// Archive every file under `source_dir` into `backup_dir`, then delete the
/// originals. Returns the path of the created archive.
pub fn archive_batch(source_dir: &Path, backup_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir).map_err(|e| {
        PipelineError::Archive(format!("cannot create {}: {e}", backup_dir.display()))
    })?;

    let files = collect_files(source_dir)?;
    let stamp = Local::now().format(STAMP_FORMAT).to_string();
    let archive_path = backup_dir.join(format!("{stamp}.tar.gz"));

    write_archive(&archive_path, source_dir, &files)?;

    // Archive-then-delete: originals go away only once the archive is safe.
    for file in &files {
        fs::remove_file(file).map_err(|e| {
            PipelineError::Archive(format!("cannot remove {}: {e}", file.display()))
        })?;
    }

    info!(
        archive = %archive_path.display(),
        files = files.len(),
        "batch archived and originals removed"
    );
    Ok(archive_path)
}

fn collect_files(source_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(source_dir) {
        let entry = entry
            .map_err(|e| PipelineError::Archive(format!("cannot walk source dir: {e}")))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn write_archive(archive_path: &Path, source_dir: &Path, files: &[PathBuf]) -> Result<()> {
    let file = File::create(archive_path).map_err(|e| {
        PipelineError::Archive(format!("cannot create {}: {e}", archive_path.display()))
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in files {
        let relative = path.strip_prefix(source_dir).unwrap_or(path);
        builder
            .append_path_with_name(path, relative)
            .map_err(|e| {
                PipelineError::Archive(format!("cannot append {}: {e}", path.display()))
            })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| PipelineError::Archive(format!("cannot finish archive: {e}")))?;
    let file = encoder
        .finish()
        .map_err(|e| PipelineError::Archive(format!("cannot finish compression: {e}")))?;
    file.sync_all()
        .map_err(|e| PipelineError::Archive(format!("cannot flush archive: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::write(dir.join("METER1_A@1.csv"), "a,b,c").unwrap();
        fs::write(dir.join("METER2_B@1.csv"), "d,e,f").unwrap();
        let nested = dir.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("METER3_C@1.csv"), "g,h,i").unwrap();
    }

    fn file_count(dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn archives_recursively_and_removes_originals() {
        let source = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        populate(source.path());

        let archive = archive_batch(source.path(), backup.path()).unwrap();

        assert!(archive.exists());
        assert_eq!(file_count(source.path()), 0);

        // Entry names are relative to the source directory.
        let tar_gz = File::open(&archive).unwrap();
        let mut reader = tar::Archive::new(GzDecoder::new(tar_gz));
        let names: BTreeSet<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains("METER1_A@1.csv"));
        assert!(names.contains("METER2_B@1.csv"));
        assert!(names.contains("nested/METER3_C@1.csv"));
    }

    #[test]
    fn archive_name_carries_the_run_stamp() {
        let source = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        fs::write(source.path().join("M@1.csv"), "x").unwrap();

        let archive = archive_batch(source.path(), backup.path()).unwrap();
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        // YYYYMMDD@HHMMSS.tar.gz
        assert_eq!(name.len(), "20240101@061500.tar.gz".len());
        assert!(name.ends_with(".tar.gz"));
        assert_eq!(name.as_bytes()[8], b'@');
    }

    #[test]
    fn creates_backup_dir_when_absent() {
        let source = TempDir::new().unwrap();
        let backup_root = TempDir::new().unwrap();
        fs::write(source.path().join("M@1.csv"), "x").unwrap();

        let backup = backup_root.path().join("deep").join("backup");
        let archive = archive_batch(source.path(), &backup).unwrap();
        assert!(archive.starts_with(&backup));
    }

    #[test]
    fn failure_leaves_source_files_intact() {
        let source = TempDir::new().unwrap();
        let blocker = TempDir::new().unwrap();
        populate(source.path());
        let before = file_count(source.path());

        // A regular file where the backup directory should go makes
        // create_dir_all fail before anything is written.
        let backup = blocker.path().join("occupied");
        fs::write(&backup, "in the way").unwrap();

        let err = archive_batch(source.path(), &backup);
        assert!(matches!(err, Err(PipelineError::Archive(_))));
        assert_eq!(file_count(source.path()), before);
    }
}
