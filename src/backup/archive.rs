// Archive builder: zips the dump as `database.sql` plus, optionally, the uploads tree under
// `uploads/`, then hashes the finished archive.

use crate::error::BackupError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

const DUMP_ENTRY: &str = "database.sql";
const UPLOADS_PREFIX: &str = "uploads";
const HASH_BUF: usize = 64 * 1024;
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// SHA-256 of the archive, lowercase hex.
    pub checksum: String,
    pub size_bytes: u64,
    /// Files added from the uploads tree.
    pub files_added: u64,
    /// False when uploads were requested but the directory does not exist.
    pub uploads_included: bool,
}

/// Build the archive on the blocking pool. `skip_dir` (the agent's work dir) is left out
/// of the uploads walk so the archive never contains its own temp files.
pub async fn build_archive(
    sql_path: PathBuf,
    zip_path: PathBuf,
    uploads_dir: Option<PathBuf>,
    skip_dir: Option<PathBuf>,
) -> Result<ArchiveSummary, BackupError> {
    tokio::task::spawn_blocking(move || {
        build_archive_blocking(
            &sql_path,
            &zip_path,
            uploads_dir.as_deref(),
            skip_dir.as_deref(),
        )
    })
    .await
    .map_err(|e| BackupError::Archive(format!("archive task join: {}", e)))?
}

fn build_archive_blocking(
    sql_path: &Path,
    zip_path: &Path,
    uploads_dir: Option<&Path>,
    skip_dir: Option<&Path>,
) -> Result<ArchiveSummary, BackupError> {
    let zip_err = |e: zip::result::ZipError| BackupError::Archive(e.to_string());

    let file = File::create(zip_path).map_err(|e| {
        BackupError::Archive(format!("failed to create {}: {}", zip_path.display(), e))
    })?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let dir_options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file(DUMP_ENTRY, options).map_err(zip_err)?;
    let mut dump = File::open(sql_path).map_err(|e| {
        BackupError::Archive(format!("failed to add {} to archive: {}", DUMP_ENTRY, e))
    })?;
    std::io::copy(&mut dump, &mut zip)?;

    let mut files_added = 0;
    let mut uploads_included = false;
    if let Some(root) = uploads_dir {
        if root.is_dir() {
            uploads_included = true;
            let skip = skip_dir.and_then(|p| p.canonicalize().ok());
            let walk = WalkDir::new(root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_skipped(e, skip.as_deref()));
            for entry in walk {
                let entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .map_err(|e| BackupError::Archive(e.to_string()))?;
                let name = entry_name(relative);
                if entry.file_type().is_dir() {
                    zip.add_directory(name, dir_options).map_err(zip_err)?;
                } else if entry.file_type().is_file() {
                    zip.start_file(name.as_str(), options).map_err(zip_err)?;
                    let mut src = File::open(entry.path()).map_err(|e| {
                        BackupError::Archive(format!(
                            "failed to add file to archive: {}: {}",
                            relative.display(),
                            e
                        ))
                    })?;
                    std::io::copy(&mut src, &mut zip)?;
                    files_added += 1;
                    if files_added % PROGRESS_EVERY == 0 {
                        debug!(files_added, "adding uploads to archive");
                    }
                }
            }
            info!(files_added, "uploads directory archived");
        } else {
            info!(dir = %root.display(), "uploads directory not found, skipping");
        }
    }
    zip.finish().map_err(zip_err)?;

    Ok(ArchiveSummary {
        checksum: sha256_file(zip_path)?,
        size_bytes: std::fs::metadata(zip_path)?.len(),
        files_added,
        uploads_included,
    })
}

fn is_skipped(entry: &walkdir::DirEntry, skip: Option<&Path>) -> bool {
    match skip {
        Some(skip) if entry.file_type().is_dir() => entry
            .path()
            .canonicalize()
            .is_ok_and(|p| p == skip),
        _ => false,
    }
}

/// `uploads/<relative path>` with forward slashes on every platform.
fn entry_name(relative: &Path) -> String {
    let mut name = String::from(UPLOADS_PREFIX);
    for part in relative.components() {
        name.push('/');
        name.push_str(&part.as_os_str().to_string_lossy());
    }
    name
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::with_capacity(HASH_BUF, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Total size of regular files under `dir`; 0 when it does not exist.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(zip_path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn archive_contains_dump_and_uploads_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sql = dir.path().join("backup-1.sql");
        std::fs::write(&sql, "INSERT INTO t VALUES (1);\n").unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(uploads.join("2024/05")).unwrap();
        std::fs::write(uploads.join("2024/05/a.jpg"), [1u8; 300]).unwrap();
        std::fs::write(uploads.join("index.html"), "").unwrap();

        let zip_path = dir.path().join("backup-1.zip");
        let summary = build_archive(sql, zip_path.clone(), Some(uploads), None)
            .await
            .unwrap();

        assert_eq!(summary.files_added, 2);
        assert!(summary.uploads_included);
        assert_eq!(summary.size_bytes, std::fs::metadata(&zip_path).unwrap().len());
        assert_eq!(summary.checksum, sha256_hex(&std::fs::read(&zip_path).unwrap()));
        assert_eq!(
            names(&zip_path),
            vec![
                "database.sql",
                "uploads/2024/",
                "uploads/2024/05/",
                "uploads/2024/05/a.jpg",
                "uploads/index.html",
            ]
        );
    }

    #[tokio::test]
    async fn missing_uploads_dir_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sql = dir.path().join("d.sql");
        std::fs::write(&sql, "x").unwrap();
        let summary = build_archive(
            sql,
            dir.path().join("d.zip"),
            Some(dir.path().join("missing")),
            None,
        )
        .await
        .unwrap();
        assert!(!summary.uploads_included);
        assert_eq!(names(&dir.path().join("d.zip")), vec!["database.sql"]);
    }

    #[tokio::test]
    async fn missing_dump_fails_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_archive(
            dir.path().join("nope.sql"),
            dir.path().join("x.zip"),
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::Archive(_)));
    }

    #[tokio::test]
    async fn work_dir_inside_uploads_is_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let work_dir = uploads.join("errorvault-backups");
        let tmp = work_dir.join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(uploads.join("a.jpg"), [7u8; 64]).unwrap();
        std::fs::write(work_dir.join("backup.log"), "[2024-05-01 10:00:00] Starting\n").unwrap();
        let sql = tmp.join("backup-1.sql");
        std::fs::write(&sql, "INSERT INTO t VALUES (1);\n").unwrap();
        let zip_path = tmp.join("backup-1.zip");

        let summary = build_archive(sql, zip_path.clone(), Some(uploads), Some(work_dir))
            .await
            .unwrap();

        assert_eq!(summary.files_added, 1);
        assert_eq!(names(&zip_path), vec!["database.sql", "uploads/a.jpg"]);
    }

    #[test]
    fn directory_size_sums_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("sub/b"), [0u8; 5]).unwrap();
        assert_eq!(directory_size(dir.path()), 15);
        assert_eq!(directory_size(&dir.path().join("missing")), 0);
    }
}
