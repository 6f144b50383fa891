//! Storage locations and filesystem helpers.
//!
//! Everything that touches the filesystem goes through this module: the
//! source directory listing used for file discovery, Parquet segment writes,
//! and the commit-log primitives (`write_new` for per-version uniqueness,
//! `write_atomic` for the `CURRENT` pointer).
//!
//! Only the local filesystem is supported. Paths handed to these helpers are
//! always relative to a [`StorageLocation`] root so callers never concatenate
//! strings by hand.

mod error;

pub use error::{BackendError, StorageError};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use crate::storage::error::{InvalidLocationSnafu, OtherIoSnafu};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root of a directory the pipeline reads from or writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a location for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// Parse a user-facing location string.
    ///
    /// Accepts plain paths and `file://` URLs; other schemes are rejected.
    pub fn parse(spec: &str) -> StorageResult<Self> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return InvalidLocationSnafu {
                spec: spec.to_string(),
                reason: "location is empty".to_string(),
            }
            .fail();
        }

        if let Some(path) = trimmed.strip_prefix("file://") {
            return Ok(StorageLocation::local(path));
        }

        if let Some((scheme, _)) = trimmed.split_once("://") {
            return InvalidLocationSnafu {
                spec: spec.to_string(),
                reason: format!("scheme '{scheme}' is not supported"),
            }
            .fail();
        }

        Ok(StorageLocation::local(trimmed))
    }

    /// Root path of this location.
    pub fn root(&self) -> &Path {
        match self {
            StorageLocation::Local(root) => root,
        }
    }

    /// Join a relative path onto this location.
    pub fn join(&self, rel: &Path) -> PathBuf {
        match self {
            StorageLocation::Local(root) => root.join(rel),
        }
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Local(root) => write!(f, "{}", root.display()),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| StorageError::classify(path.display().to_string(), BackendError::Local(e))
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort; we are already on an error path.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` with write-to-temp, fsync, rename.
///
/// Readers observe either the old file or the complete new one.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(io_err(&tmp_path))?;
        file.write_all(contents)
            .await
            .map_err(io_err(&tmp_path))?;
        file.sync_all().await.map_err(io_err(&tmp_path))?;
    }

    fs::rename(&tmp_path, &abs).await.map_err(io_err(&abs))?;
    guard.disarm();

    Ok(())
}

/// Create a *new* file at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if the file is already there.
///
/// Used for commit files, segment files and the run lock.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(io_err(&abs))?;

    file.write_all(contents).await.map_err(io_err(&abs))?;
    file.sync_all().await.map_err(io_err(&abs))?;

    Ok(())
}

/// Read a file under `location` as UTF-8 text.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);
    fs::read_to_string(&abs).await.map_err(io_err(&abs))
}

/// Read the full contents of a file under `location`.
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    fs::read(&abs).await.map_err(io_err(&abs))
}

/// Remove a single file. A missing file is not an error.
pub async fn remove_file(location: &StorageLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.join(rel_path);
    match fs::remove_file(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&abs)(e)),
    }
}

/// Remove the whole location root recursively. A missing root is not an error.
pub async fn remove_root(location: &StorageLocation) -> StorageResult<()> {
    let abs = location.root();
    match fs::remove_dir_all(abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(abs)(e)),
    }
}

/// A regular file found while listing a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the listed root, `/`-separated.
    pub rel_path: String,
    /// File length in bytes.
    pub size: u64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively list the regular files under `location`.
///
/// Entries whose name starts with `.` or `_` (and everything below such
/// directories) are skipped. The result is sorted by `rel_path`.
///
/// The root must exist and be a directory; otherwise this returns
/// [`StorageError::NotFound`].
pub async fn list_files(location: &StorageLocation) -> StorageResult<Vec<FileEntry>> {
    let root = location.root();
    let meta = fs::metadata(root).await.map_err(io_err(root))?;
    if !meta.is_dir() {
        let synthetic = std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory");
        return Err(io_err(root)(synthetic));
    }

    let mut out = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(rel_dir) = pending.pop() {
        let abs_dir = root.join(&rel_dir);
        let mut entries = fs::read_dir(&abs_dir).await.map_err(io_err(&abs_dir))?;

        while let Some(entry) = entries.next_entry().await.map_err(io_err(&abs_dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                continue;
            }

            let rel = rel_dir.join(&name);
            let abs = entry.path();
            let meta = fs::metadata(&abs).await.map_err(io_err(&abs))?;

            if meta.is_dir() {
                pending.push(rel);
            } else if meta.is_file() {
                let modified_ms = meta
                    .modified()
                    .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                    .unwrap_or(0);
                out.push(FileEntry {
                    rel_path: rel_string(&rel),
                    size: meta.len(),
                    modified_ms,
                });
            }
        }
    }

    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}
