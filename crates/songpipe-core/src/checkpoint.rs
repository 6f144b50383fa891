//! Durable record of which source files were ingested.
//!
//! The checkpoint is a commit log of [`CheckpointAction`]s under its own
//! root, next to an optional run lock:
//!
//! ```text
//! <checkpoint_root>/
//!   _ingest_log/CURRENT
//!   _ingest_log/0000000001.json    # Init { source }, RecordFiles { .. }
//!   RUN.lock
//! ```
//!
//! A file identity is present iff all of its rows were committed to the
//! output table before the identity was recorded.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    commit_log::{CommitError, CommitLog},
    storage::{self, FileEntry, StorageError, StorageLocation},
};

/// Directory holding the checkpoint commit log.
pub const INGEST_LOG_DIR: &str = "_ingest_log";
/// Name of the run lock file.
pub const RUN_LOCK_FILE: &str = "RUN.lock";

/// Errors from the checkpoint store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckpointError {
    /// Any error from the checkpoint commit log.
    #[snafu(display("Checkpoint log error: {source}"))]
    CheckpointLog {
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Storage error outside the commit log (lock file, reset).
    #[snafu(display("Checkpoint storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Another run holds the lock.
    #[snafu(display("Another ingestion run holds {path}"))]
    AlreadyRunning {
        /// Path of the lock file.
        path: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// The log replays into an invalid state.
    #[snafu(display("Corrupt checkpoint: {msg}"))]
    CorruptCheckpoint {
        /// What was wrong.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// Identity of a processed source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    /// File length in bytes when it was listed.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

impl From<&FileEntry> for FileIdentity {
    fn from(entry: &FileEntry) -> Self {
        FileIdentity {
            path: entry.rel_path.clone(),
            size: entry.size,
            modified_ms: entry.modified_ms,
        }
    }
}

/// How a listed file is matched against the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintMode {
    /// Seen if the path was recorded.
    #[serde(rename = "path")]
    PathOnly,
    /// Seen only if path, size and modification time all match.
    #[default]
    PathSizeMtime,
}

impl FingerprintMode {
    /// String form accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            FingerprintMode::PathOnly => "path",
            FingerprintMode::PathSizeMtime => "path-size-mtime",
        }
    }
}

impl fmt::Display for FingerprintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FingerprintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "path" => Ok(FingerprintMode::PathOnly),
            "path-size-mtime" => Ok(FingerprintMode::PathSizeMtime),
            other => Err(format!(
                "unknown fingerprint mode {other:?} (expected \"path\" or \"path-size-mtime\")"
            )),
        }
    }
}

/// Actions recorded in the checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointAction {
    /// Bind the checkpoint to a source root.
    Init {
        /// Source root, as displayed by its storage location.
        source: String,
    },
    /// Files whose rows were committed at `table_version`.
    RecordFiles {
        /// Identities of the ingested files.
        files: Vec<FileIdentity>,
        /// Table version that holds their rows.
        table_version: u64,
    },
}

/// Checkpoint state rebuilt by replaying the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointState {
    /// Log version the state was replayed up to (0 when fresh).
    pub version: u64,
    /// Source root recorded by `Init`.
    pub source: Option<String>,
    /// Latest identity per relative path.
    pub files: BTreeMap<String, FileIdentity>,
    /// Table version of the latest `RecordFiles`.
    pub last_table_version: Option<u64>,
}

impl CheckpointState {
    /// Rebuild state from actions in commit order.
    pub fn replay<'a>(
        version: u64,
        actions: impl IntoIterator<Item = &'a CheckpointAction>,
    ) -> Result<Self, CheckpointError> {
        let mut state = CheckpointState {
            version,
            ..Default::default()
        };

        for action in actions {
            match action {
                CheckpointAction::Init { source } => {
                    if let Some(existing) = &state.source {
                        return CorruptCheckpointSnafu {
                            msg: format!("second Init for {source}; already bound to {existing}"),
                        }
                        .fail();
                    }
                    state.source = Some(source.clone());
                }
                CheckpointAction::RecordFiles {
                    files,
                    table_version,
                } => {
                    for f in files {
                        state.files.insert(f.path.clone(), f.clone());
                    }
                    state.last_table_version = Some(*table_version);
                }
            }
        }

        Ok(state)
    }

    /// True if `file` counts as already ingested under `mode`.
    pub fn contains(&self, file: &FileIdentity, mode: FingerprintMode) -> bool {
        match (self.files.get(&file.path), mode) {
            (None, _) => false,
            (Some(_), FingerprintMode::PathOnly) => true,
            (Some(seen), FingerprintMode::PathSizeMtime) => seen == file,
        }
    }

    /// Number of distinct paths recorded.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Exclusive marker for one ingestion run.
///
/// Dropping the guard removes the lock file on a best-effort basis; prefer
/// [`RunLock::release`].
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    held: bool,
}

impl RunLock {
    /// Create the lock file under `location`.
    ///
    /// Fails with `AlreadyRunning` if the file exists.
    pub async fn acquire(location: &StorageLocation) -> Result<Self, CheckpointError> {
        let rel = Path::new(RUN_LOCK_FILE);
        let contents = format!(
            "pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );

        match storage::write_new(location, rel, contents.as_bytes()).await {
            Ok(()) => Ok(RunLock {
                path: location.join(rel),
                held: true,
            }),
            Err(StorageError::AlreadyExists { path, .. }) => AlreadyRunningSnafu { path }.fail(),
            Err(source) => Err(CheckpointError::Storage { source }),
        }
    }

    /// Remove the lock file.
    pub async fn release(mut self) -> Result<(), CheckpointError> {
        self.held = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Storage {
                source: StorageError::classify(
                    self.path.display().to_string(),
                    storage::BackendError::Local(e),
                ),
            }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("failed to remove run lock {}: {e}", self.path.display());
            }
        }
    }
}

/// Persistent store of processed-file identities.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replay the checkpoint. A fresh checkpoint has version 0.
    async fn load(&self) -> Result<CheckpointState, CheckpointError>;

    /// Commit `actions` on top of `expected_version`; returns the new version.
    async fn commit(
        &self,
        expected_version: u64,
        actions: Vec<CheckpointAction>,
    ) -> Result<u64, CheckpointError>;

    /// Take the exclusive run lock.
    async fn lock(&self) -> Result<RunLock, CheckpointError>;
}

/// Checkpoint store backed by a commit log on local storage.
#[derive(Debug, Clone)]
pub struct LogCheckpointStore {
    location: StorageLocation,
    log: CommitLog<CheckpointAction>,
}

impl LogCheckpointStore {
    /// Store rooted at `location`; nothing is written until the first commit.
    pub fn new(location: StorageLocation) -> Self {
        let log = CommitLog::new(location.clone(), INGEST_LOG_DIR);
        LogCheckpointStore { location, log }
    }

    /// Checkpoint root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Delete the checkpoint entirely. A missing checkpoint is not an error.
    pub async fn reset(location: &StorageLocation) -> Result<(), CheckpointError> {
        storage::remove_root(location).await.context(StorageSnafu)
    }
}

#[async_trait]
impl CheckpointStore for LogCheckpointStore {
    async fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let (version, commits) = self.log.load_all().await.context(CheckpointLogSnafu)?;
        CheckpointState::replay(version, commits.iter().flat_map(|c| c.actions.iter()))
    }

    async fn commit(
        &self,
        expected_version: u64,
        actions: Vec<CheckpointAction>,
    ) -> Result<u64, CheckpointError> {
        self.log
            .commit_with_expected_version(expected_version, actions)
            .await
            .context(CheckpointLogSnafu)
    }

    async fn lock(&self) -> Result<RunLock, CheckpointError> {
        RunLock::acquire(&self.location).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn ident(path: &str, size: u64, modified_ms: i64) -> FileIdentity {
        FileIdentity {
            path: path.to_string(),
            size,
            modified_ms,
        }
    }

    #[tokio::test]
    async fn fresh_checkpoint_is_empty_and_writes_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LogCheckpointStore::new(StorageLocation::local(tmp.path().join("ckpt")));

        let state = store.load().await?;
        assert_eq!(state, CheckpointState::default());
        assert!(!tmp.path().join("ckpt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn recorded_files_survive_reload() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LogCheckpointStore::new(StorageLocation::local(tmp.path()));

        let v1 = store
            .commit(0, vec![
                CheckpointAction::Init {
                    source: "/src".to_string(),
                },
                CheckpointAction::RecordFiles {
                    files: vec![ident("a.tsv", 10, 1)],
                    table_version: 2,
                },
            ])
            .await?;
        store
            .commit(v1, vec![CheckpointAction::RecordFiles {
                files: vec![ident("b.tsv", 20, 2)],
                table_version: 3,
            }])
            .await?;

        let reopened = LogCheckpointStore::new(StorageLocation::local(tmp.path()));
        let state = reopened.load().await?;
        assert_eq!(state.version, 2);
        assert_eq!(state.source.as_deref(), Some("/src"));
        assert_eq!(state.len(), 2);
        assert_eq!(state.last_table_version, Some(3));
        Ok(())
    }

    #[test]
    fn fingerprint_modes_differ_on_rewritten_files() {
        let state = CheckpointState::replay(1, &[CheckpointAction::RecordFiles {
            files: vec![ident("a.tsv", 10, 1)],
            table_version: 2,
        }])
        .expect("replay");

        let rewritten = ident("a.tsv", 12, 5);
        assert!(state.contains(&rewritten, FingerprintMode::PathOnly));
        assert!(!state.contains(&rewritten, FingerprintMode::PathSizeMtime));
        assert!(state.contains(&ident("a.tsv", 10, 1), FingerprintMode::PathSizeMtime));
        assert!(!state.contains(&ident("b.tsv", 10, 1), FingerprintMode::PathOnly));
    }

    #[test]
    fn duplicate_init_is_corrupt() {
        let init = CheckpointAction::Init {
            source: "/src".to_string(),
        };
        let err = CheckpointState::replay(1, &[init.clone(), init]).expect_err("corrupt");
        assert!(matches!(err, CheckpointError::CorruptCheckpoint { .. }));
    }

    #[test]
    fn fingerprint_mode_parses_and_displays() {
        assert_eq!("path".parse::<FingerprintMode>(), Ok(FingerprintMode::PathOnly));
        assert_eq!(
            FingerprintMode::PathSizeMtime.to_string().parse::<FingerprintMode>(),
            Ok(FingerprintMode::PathSizeMtime)
        );
        assert!("mtime".parse::<FingerprintMode>().is_err());
        assert_eq!(FingerprintMode::default(), FingerprintMode::PathSizeMtime);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_released() -> TestResult {
        let tmp = TempDir::new()?;
        let store = LogCheckpointStore::new(StorageLocation::local(tmp.path()));

        let lock = store.lock().await?;
        let err = store.lock().await.expect_err("expected AlreadyRunning");
        assert!(matches!(err, CheckpointError::AlreadyRunning { .. }));

        lock.release().await?;
        let again = store.lock().await?;
        drop(again);
        assert!(!tmp.path().join(RUN_LOCK_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn reset_removes_checkpoint() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("ckpt"));
        let store = LogCheckpointStore::new(location.clone());
        store
            .commit(0, vec![CheckpointAction::Init {
                source: "/src".to_string(),
            }])
            .await?;

        LogCheckpointStore::reset(&location).await?;
        assert_eq!(store.load().await?.version, 0);
        Ok(())
    }
}
