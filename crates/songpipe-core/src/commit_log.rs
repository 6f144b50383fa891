//! Append-only, versioned commit log.
//!
//! Both the output table and the ingestion checkpoint persist their state as a
//! sequence of immutable JSON commits plus a `CURRENT` pointer:
//!
//! ```text
//! <root>/<log_dir>/
//!   CURRENT              # latest committed version, e.g. "3\n"
//!   0000000001.json      # Commit version 1
//!   0000000002.json      # Commit version 2
//!   0000000003.json      # Commit version 3
//! ```
//!
//! The log is generic over its action type; each owner defines its own verbs
//! (`TableAction`, `CheckpointAction`) and replays them to rebuild state.
//!
//! - **Append-only**: commits never mutate existing files.
//! - **Monotonically versioned**: versions are `u64` values that only
//!   increase, enforced by [`CommitLog::commit_with_expected_version`].
//! - **Exactly-once per version**: the commit file is created with
//!   create-new semantics, so two writers cannot both claim a version.
//! - **Commit point**: a well-formed commit file at `CURRENT + 1` whose
//!   `base_version` equals `CURRENT` is committed even if the pointer was
//!   never advanced. Loading rolls `CURRENT` forward over such commits, and a
//!   torn (unparseable) file at the next version is replaced on commit.

use std::{
    fmt,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{Backtrace, prelude::*};

use crate::storage::{self, StorageError, StorageLocation};

/// Errors that can occur while reading or writing a commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// The caller's expected version does not match the CURRENT pointer.
    #[snafu(display("Commit conflict: expected version {expected}, but CURRENT is {found}"))]
    Conflict {
        /// The version the caller expected to be current.
        expected: u64,
        /// The actual current version found.
        found: u64,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// Underlying storage error while working with the log or CURRENT file.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error returned by the storage backend.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log or CURRENT file is in an unexpected / malformed state.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// A description of the corrupt state.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },
}

/// A single, immutable commit.
///
/// `version` must match the file name; `base_version` records what the writer
/// believed was current when the commit was prepared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit<A> {
    /// The version number of this commit (monotonic, starting from 1).
    pub version: u64,
    /// The version the writer expected to be current.
    pub base_version: u64,
    /// Commit creation timestamp, stored as RFC3339 UTC.
    pub timestamp: DateTime<Utc>,
    /// Ordered actions recorded by this commit.
    pub actions: Vec<A>,
}

/// Reader/writer for one commit log directory under a storage root.
pub struct CommitLog<A> {
    location: StorageLocation,
    dir_name: &'static str,
    _actions: PhantomData<fn() -> A>,
}

impl<A> Clone for CommitLog<A> {
    fn clone(&self) -> Self {
        Self {
            location: self.location.clone(),
            dir_name: self.dir_name,
            _actions: PhantomData,
        }
    }
}

impl<A> fmt::Debug for CommitLog<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitLog")
            .field("location", &self.location)
            .field("dir_name", &self.dir_name)
            .finish()
    }
}

impl<A> CommitLog<A>
where
    A: Serialize + DeserializeOwned,
{
    /// Name of the file that stores the current version pointer.
    pub const CURRENT_FILE_NAME: &str = "CURRENT";
    /// Number of digits used in zero-padded commit file names.
    pub const COMMIT_FILENAME_DIGITS: usize = 10;

    /// Create a log rooted at `location/<dir_name>/`.
    pub fn new(location: StorageLocation, dir_name: &'static str) -> Self {
        Self {
            location,
            dir_name,
            _actions: PhantomData,
        }
    }

    /// Storage root the log lives under.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Log directory relative to the storage root.
    pub fn dir_rel(&self) -> PathBuf {
        PathBuf::from(self.dir_name)
    }

    fn current_rel_path(&self) -> PathBuf {
        self.dir_rel().join(Self::CURRENT_FILE_NAME)
    }

    /// Relative path of the commit file for `version`.
    pub fn commit_rel_path(&self, version: u64) -> PathBuf {
        let file_name = format!(
            "{:0width$}.json",
            version,
            width = Self::COMMIT_FILENAME_DIGITS
        );
        self.dir_rel().join(file_name)
    }

    async fn read_to_string_rel(&self, rel: &Path) -> Result<String, CommitError> {
        storage::read_to_string(&self.location, rel)
            .await
            .context(StorageSnafu)
    }

    /// Load a single commit by version.
    pub async fn load_commit(&self, version: u64) -> Result<Commit<A>, CommitError> {
        let rel = self.commit_rel_path(version);
        let json = self.read_to_string_rel(&rel).await?;

        serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version} in {}: {e}", self.dir_name),
            backtrace: Backtrace::capture(),
        })
    }

    async fn read_current_pointer(&self) -> Result<u64, CommitError> {
        let rel = self.current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
            .fail();
        }

        trimmed
            .parse::<u64>()
            .map_err(|e| CommitError::CorruptState {
                msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
                backtrace: Backtrace::capture(),
            })
    }

    async fn write_current_pointer(&self, version: u64) -> Result<(), CommitError> {
        let contents = format!("{version}\n");
        storage::write_atomic(&self.location, &self.current_rel_path(), contents.as_bytes())
            .await
            .context(StorageSnafu)
    }

    /// The version after `current`, if its commit file is complete and was
    /// written against `current`.
    async fn committed_successor(&self, current: u64) -> Result<Option<u64>, CommitError> {
        let Some(next) = current.checked_add(1) else {
            return Ok(None);
        };
        match self.load_commit(next).await {
            Ok(commit) if commit.version == next && commit.base_version == current => {
                Ok(Some(next))
            }
            Ok(_)
            | Err(CommitError::CorruptState { .. })
            | Err(CommitError::Storage {
                source: StorageError::NotFound { .. },
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load the current version.
    ///
    /// A missing CURRENT file means a fresh log and returns 0. Empty or
    /// non-numeric content is `CorruptState`. Commits written after the
    /// pointer are rolled forward and CURRENT is rewritten to match.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        let pointer = self.read_current_pointer().await?;

        let mut current = pointer;
        while let Some(next) = self.committed_successor(current).await? {
            current = next;
        }

        if current != pointer {
            log::warn!(
                "{}: CURRENT was {pointer} but commits exist through {current}; rolling forward",
                self.dir_name
            );
            if let Err(e) = self.write_current_pointer(current).await {
                log::warn!("{}: failed to repair CURRENT: {e}", self.dir_name);
            }
        }

        Ok(current)
    }

    /// Remove a torn commit file left at `version` by an interrupted writer.
    ///
    /// A well-formed commit at that version belongs to another writer and is
    /// reported as a `Conflict`.
    async fn discard_torn_commit(&self, expected: u64, version: u64) -> Result<(), CommitError> {
        match self.load_commit(version).await {
            Ok(_) => ConflictSnafu {
                expected,
                found: version,
            }
            .fail(),
            Err(CommitError::CorruptState { msg, .. }) => {
                log::warn!("{}: discarding torn commit {version}: {msg}", self.dir_name);
                storage::remove_file(&self.location, &self.commit_rel_path(version))
                    .await
                    .context(StorageSnafu)
            }
            Err(e) => Err(e),
        }
    }

    /// Load every commit from 1 through CURRENT, in order.
    ///
    /// Returns the CURRENT version together with the commits. A payload whose
    /// version does not match its file name is `CorruptState`.
    pub async fn load_all(&self) -> Result<(u64, Vec<Commit<A>>), CommitError> {
        let current = self.load_current_version().await?;
        let mut commits = Vec::with_capacity(current as usize);

        for v in 1..=current {
            let commit = self.load_commit(v).await?;
            if commit.version != v {
                return CorruptStateSnafu {
                    msg: format!(
                        "Commit version mismatch: expected {v}, found {} in payload",
                        commit.version
                    ),
                }
                .fail();
            }
            commits.push(commit);
        }

        Ok((current, commits))
    }

    /// Commit a new version with an optimistic concurrency guard.
    ///
    /// The CURRENT check is advisory; the real guard is the create-new write
    /// of the commit file. A writer that loses that race gets `Conflict`.
    ///
    /// Once the commit file is written the version is committed: if updating
    /// CURRENT then fails, the next load rolls the pointer forward. An
    /// unparseable file already at the new version is a torn write from an
    /// interrupted commit; it is removed and the write retried once. That
    /// repair assumes a single writer per log, which the run lock provides.
    pub async fn commit_with_expected_version(
        &self,
        expected: u64,
        actions: Vec<A>,
    ) -> Result<u64, CommitError> {
        let current = self.load_current_version().await?;
        if current != expected {
            return ConflictSnafu {
                expected,
                found: current,
            }
            .fail();
        }

        let version = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;

        let commit = Commit {
            version,
            base_version: expected,
            timestamp: Utc::now(),
            actions,
        };

        let json = serde_json::to_vec(&commit).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let commit_rel = self.commit_rel_path(version);
        match storage::write_new(&self.location, &commit_rel, &json).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                self.discard_torn_commit(expected, version).await?;
                storage::write_new(&self.location, &commit_rel, &json)
                    .await
                    .context(StorageSnafu)?;
            }
            Err(source) => return Err(CommitError::Storage { source }),
        }

        self.write_current_pointer(version).await?;

        Ok(version)
    }
}
