//! Core data model for migrations.
//!
//! This module defines the main data structures for representing a migration:
//! - FileTask: one file's unit of work, with its resume offset and expected digest
//! - MigrationState: the durable checkpoint of a run
//! - MigrationOptions: caller configuration
//! - EngineState, MigrationOutcome, MigrationReport: lifecycle and results

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};

/// A single file to migrate.
///
/// `relative_path` is `/`-separated and relative to both roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    /// Path relative to the source and destination roots
    pub relative_path: String,

    /// File size in bytes, fixed at scan time
    pub total_bytes: u64,

    /// Bytes already present at the destination (resume offset)
    pub bytes_copied: u64,

    /// Digest of the source computed at scan time, when verification is on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<ChecksumValue>,
}

impl FileTask {
    pub fn new(relative_path: impl Into<String>, total_bytes: u64) -> Self {
        FileTask {
            relative_path: relative_path.into(),
            total_bytes,
            bytes_copied: 0,
            expected_digest: None,
        }
    }

    /// Bytes still to transfer.
    pub fn remaining(&self) -> u64 {
        self.total_bytes.saturating_sub(self.bytes_copied)
    }

    /// Source path of this task under `root`.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        relative_to_path(root, &self.relative_path)
    }
}

/// Join a `/`-separated relative path onto `root` using native separators.
pub(crate) fn relative_to_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Durable snapshot of a migration's progress.
///
/// Every file discovered at scan time is in exactly one of `pending_tasks` and
/// `completed_paths`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Identifier of the run that created this state
    pub id: Uuid,

    /// Absolute source root
    pub source_root: PathBuf,

    /// Absolute destination root
    pub dest_root: PathBuf,

    /// Files not yet completed
    pub pending_tasks: Vec<FileTask>,

    /// Relative paths of completed files
    pub completed_paths: BTreeSet<String>,

    /// Sum of the sizes of completed files
    #[serde(default)]
    pub completed_bytes: u64,

    /// Every directory under the source root, relative, parents first
    #[serde(default)]
    pub directories: Vec<String>,

    /// Algorithm the expected digests were computed with
    #[serde(default)]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,

    /// When the run was first scanned
    pub created_at: DateTime<Utc>,

    /// Last checkpoint time
    pub last_updated: DateTime<Utc>,
}

impl MigrationState {
    /// Build a fresh state from a scan.
    pub fn new(
        source_root: PathBuf,
        dest_root: PathBuf,
        pending_tasks: Vec<FileTask>,
        directories: Vec<String>,
        checksum_algorithm: Option<ChecksumAlgorithm>,
    ) -> Self {
        let now = Utc::now();
        MigrationState {
            id: Uuid::new_v4(),
            source_root,
            dest_root,
            pending_tasks,
            completed_paths: BTreeSet::new(),
            completed_bytes: 0,
            directories,
            checksum_algorithm,
            created_at: now,
            last_updated: now,
        }
    }

    /// True if this state describes a migration from `source` to `dest`.
    pub fn matches(&self, source: &Path, dest: &Path) -> bool {
        self.source_root == source && self.dest_root == dest
    }

    pub fn total_files(&self) -> usize {
        self.pending_tasks.len() + self.completed_paths.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.completed_bytes + self.pending_tasks.iter().map(|t| t.total_bytes).sum::<u64>()
    }

    /// Bytes already at the destination, counting partial files.
    pub fn bytes_copied(&self) -> u64 {
        self.completed_bytes + self.pending_tasks.iter().map(|t| t.bytes_copied).sum::<u64>()
    }

    pub fn is_finished(&self) -> bool {
        self.pending_tasks.is_empty()
    }

    /// Check that no path is duplicated or present in both collections.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.pending_tasks.len());
        self.pending_tasks.iter().all(|task| {
            task.bytes_copied <= task.total_bytes
                && !self.completed_paths.contains(&task.relative_path)
                && seen.insert(task.relative_path.as_str())
        })
    }

    /// Move a task from pending to completed. Returns false if it was not pending.
    pub fn mark_completed(&mut self, relative_path: &str) -> bool {
        let Some(index) = self.task_index(relative_path) else {
            return false;
        };
        let task = self.pending_tasks.swap_remove(index);
        self.completed_bytes += task.total_bytes;
        self.completed_paths.insert(task.relative_path);
        true
    }

    /// Record the resume offset of a pending task.
    pub fn record_offset(&mut self, relative_path: &str, bytes_copied: u64) {
        if let Some(index) = self.task_index(relative_path) {
            let task = &mut self.pending_tasks[index];
            task.bytes_copied = bytes_copied.min(task.total_bytes);
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    fn task_index(&self, relative_path: &str) -> Option<usize> {
        self.pending_tasks
            .iter()
            .position(|t| t.relative_path == relative_path)
    }
}

/// The operation mode for a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Copy files; source remains unchanged
    #[default]
    Copy,
    /// Move files; each source file is removed once its copy is recorded
    Move,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Copy => write!(f, "Copy"),
            Mode::Move => write!(f, "Move"),
        }
    }
}

/// Caller configuration for a migration.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Copy or move
    pub mode: Mode,

    /// Copy modification and access times to the destination
    pub preserve_timestamps: bool,

    /// Verify every copied file with this algorithm
    pub verify: Option<ChecksumAlgorithm>,

    /// Requested number of workers (capped by available parallelism)
    pub worker_count: usize,

    /// Allow the destination to exist before a fresh run
    pub allow_existing: bool,

    /// Load and save checkpoints
    pub resumable: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        MigrationOptions {
            mode: Mode::Copy,
            preserve_timestamps: true,
            verify: None,
            worker_count: available_workers(),
            allow_existing: false,
            resumable: true,
        }
    }
}

impl MigrationOptions {
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_verify(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.verify = Some(algorithm);
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_allow_existing(mut self, allow: bool) -> Self {
        self.allow_existing = allow;
        self
    }

    pub fn with_preserve_timestamps(mut self, preserve: bool) -> Self {
        self.preserve_timestamps = preserve;
        self
    }

    /// Disable checkpointing: the plain parallel path.
    pub fn without_resume(mut self) -> Self {
        self.resumable = false;
        self
    }

    /// Workers actually used: `min(worker_count, available parallelism)`, at least 1.
    pub fn effective_workers(&self) -> usize {
        self.worker_count.min(available_workers()).max(1)
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Lifecycle of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No migration running
    Idle,
    /// Loading a checkpoint or walking the source tree
    Scanning,
    /// Workers are copying files
    Transferring,
    /// Last run finished every file
    Completed,
    /// Last run stopped on a file failure
    Failed,
    /// Last run stopped on request
    Cancelled,
}

impl EngineState {
    /// True while a `migrate` call is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Scanning | EngineState::Transferring)
    }
}

/// How a migration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Every file is at the destination; the checkpoint was deleted
    Completed,
    /// At least one file failed; the checkpoint holds the progress
    Failed,
    /// Cancelled on request; the checkpoint holds the progress
    Cancelled,
}

impl MigrationOutcome {
    pub fn as_state(&self) -> EngineState {
        match self {
            MigrationOutcome::Completed => EngineState::Completed,
            MigrationOutcome::Failed => EngineState::Failed,
            MigrationOutcome::Cancelled => EngineState::Cancelled,
        }
    }
}

/// A file that could not be migrated in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub relative_path: String,
    /// What the transfer or verification layer reported
    pub reason: String,
    pub os_error: Option<i32>,
}

/// Result of a `migrate` call that got past its preconditions.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub outcome: MigrationOutcome,
    pub run_id: Uuid,
    /// True if the run continued from a checkpoint
    pub resumed: bool,
    pub files_completed: usize,
    pub total_files: usize,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub failures: Vec<FileFailure>,
    pub elapsed: Duration,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == MigrationOutcome::Completed
    }
}
