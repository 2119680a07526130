//! Progress reporting.
//!
//! This module defines the ProgressSink trait, which decouples the migration
//! engine from whatever displays progress (CLI, GUI, log shipper).
//!
//! Sinks are called from worker threads, concurrently. Implementations must
//! return quickly; a sink that blocks stalls the worker that called it.
//! [`ChannelProgressSink`] forwards events over a bounded channel and drops
//! them when the consumer falls behind.

use crossbeam_channel::{Receiver, Sender};

use crate::model::{MigrationOutcome, MigrationReport};

/// Aggregate progress of a migration at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationProgress {
    pub files_completed: usize,
    pub total_files: usize,
    /// Bytes at the destination across all files, including partial ones
    pub bytes_copied: u64,
    pub total_bytes: u64,
    /// File the reporting worker is on, if any
    pub current_file: Option<String>,
}

impl MigrationProgress {
    /// Completion by bytes, 0–100.
    pub fn percent(&self) -> u32 {
        if self.total_bytes == 0 {
            return if self.files_completed >= self.total_files { 100 } else { 0 };
        }
        ((self.bytes_copied as f64 / self.total_bytes as f64) * 100.0).min(100.0) as u32
    }
}

/// Receives progress updates from a running migration.
///
/// Only [`on_progress`](ProgressSink::on_progress) is required; the other
/// hooks default to no-ops.
pub trait ProgressSink: Send + Sync {
    /// Called once transfer starts, after scanning or loading a checkpoint.
    fn on_migration_started(&self, _progress: &MigrationProgress, _resumed: bool) {}

    /// Called when a worker picks up a file.
    fn on_file_started(&self, _relative_path: &str) {}

    /// Called after every chunk and every completed file.
    fn on_progress(&self, progress: &MigrationProgress);

    /// Called when a file has been copied, verified and checkpointed.
    fn on_file_completed(&self, _relative_path: &str, _progress: &MigrationProgress) {}

    /// Called once with the final report.
    fn on_migration_finished(&self, _report: &MigrationReport) {}
}

/// Events emitted by [`ChannelProgressSink`].
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        progress: MigrationProgress,
        resumed: bool,
    },
    FileStarted {
        relative_path: String,
    },
    Progress(MigrationProgress),
    FileCompleted {
        relative_path: String,
        progress: MigrationProgress,
    },
    Finished {
        outcome: MigrationOutcome,
        files_completed: usize,
        total_files: usize,
        failed_files: usize,
    },
}

/// A ProgressSink that forwards events to a bounded channel without blocking.
///
/// When the channel is full the event is dropped; when the receiver is gone
/// every event is dropped.
pub struct ChannelProgressSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelProgressSink { sender }
    }

    /// Create a sink and the receiving end of a channel holding `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        (Self::new(sender), receiver)
    }

    fn offer(&self, event: ProgressEvent) {
        // Full or disconnected: progress is best-effort.
        let _ = self.sender.try_send(event);
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_migration_started(&self, progress: &MigrationProgress, resumed: bool) {
        self.offer(ProgressEvent::Started {
            progress: progress.clone(),
            resumed,
        });
    }

    fn on_file_started(&self, relative_path: &str) {
        self.offer(ProgressEvent::FileStarted {
            relative_path: relative_path.to_string(),
        });
    }

    fn on_progress(&self, progress: &MigrationProgress) {
        self.offer(ProgressEvent::Progress(progress.clone()));
    }

    fn on_file_completed(&self, relative_path: &str, progress: &MigrationProgress) {
        self.offer(ProgressEvent::FileCompleted {
            relative_path: relative_path.to_string(),
            progress: progress.clone(),
        });
    }

    fn on_migration_finished(&self, report: &MigrationReport) {
        self.offer(ProgressEvent::Finished {
            outcome: report.outcome,
            files_completed: report.files_completed,
            total_files: report.total_files,
            failed_files: report.failures.len(),
        });
    }
}
