//! Error types for the migration engine.
//!
//! `EngineError` covers run-level problems: precondition violations that reject
//! a `migrate` call before any work starts, and I/O failures raised by the
//! walker, the verifier and the checkpoint store. Failures of a single file
//! during the transfer phase are not returned as `EngineError`; they are
//! recorded as [`FileFailure`](crate::model::FileFailure) entries in the
//! migration report.
//!
//! `TransferError` is what the chunked copier returns. Every variant carries
//! the byte offset that is safe to resume from.

use std::io;
use std::path::PathBuf;

/// Errors that stop a migration from starting or from being recorded.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Source directory does not exist
    #[error("source directory not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but is not a directory
    #[error("source is not a directory: {}", .path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Source directory is not accessible (permissions)
    #[error("source directory access denied: {}", .path.display())]
    SourceAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Destination exists and the caller did not allow reusing it
    #[error("destination already exists: {}", .path.display())]
    DestinationExists { path: PathBuf },

    /// Another migration is already running on this engine instance
    #[error("a migration is already running on this engine")]
    AlreadyRunning,

    /// Path is empty or cannot be resolved
    #[error("invalid path: {} ({reason})", .path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Failed to read from a file
    #[error("failed to read file: {}", .path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write or remove a file
    #[error("failed to write file: {}", .path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to enumerate a directory
    #[error("failed to enumerate directory: {}", .path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("failed to create directory: {}", .path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Checkpoint could not be written or replaced
    #[error("failed to write checkpoint: {}", .path.display())]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Checkpoint could not be serialized
    #[error("failed to encode checkpoint")]
    CheckpointEncode(#[from] serde_json::Error),
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::CheckpointWrite { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True for errors raised before any file was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound { .. }
                | Self::SourceNotDirectory { .. }
                | Self::DestinationExists { .. }
                | Self::AlreadyRunning
                | Self::InvalidPath { .. }
        )
    }
}

/// Errors produced by a single chunked file transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The cancel signal was observed between chunks.
    #[error("transfer cancelled after {bytes_copied} bytes")]
    Cancelled { bytes_copied: u64 },

    /// Opening or reading the source failed.
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        bytes_copied: u64,
        #[source]
        source: io::Error,
    },

    /// Opening, writing or flushing the destination failed (includes disk full).
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        bytes_copied: u64,
        #[source]
        source: io::Error,
    },

    /// The number of bytes written differs from the declared source size.
    #[error("size mismatch for {}: expected {expected} bytes, wrote {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl TransferError {
    /// Byte offset the destination is known to hold; resuming from here is safe.
    pub fn bytes_copied(&self) -> u64 {
        match self {
            Self::Cancelled { bytes_copied }
            | Self::Read { bytes_copied, .. }
            | Self::Write { bytes_copied, .. } => *bytes_copied,
            // Contents are suspect, so a retry starts over.
            Self::SizeMismatch { .. } => 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Extract the OS error code, if the failure came from the OS.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
