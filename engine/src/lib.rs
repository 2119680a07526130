//! # Relocate Engine - Resumable Directory Migration
//!
//! A headless engine that copies or moves a directory tree to a new location
//! in parallel, verifies what it wrote, and can pick up an interrupted run
//! where it left off. It is the library behind the `relocate` CLI and is
//! meant to be embedded by other front ends as well.
//!
//! ## Overview
//!
//! - Source files are split into size-balanced partitions, one worker thread each
//! - Files are streamed in chunks with cooperative cancellation between chunks
//! - Progress is checkpointed to a JSON file after every completed file,
//!   including partial offsets, so a restart re-copies nothing that finished
//! - Optional SHA-256, BLAKE3 or MD5 verification of every copy
//! - Progress reporting through a trait, independent of any UI technology
//!
//! ## Basic Usage
//!
//! ```no_run
//! use relocate_engine::{CheckpointStore, MigrationEngine, MigrationOptions, Mode};
//! use relocate_engine::ChecksumAlgorithm;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let destination = Path::new("/mnt/new/photos");
//! let engine = MigrationEngine::new(CheckpointStore::beside(destination));
//!
//! let options = MigrationOptions::default()
//!     .with_mode(Mode::Move)
//!     .with_verify(ChecksumAlgorithm::Blake3);
//!
//! let report = engine.migrate("/mnt/old/photos", destination, &options, None)?;
//! println!(
//!     "{:?}: {}/{} files",
//!     report.outcome, report.files_completed, report.total_files
//! );
//! # Ok(())
//! # }
//! ```
//!
//! Running the same call again after a crash or cancellation resumes from the
//! checkpoint.
//!
//! ## Modules
//!
//! - **model**: Tasks, migration state, options, reports
//! - **error**: Error types and handling
//! - **fs_ops**: Tree enumeration and other filesystem helpers
//! - **partition**: Size-balanced work splitting
//! - **transfer**: Chunked, resumable single-file copy
//! - **checksums**: Digest computation and verification
//! - **checkpoint**: Durable checkpoint store
//! - **migrate**: The migration engine
//! - **progress**: Progress sink trait
//! - **cancel**: Cancellation token

pub mod cancel;
pub mod checkpoint;
pub mod checksums;
pub mod error;
pub mod fs_ops;
pub mod migrate;
pub mod model;
pub mod partition;
pub mod progress;
pub mod transfer;

// Re-export main types and functions
pub use cancel::CancelToken;
pub use checkpoint::CheckpointStore;
pub use checksums::{compute_file_checksum, verify_file, ChecksumAlgorithm, ChecksumValue};
pub use error::{EngineError, TransferError};
pub use migrate::{MigrationEngine, MigrationHooks};
pub use model::{
    EngineState, FileFailure, FileTask, MigrationOptions, MigrationOutcome, MigrationReport,
    MigrationState, Mode,
};
pub use partition::{partition, Partition};
pub use progress::{ChannelProgressSink, MigrationProgress, ProgressEvent, ProgressSink};
pub use transfer::transfer_file;
