//! Durable migration checkpoints.
//!
//! A checkpoint is a JSON document holding a [`MigrationState`]. Saving writes
//! a sibling temp file, syncs it and renames it over the previous checkpoint,
//! so a reader sees either the old or the new version, never a torn one.
//!
//! Anything that cannot be used (missing, unparseable, for another pair of
//! roots, internally inconsistent) loads as "no checkpoint" and the engine
//! rescans.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::model::MigrationState;

/// File-backed store for one engine's checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    /// Default store location for a destination:
    /// `<parent>/.<name>.relocate.json`, next to (not inside) the destination.
    pub fn beside(destination: &Path) -> Self {
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "migration".to_string());
        let parent = destination.parent().unwrap_or_else(|| Path::new(""));
        Self::new(parent.join(format!(".{name}.relocate.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Atomically replace the checkpoint with `state`.
    pub fn save(&self, state: &MigrationState) -> Result<(), EngineError> {
        let write_error = |path: &Path, e: io::Error| EngineError::CheckpointWrite {
            path: path.to_path_buf(),
            source: e,
        };

        let serialized = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.temp_path();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
        }

        let mut tmp = File::create(&tmp_path).map_err(|e| write_error(&tmp_path, e))?;
        tmp.write_all(&serialized)
            .map_err(|e| write_error(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| write_error(&tmp_path, e))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|e| write_error(&self.path, e))?;
        tracing::debug!(
            path = %self.path.display(),
            pending = state.pending_tasks.len(),
            completed = state.completed_paths.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint, if there is a usable one.
    ///
    /// A missing file is `Ok(None)`. A file that exists but does not parse or
    /// violates the pending/completed invariant is logged and also `Ok(None)`.
    /// Only a read failure other than "not found" is an error.
    pub fn load(&self) -> Result<Option<MigrationState>, EngineError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let state: MigrationState = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable checkpoint");
                return Ok(None);
            }
        };

        if !state.is_consistent() {
            tracing::warn!(path = %self.path.display(), "ignoring inconsistent checkpoint");
            return Ok(None);
        }

        Ok(Some(state))
    }

    /// Load the checkpoint only if it belongs to the `source` → `dest` migration.
    pub fn load_matching(&self, source: &Path, dest: &Path) -> Option<MigrationState> {
        match self.load() {
            Ok(Some(state)) if state.matches(source, dest) => Some(state),
            Ok(Some(state)) => {
                tracing::info!(
                    path = %self.path.display(),
                    checkpoint_source = %state.source_root.display(),
                    checkpoint_dest = %state.dest_root.display(),
                    "checkpoint belongs to another migration, rescanning"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, rescanning");
                None
            }
        }
    }

    /// Remove the checkpoint and any leftover temp file. Missing files are fine.
    pub fn delete(&self) -> Result<(), EngineError> {
        for path in [self.temp_path(), self.path.clone()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::CheckpointWrite { path, source: e }),
            }
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
