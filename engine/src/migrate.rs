//! Migration orchestration.
//!
//! [`MigrationEngine::migrate`] drives one run through
//! Idle → Scanning → Transferring → Completed | Failed | Cancelled → Idle:
//!
//! - Scanning: validate the roots, then either load a matching checkpoint or
//!   walk the source tree (computing expected digests when verifying) and
//!   persist a fresh state.
//! - Transferring: split pending files into size-balanced partitions, one
//!   scoped OS thread each. Workers stream files with the chunked copier,
//!   verify them, and hand completions to the ledger, which owns the state
//!   and checkpoints after every file.
//! - A failure stops dispatch of new files; cancellation is polled between
//!   chunks and between files. Either way the state, including partial
//!   offsets, is checkpointed before returning.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use filetime::FileTime;

use crate::cancel::CancelToken;
use crate::checkpoint::CheckpointStore;
use crate::checksums::{compute_file_checksum, verify_file, ChecksumValue};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::{
    EngineState, FileFailure, FileTask, MigrationOptions, MigrationOutcome, MigrationReport,
    MigrationState, Mode,
};
use crate::partition::{partition, target_size, Partition};
use crate::progress::{MigrationProgress, ProgressSink};
use crate::transfer::transfer_file;

/// Instrumentation points around each file. All methods default to no-ops.
///
/// Hooks run on worker threads and must not call back into
/// [`MigrationEngine::cancel`], which waits for those threads.
pub trait MigrationHooks: Send + Sync {
    /// A transfer attempt for `task` is about to start at `task.bytes_copied`.
    fn on_transfer_start(&self, _task: &FileTask) {}

    /// The copy of `task` is on disk at `destination` and is about to be verified.
    fn before_verify(&self, _task: &FileTask, _destination: &Path) {}
}

struct NoHooks;

impl MigrationHooks for NoHooks {}

struct Slot {
    state: EngineState,
    cancel: Option<CancelToken>,
    last_outcome: Option<MigrationOutcome>,
}

/// Runs migrations one at a time against a single checkpoint location.
pub struct MigrationEngine {
    store: CheckpointStore,
    slot: Mutex<Slot>,
    settled: Condvar,
    hooks: Arc<dyn MigrationHooks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MigrationEngine {
    /// Create an idle engine whose runs checkpoint to `store`.
    pub fn new(store: CheckpointStore) -> Self {
        MigrationEngine {
            store,
            slot: Mutex::new(Slot {
                state: EngineState::Idle,
                cancel: None,
                last_outcome: None,
            }),
            settled: Condvar::new(),
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn MigrationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn state(&self) -> EngineState {
        lock(&self.slot).state
    }

    /// Outcome of the most recent finished run.
    pub fn last_outcome(&self) -> Option<MigrationOutcome> {
        lock(&self.slot).last_outcome
    }

    /// Signal the running migration to stop without waiting.
    ///
    /// Returns false when nothing is running.
    pub fn request_cancel(&self) -> bool {
        let slot = lock(&self.slot);
        match (&slot.cancel, slot.state.is_active()) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// True once cancellation has been requested for the current run.
    pub fn is_cancel_requested(&self) -> bool {
        lock(&self.slot)
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }

    /// Request cancellation and block until the running migration has
    /// checkpointed and reached a terminal state.
    ///
    /// Returns the outcome of the last run, or `None` if no run ever finished.
    /// Must not be called from a progress sink or hook of the same engine.
    pub fn cancel(&self) -> Option<MigrationOutcome> {
        let mut slot = lock(&self.slot);
        if let Some(token) = &slot.cancel {
            token.cancel();
        }
        while slot.state.is_active() {
            slot = self
                .settled
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slot.last_outcome
    }

    fn begin(&self) -> Result<(RunGuard<'_>, CancelToken), EngineError> {
        let mut slot = lock(&self.slot);
        if slot.state.is_active() {
            return Err(EngineError::AlreadyRunning);
        }
        let token = CancelToken::new();
        slot.state = EngineState::Scanning;
        slot.cancel = Some(token.clone());
        Ok((RunGuard { engine: self }, token))
    }

    fn set_state(&self, state: EngineState) {
        let mut slot = lock(&self.slot);
        slot.state = state;
        match state {
            EngineState::Completed => slot.last_outcome = Some(MigrationOutcome::Completed),
            EngineState::Failed => slot.last_outcome = Some(MigrationOutcome::Failed),
            EngineState::Cancelled => slot.last_outcome = Some(MigrationOutcome::Cancelled),
            _ => {}
        }
        self.settled.notify_all();
    }

    /// Migrate the tree at `source` to `destination`.
    ///
    /// Returns `Err` for precondition violations (missing source, existing
    /// destination, a run already in progress) and for errors that prevent
    /// the checkpoint from being written. Per-file failures and cancellation
    /// are reported through [`MigrationReport::outcome`].
    ///
    /// After a completed run the destination exists, so running again needs
    /// [`MigrationOptions::allow_existing`]. The rescan then treats files
    /// already at the destination as done: with verification when their
    /// digest matches, otherwise when size and modification time match (with
    /// timestamps preserved). Nothing is re-copied in that case.
    pub fn migrate(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        options: &MigrationOptions,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<MigrationReport, EngineError> {
        let started = Instant::now();
        let (_guard, cancel) = self.begin()?;

        let source = fs_ops::absolute_path(source.as_ref())?;
        let destination = fs_ops::absolute_path(destination.as_ref())?;
        validate_disjoint(&source, &destination)?;

        let loaded = if options.resumable {
            self.store.load_matching(&source, &destination)
        } else {
            None
        };
        // A finished move may have removed the source before its checkpoint.
        let finished_move = loaded
            .as_ref()
            .is_some_and(|state| state.is_finished() && !source.exists());
        if !finished_move {
            validate_source(&source)?;
        }
        let resumed = loaded.is_some();

        let state = match loaded {
            Some(state) => {
                tracing::info!(
                    run_id = %state.id,
                    pending = state.pending_tasks.len(),
                    completed = state.completed_paths.len(),
                    "resuming migration from checkpoint"
                );
                state
            }
            None => {
                let destination_exists = destination.symlink_metadata().is_ok();
                if destination_exists && !options.allow_existing {
                    return Err(EngineError::DestinationExists { path: destination });
                }
                let mut state = scan(&source, &destination, options, &cancel)?;
                if destination_exists {
                    skip_migrated(&mut state, options);
                }
                if options.resumable {
                    self.store.save(&state)?;
                }
                state
            }
        };

        let span = tracing::info_span!("migration", run_id = %state.id);
        let _entered = span.enter();
        self.set_state(EngineState::Transferring);

        fs_ops::create_directories(&destination, &state.directories)?;

        let store = options.resumable.then_some(&self.store);
        let ledger = Ledger::new(state, store);
        let failures = Mutex::new(Vec::new());
        let stop = AtomicBool::new(false);

        if let Some(sink) = progress {
            sink.on_migration_started(&ledger.snapshot(None), resumed);
        }

        let pending = lock(&ledger.state).pending_tasks.clone();
        let partitions: Vec<Partition> = partition(pending, options.effective_workers())
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        let target = target_size(
            partitions.iter().map(|p| p.total_bytes).sum(),
            partitions.len(),
        );
        for (index, p) in partitions.iter().enumerate() {
            tracing::debug!(
                worker = index,
                files = p.len(),
                bytes = p.total_bytes,
                target,
                "partition assigned"
            );
        }

        let ctx = WorkerContext {
            source: &source,
            destination: &destination,
            options,
            cancel: &cancel,
            stop: &stop,
            ledger: &ledger,
            failures: &failures,
            progress,
            hooks: self.hooks.as_ref(),
        };

        std::thread::scope(|scope| {
            for (index, part) in partitions.into_iter().enumerate() {
                let ctx = &ctx;
                let span = &span;
                scope.spawn(move || {
                    let _entered = span.enter();
                    run_partition(ctx, index, part);
                });
            }
        });

        let failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut state = ledger.into_state();

        let outcome = if !failures.is_empty() {
            MigrationOutcome::Failed
        } else if state.is_finished() {
            MigrationOutcome::Completed
        } else if cancel.is_cancelled() {
            MigrationOutcome::Cancelled
        } else {
            MigrationOutcome::Failed
        };

        if outcome == MigrationOutcome::Completed {
            if options.mode == Mode::Move {
                drain_source(&source, &state);
            }
            if options.resumable {
                if let Err(e) = self.store.delete() {
                    tracing::warn!(error = %e, "failed to delete checkpoint after completion");
                }
            }
        } else {
            state.touch();
            if options.resumable {
                self.store.save(&state)?;
            }
        }

        self.set_state(outcome.as_state());

        let report = MigrationReport {
            outcome,
            run_id: state.id,
            resumed,
            files_completed: state.completed_paths.len(),
            total_files: state.total_files(),
            bytes_copied: state.bytes_copied(),
            total_bytes: state.total_bytes(),
            failures,
            elapsed: started.elapsed(),
        };

        tracing::info!(
            outcome = ?report.outcome,
            files = report.files_completed,
            total_files = report.total_files,
            bytes = report.bytes_copied,
            failed = report.failures.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "migration finished"
        );

        if let Some(sink) = progress {
            sink.on_migration_finished(&report);
        }

        Ok(report)
    }
}

/// Returns the engine to Idle when a run ends, however it ends.
struct RunGuard<'a> {
    engine: &'a MigrationEngine,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.engine.slot);
        slot.state = EngineState::Idle;
        slot.cancel = None;
        self.engine.settled.notify_all();
    }
}

fn validate_source(source: &Path) -> Result<(), EngineError> {
    match std::fs::metadata(source) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::SourceNotDirectory {
                path: source.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound {
                path: source.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(EngineError::SourceAccessDenied {
                path: source.to_path_buf(),
                source: e,
            })
        }
    }
    Ok(())
}

fn validate_disjoint(source: &Path, destination: &Path) -> Result<(), EngineError> {
    if destination.starts_with(source) || source.starts_with(destination) {
        return Err(EngineError::InvalidPath {
            path: destination.to_path_buf(),
            reason: "source and destination must not contain each other".to_string(),
        });
    }
    Ok(())
}

/// Walk the source tree and build a fresh state.
///
/// Digests that cannot be computed here (unreadable file, cancellation) are
/// left empty and computed by the worker before it copies the file.
fn scan(
    source: &Path,
    destination: &Path,
    options: &MigrationOptions,
    cancel: &CancelToken,
) -> Result<MigrationState, EngineError> {
    let tree = fs_ops::enumerate_tree(source)?;

    let mut tasks = Vec::with_capacity(tree.files.len());
    for file in &tree.files {
        let mut task = FileTask::new(file.relative_path.clone(), file.size);
        if let Some(algorithm) = options.verify {
            if !cancel.is_cancelled() {
                match compute_file_checksum(&file.absolute_path, algorithm) {
                    Ok(digest) => task.expected_digest = Some(digest),
                    Err(e) => {
                        tracing::warn!(file = %file.relative_path, error = %e, "digest deferred");
                    }
                }
            }
        }
        tasks.push(task);
    }

    tracing::info!(
        files = tasks.len(),
        directories = tree.directories.len(),
        bytes = tree.total_bytes(),
        verify = ?options.verify,
        "scanned source tree"
    );

    Ok(MigrationState::new(
        source.to_path_buf(),
        destination.to_path_buf(),
        tasks,
        tree.directories,
        options.verify,
    ))
}

/// Mark files that an earlier run already put at the destination as completed.
fn skip_migrated(state: &mut MigrationState, options: &MigrationOptions) {
    let present: Vec<String> = state
        .pending_tasks
        .iter()
        .filter(|task| is_migrated(task, &state.source_root, &state.dest_root, options))
        .map(|task| task.relative_path.clone())
        .collect();
    for relative in &present {
        state.mark_completed(relative);
    }
    if !present.is_empty() {
        tracing::info!(files = present.len(), "files already at destination, skipping");
    }
}

/// A destination file counts as migrated when its digest matches, or without
/// verification when size and preserved modification time match the source.
fn is_migrated(
    task: &FileTask,
    source: &Path,
    destination: &Path,
    options: &MigrationOptions,
) -> bool {
    let dst = task.path_under(destination);
    let Ok(dst_meta) = std::fs::metadata(&dst) else {
        return false;
    };
    if !dst_meta.is_file() || dst_meta.len() != task.total_bytes {
        return false;
    }
    match (options.verify, &task.expected_digest) {
        (Some(_), Some(digest)) => matches!(verify_file(&dst, digest), Ok(true)),
        (Some(_), None) => false,
        (None, _) if options.preserve_timestamps => {
            let Ok(src_meta) = std::fs::metadata(task.path_under(source)) else {
                return false;
            };
            FileTime::from_last_modification_time(&src_meta)
                == FileTime::from_last_modification_time(&dst_meta)
        }
        (None, _) => false,
    }
}

/// Remove the source side of a completed move.
///
/// Sources of completed files are normally deleted as each one completes;
/// this also catches files whose deletion was interrupted by a crash.
fn drain_source(source: &Path, state: &MigrationState) {
    for relative in &state.completed_paths {
        let path = crate::model::relative_to_path(source, relative);
        if let Err(e) = fs_ops::remove_source_file(&path) {
            tracing::warn!(file = %relative, error = %e, "failed to remove moved source file");
        }
    }
    match fs_ops::remove_empty_tree(source) {
        Ok(0) => tracing::debug!(path = %source.display(), "source tree removed"),
        Ok(leftover) => {
            tracing::warn!(path = %source.display(), leftover, "source tree not empty after move")
        }
        Err(e) => tracing::warn!(path = %source.display(), error = %e, "failed to remove source tree"),
    }
}

/// Sole owner of the mutable migration state during a run.
///
/// Workers report completions, partial offsets and resets here; the ledger
/// applies them under its lock and checkpoints completions. Aggregate
/// counters for progress reporting are kept outside the lock.
struct Ledger<'a> {
    state: Mutex<MigrationState>,
    store: Option<&'a CheckpointStore>,
    files_completed: AtomicUsize,
    bytes_copied: AtomicU64,
    total_files: usize,
    total_bytes: u64,
}

impl<'a> Ledger<'a> {
    fn new(state: MigrationState, store: Option<&'a CheckpointStore>) -> Self {
        Ledger {
            files_completed: AtomicUsize::new(state.completed_paths.len()),
            bytes_copied: AtomicU64::new(state.bytes_copied()),
            total_files: state.total_files(),
            total_bytes: state.total_bytes(),
            state: Mutex::new(state),
            store,
        }
    }

    /// Mark `relative_path` completed and checkpoint.
    fn complete(&self, relative_path: &str) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if state.mark_completed(relative_path) {
            self.files_completed.fetch_add(1, Ordering::SeqCst);
        }
        state.touch();
        match self.store {
            Some(store) => store.save(&state),
            None => Ok(()),
        }
    }

    /// Remember how far a file got; persisted with the next checkpoint.
    fn record_offset(&self, relative_path: &str, bytes_copied: u64) {
        lock(&self.state).record_offset(relative_path, bytes_copied);
    }

    /// Move the aggregate byte counter from `*last` to `now` for one file.
    fn advance(&self, last: &mut u64, now: u64) {
        if now >= *last {
            self.bytes_copied.fetch_add(now - *last, Ordering::Relaxed);
        } else {
            self.bytes_copied.fetch_sub(*last - now, Ordering::Relaxed);
        }
        *last = now;
    }

    fn snapshot(&self, current_file: Option<&str>) -> MigrationProgress {
        MigrationProgress {
            files_completed: self.files_completed.load(Ordering::SeqCst),
            total_files: self.total_files,
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            current_file: current_file.map(str::to_string),
        }
    }

    fn into_state(self) -> MigrationState {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a worker borrows from the run.
struct WorkerContext<'a> {
    source: &'a Path,
    destination: &'a Path,
    options: &'a MigrationOptions,
    cancel: &'a CancelToken,
    stop: &'a AtomicBool,
    ledger: &'a Ledger<'a>,
    failures: &'a Mutex<Vec<FileFailure>>,
    progress: Option<&'a dyn ProgressSink>,
    hooks: &'a dyn MigrationHooks,
}

enum TaskError {
    Cancelled,
    Failed(FileFailure),
}

fn run_partition(ctx: &WorkerContext<'_>, worker: usize, part: Partition) {
    for task in part.tasks {
        if ctx.cancel.is_cancelled() || ctx.stop.load(Ordering::SeqCst) {
            break;
        }
        match process_task(ctx, &task) {
            Ok(()) => {}
            Err(TaskError::Cancelled) => {
                tracing::debug!(worker, file = %task.relative_path, "worker cancelled");
                break;
            }
            Err(TaskError::Failed(failure)) => {
                tracing::warn!(worker, file = %failure.relative_path, reason = %failure.reason, "file failed");
                lock(ctx.failures).push(failure);
                ctx.stop.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn file_failure(task: &FileTask, error: &dyn std::error::Error, os_error: Option<i32>) -> TaskError {
    let mut reason = error.to_string();
    let mut cause = error.source();
    while let Some(inner) = cause {
        reason.push_str(": ");
        reason.push_str(&inner.to_string());
        cause = inner.source();
    }
    TaskError::Failed(FileFailure {
        relative_path: task.relative_path.clone(),
        reason,
        os_error,
    })
}

fn engine_failure(task: &FileTask, error: EngineError) -> TaskError {
    let os_error = error.raw_os_error();
    file_failure(task, &error, os_error)
}

/// Copy, verify and record one file.
fn process_task(ctx: &WorkerContext<'_>, task: &FileTask) -> Result<(), TaskError> {
    let rel = task.relative_path.as_str();
    let src = task.path_under(ctx.source);
    let dst = task.path_under(ctx.destination);
    let ledger = ctx.ledger;

    if let Some(sink) = ctx.progress {
        sink.on_file_started(rel);
    }
    ctx.hooks.on_transfer_start(task);
    tracing::debug!(
        file = %rel,
        offset = task.bytes_copied,
        remaining = task.remaining(),
        "transferring file"
    );

    let expected = expected_digest(ctx, task, &src)?;

    fs_ops::ensure_parent_dir_exists(&dst).map_err(|e| engine_failure(task, e))?;

    let mut last = task.bytes_copied;
    let result = transfer_file(
        &src,
        &dst,
        task.bytes_copied,
        Mode::Copy,
        |done, _total| {
            ledger.advance(&mut last, done);
            if let Some(sink) = ctx.progress {
                sink.on_progress(&ledger.snapshot(Some(rel)));
            }
        },
        ctx.cancel,
    );

    let copied = match result {
        Ok(copied) => copied,
        Err(e) => {
            ledger.record_offset(rel, e.bytes_copied());
            ledger.advance(&mut last, e.bytes_copied());
            if e.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let os_error = e.raw_os_error();
            return Err(file_failure(task, &e, os_error));
        }
    };

    if copied != task.total_bytes {
        ledger.record_offset(rel, 0);
        ledger.advance(&mut last, 0);
        return Err(TaskError::Failed(FileFailure {
            relative_path: task.relative_path.clone(),
            reason: format!(
                "source size changed since scan: expected {} bytes, found {}",
                task.total_bytes, copied
            ),
            os_error: None,
        }));
    }

    if ctx.options.preserve_timestamps {
        if let Err(e) = fs_ops::copy_timestamps(&src, &dst) {
            tracing::warn!(file = %rel, error = %e, "could not preserve timestamps");
        }
    }

    if let Some(expected) = expected {
        ctx.hooks.before_verify(task, &dst);
        let verified = verify_file(&dst, &expected);
        if !matches!(verified, Ok(true)) {
            // A partial digest means nothing; the retry copies the whole file.
            ledger.record_offset(rel, 0);
            ledger.advance(&mut last, 0);
            return Err(match verified {
                Err(e) => engine_failure(task, e),
                _ => TaskError::Failed(FileFailure {
                    relative_path: task.relative_path.clone(),
                    reason: format!(
                        "digest mismatch after copy, expected {}",
                        expected.to_string_with_algo()
                    ),
                    os_error: None,
                }),
            });
        }
    }

    ledger.complete(rel).map_err(|e| engine_failure(task, e))?;
    tracing::debug!(file = %rel, bytes = copied, "file completed");

    if let Some(sink) = ctx.progress {
        let snapshot = ledger.snapshot(Some(rel));
        sink.on_file_completed(rel, &snapshot);
        sink.on_progress(&snapshot);
    }

    if ctx.options.mode == Mode::Move {
        if let Err(e) = fs_ops::remove_source_file(&src) {
            tracing::warn!(file = %rel, error = %e, "failed to remove moved source file");
        }
    }

    Ok(())
}

/// Digest the copy must match, computing it now if the scan could not.
fn expected_digest(
    ctx: &WorkerContext<'_>,
    task: &FileTask,
    src: &Path,
) -> Result<Option<ChecksumValue>, TaskError> {
    let Some(algorithm) = ctx.options.verify else {
        return Ok(None);
    };
    match &task.expected_digest {
        Some(digest) if digest.algorithm() == algorithm => Ok(Some(digest.clone())),
        _ => compute_file_checksum(src, algorithm)
            .map(Some)
            .map_err(|e| engine_failure(task, e)),
    }
}
