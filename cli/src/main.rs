//! relocate - Command-line interface for the migration engine.
//!
//! Parses arguments, wires up logging and a stderr progress display, and maps
//! the migration outcome to an exit code: 0 completed, 1 cancelled, 2 error
//! or failed files. Re-running an interrupted migration resumes it.

use clap::Parser;
use relocate_engine::{
    fs_ops, CheckpointStore, ChecksumAlgorithm, EngineError, MigrationEngine, MigrationOptions,
    MigrationOutcome, MigrationProgress, MigrationReport, Mode, ProgressSink,
};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// relocate - resumable, verified directory migration
#[derive(Parser, Debug)]
#[command(name = "relocate")]
#[command(version)]
#[command(about = "Copy or move a directory tree in parallel, resuming interrupted runs")]
struct Args {
    /// Source directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Destination directory
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Operation mode: copy or move
    #[arg(long, value_name = "MODE", default_value = "copy")]
    mode: String,

    /// Verify every copy against a digest of its source
    #[arg(long)]
    verify: bool,

    /// Digest algorithm for verification: sha256, blake3, md5
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256", requires = "verify")]
    hash: String,

    /// Worker threads (defaults to the number of logical cores)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Allow writing into a destination that already exists
    #[arg(long)]
    allow_existing: bool,

    /// Do not load or save a checkpoint
    #[arg(long)]
    no_resume: bool,

    /// Do not copy file timestamps
    #[arg(long)]
    no_timestamps: bool,

    /// Checkpoint location (defaults to .<dst name>.relocate.json next to dst)
    #[arg(long, value_name = "PATH")]
    state_file: Option<PathBuf>,

    /// Cancel the migration after this many seconds; the checkpoint is kept
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

/// Prints migration progress to stderr.
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_progress_update: Mutex::new(now),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }
}

impl ProgressSink for CliProgress {
    fn on_migration_started(&self, progress: &MigrationProgress, resumed: bool) {
        if resumed {
            eprintln!("Resuming migration from checkpoint...");
            eprintln!(
                "  Already done: {} of {} files ({})",
                progress.files_completed,
                progress.total_files,
                Self::format_bytes(progress.bytes_copied)
            );
        } else {
            eprintln!("Starting migration...");
        }
        eprintln!(
            "  Total: {} across {} files",
            Self::format_bytes(progress.total_bytes),
            progress.total_files
        );
        eprintln!();
    }

    fn on_file_started(&self, relative_path: &str) {
        if self.verbose {
            eprintln!("\rStarting: {}", relative_path);
        }
    }

    fn on_progress(&self, progress: &MigrationProgress) {
        // Workers report after every chunk; print at most once per 200ms.
        {
            let mut last = self
                .last_progress_update
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < Duration::from_millis(200) {
                return;
            }
            *last = Instant::now();
        }

        eprint!(
            "\rProgress: {} | {}/{}",
            Self::progress_bar(progress.percent()),
            Self::format_bytes(progress.bytes_copied),
            Self::format_bytes(progress.total_bytes)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_file_completed(&self, relative_path: &str, progress: &MigrationProgress) {
        if self.verbose {
            eprintln!(
                "\r[{}/{}] Done: {}",
                progress.files_completed, progress.total_files, relative_path
            );
        }
    }

    fn on_migration_finished(&self, report: &MigrationReport) {
        eprintln!();
        match report.outcome {
            MigrationOutcome::Completed => eprintln!("Migration complete!"),
            MigrationOutcome::Cancelled => {
                eprintln!("Migration cancelled. Run the same command again to resume.")
            }
            MigrationOutcome::Failed => {
                eprintln!("Migration stopped on errors. Run the same command again to retry.")
            }
        }

        eprintln!(
            "Summary: {}/{} files, {} failed",
            report.files_completed,
            report.total_files,
            report.failures.len()
        );
        eprintln!(
            "Bytes at destination: {} of {}",
            Self::format_bytes(report.bytes_copied),
            Self::format_bytes(report.total_bytes)
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !report.failures.is_empty() {
            eprintln!();
            eprintln!("Failed files:");
            for failure in &report.failures {
                match failure.os_error {
                    Some(code) => {
                        eprintln!("  {}: {} (os error {})", failure.relative_path, failure.reason, code)
                    }
                    None => eprintln!("  {}: {}", failure.relative_path, failure.reason),
                }
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse arguments, run the migration and exit with its status
fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let result = run_cli(&args);
    if let Err(msg) = &result {
        eprintln!("Error: {}", msg);
    }

    std::process::exit(exit_code(&result));
}

fn exit_code(result: &Result<MigrationOutcome, String>) -> i32 {
    match result {
        Ok(MigrationOutcome::Completed) => 0,
        Ok(MigrationOutcome::Cancelled) => 1,
        Ok(MigrationOutcome::Failed) | Err(_) => 2,
    }
}

fn build_options(args: &Args) -> Result<MigrationOptions, String> {
    let mode = match args.mode.to_lowercase().as_str() {
        "copy" => Mode::Copy,
        "move" => Mode::Move,
        _ => {
            return Err(format!(
                "Invalid mode '{}'. Must be 'copy' or 'move'",
                args.mode
            ))
        }
    };

    let mut options = MigrationOptions::default()
        .with_mode(mode)
        .with_allow_existing(args.allow_existing)
        .with_preserve_timestamps(!args.no_timestamps);

    if args.verify {
        let algorithm = ChecksumAlgorithm::from_str(&args.hash).ok_or_else(|| {
            format!(
                "Invalid hash algorithm '{}'. Must be 'sha256', 'blake3', or 'md5'",
                args.hash
            )
        })?;
        options = options.with_verify(algorithm);
    }

    match args.workers {
        Some(0) => return Err("Worker count must be at least 1".to_string()),
        Some(n) => options = options.with_workers(n),
        None => {}
    }

    if args.no_resume {
        options = options.without_resume();
    }

    Ok(options)
}

fn describe_error(error: &EngineError) -> String {
    if error.is_precondition() {
        format!("Cannot start migration: {}", error)
    } else {
        format!("Migration could not run: {}", error)
    }
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<MigrationOutcome, String> {
    let options = build_options(args)?;

    let dst = fs_ops::absolute_path(&args.dst).map_err(|e| e.to_string())?;
    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            return Err(format!(
                "Parent of destination does not exist: {}",
                parent.display()
            ));
        }
    }

    let store = match &args.state_file {
        Some(path) => CheckpointStore::new(path),
        None => CheckpointStore::beside(&dst),
    };
    let engine = MigrationEngine::new(store);
    tracing::debug!(state_file = %engine.store().path().display(), "using checkpoint location");
    let progress = CliProgress::new(args.verbose);

    let report = std::thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        if let Some(secs) = args.timeout {
            let engine = &engine;
            scope.spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(Duration::from_secs(secs)) {
                    tracing::warn!(timeout_secs = secs, "deadline reached, cancelling migration");
                    engine.request_cancel();
                }
            });
        }
        let result = engine.migrate(&args.src, &dst, &options, Some(&progress));
        drop(done_tx);
        result
    })
    .map_err(|e| describe_error(&e))?;

    match report.outcome {
        MigrationOutcome::Failed => Err(format!(
            "{} file(s) failed to migrate",
            report.failures.len()
        )),
        outcome => Ok(outcome),
    }
}
