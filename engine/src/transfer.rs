//! Chunked single-file transfer with resume support.
//!
//! Copies one file in bounded chunks starting at an arbitrary byte offset,
//! reporting progress after each chunk and polling a cancel signal before
//! each one. The caller persists the returned offset; resuming is just
//! "open fresh, seek to offset".

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::TransferError;
use crate::model::Mode;

/// Files up to this size are copied in a single chunk sized to the file.
pub const SMALL_FILE_THRESHOLD: u64 = 64 * 1024;

/// Chunk size for ordinary files.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size for files above [`LARGE_FILE_THRESHOLD`].
pub const LARGE_CHUNK_SIZE: usize = 256 * 1024;

pub const LARGE_FILE_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Pick the copy buffer size for a file of `file_size` bytes.
pub fn chunk_size_for(file_size: u64) -> usize {
    if file_size <= SMALL_FILE_THRESHOLD {
        (file_size as usize).max(1)
    } else if file_size <= LARGE_FILE_THRESHOLD {
        DEFAULT_CHUNK_SIZE
    } else {
        LARGE_CHUNK_SIZE
    }
}

/// Copy `source` to `destination` starting at `start_offset`.
///
/// `on_progress(bytes_copied, total_bytes)` runs after every chunk. `cancel`
/// is checked before every chunk; on cancellation the partial destination is
/// left in place and [`TransferError::Cancelled`] carries the offset reached.
/// Any offset returned in an error has been synced to disk first, so it is
/// safe to checkpoint.
///
/// A `start_offset` greater than zero opens the existing destination,
/// truncates anything past the offset and continues from there. If the
/// destination is missing or shorter than the offset the copy restarts at 0.
///
/// With [`Mode::Move`] the source is deleted once the copy fully succeeds.
///
/// Returns the number of bytes the destination holds, which always equals the
/// source size observed when it was opened.
pub fn transfer_file<F>(
    source: &Path,
    destination: &Path,
    start_offset: u64,
    mode: Mode,
    mut on_progress: F,
    cancel: &CancelToken,
) -> Result<u64, TransferError>
where
    F: FnMut(u64, u64),
{
    let read_error = |bytes_copied: u64, e: io::Error| TransferError::Read {
        path: source.to_path_buf(),
        bytes_copied,
        source: e,
    };
    let write_error = |bytes_copied: u64, e: io::Error| TransferError::Write {
        path: destination.to_path_buf(),
        bytes_copied,
        source: e,
    };

    let mut src = File::open(source).map_err(|e| read_error(start_offset, e))?;
    let total_bytes = src
        .metadata()
        .map_err(|e| read_error(start_offset, e))?
        .len();

    let offset = resume_offset(destination, start_offset, total_bytes);

    let mut dst = if offset == 0 {
        File::create(destination).map_err(|e| write_error(0, e))?
    } else {
        let mut dst = OpenOptions::new()
            .write(true)
            .open(destination)
            .map_err(|e| write_error(offset, e))?;
        // Bytes past the recorded offset were never acknowledged.
        dst.set_len(offset).map_err(|e| write_error(offset, e))?;
        dst.seek(SeekFrom::Start(offset))
            .map_err(|e| write_error(offset, e))?;
        src.seek(SeekFrom::Start(offset))
            .map_err(|e| read_error(offset, e))?;
        dst
    };

    let mut buffer = vec![0u8; chunk_size_for(total_bytes)];
    let mut copied = offset;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled {
                bytes_copied: durable_offset(&dst, destination, copied, offset),
            });
        }

        let n = match src.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(durable_offset(&dst, destination, copied, offset), e)),
        };

        if let Err(e) = dst.write_all(&buffer[..n]) {
            return Err(write_error(durable_offset(&dst, destination, copied, offset), e));
        }
        copied += n as u64;
        on_progress(copied, total_bytes);
    }

    dst.sync_all().map_err(|e| write_error(copied, e))?;

    if copied != total_bytes {
        return Err(TransferError::SizeMismatch {
            path: source.to_path_buf(),
            expected: total_bytes,
            actual: copied,
        });
    }

    if mode == Mode::Move {
        drop(src);
        fs::remove_file(source).map_err(|e| TransferError::Write {
            path: source.to_path_buf(),
            bytes_copied: copied,
            source: e,
        })?;
    }

    Ok(copied)
}

/// Flush `copied` bytes of `dst` to stable storage before the offset is
/// handed out for checkpointing.
///
/// If the sync fails only `fallback`, the offset this attempt started from,
/// is known to be on disk.
fn durable_offset(dst: &File, destination: &Path, copied: u64, fallback: u64) -> u64 {
    match dst.sync_data() {
        Ok(()) => copied,
        Err(e) => {
            tracing::warn!(
                path = %destination.display(),
                copied,
                fallback,
                error = %e,
                "could not sync partial destination"
            );
            fallback
        }
    }
}

/// Offset the destination can actually continue from.
fn resume_offset(destination: &Path, requested: u64, total_bytes: u64) -> u64 {
    if requested == 0 {
        return 0;
    }
    if requested > total_bytes {
        tracing::warn!(
            path = %destination.display(),
            requested,
            total_bytes,
            "resume offset beyond source size, restarting file"
        );
        return 0;
    }
    match fs::metadata(destination) {
        Ok(meta) if meta.is_file() && meta.len() >= requested => requested,
        Ok(meta) => {
            tracing::warn!(
                path = %destination.display(),
                requested,
                present = meta.len(),
                "destination shorter than resume offset, restarting file"
            );
            0
        }
        Err(_) => {
            tracing::warn!(
                path = %destination.display(),
                requested,
                "destination missing for resume, restarting file"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).expect("Failed to write test file");
        path
    }

    #[test]
    fn test_chunk_size_selection() {
        assert_eq!(chunk_size_for(0), 1);
        assert_eq!(chunk_size_for(1000), 1000);
        assert_eq!(chunk_size_for(SMALL_FILE_THRESHOLD), SMALL_FILE_THRESHOLD as usize);
        assert_eq!(chunk_size_for(SMALL_FILE_THRESHOLD + 1), DEFAULT_CHUNK_SIZE);
        assert_eq!(chunk_size_for(LARGE_FILE_THRESHOLD + 1), LARGE_CHUNK_SIZE);
    }

    #[test]
    fn test_full_copy_reports_progress() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = patterned(200_000);
        let src = create_test_file(dir.path(), "src.bin", &data);
        let dst = dir.path().join("dst.bin");

        let mut reports = Vec::new();
        let copied = transfer_file(
            &src,
            &dst,
            0,
            Mode::Copy,
            |done, total| reports.push((done, total)),
            &CancelToken::new(),
        )
        .expect("Transfer should succeed");

        assert_eq!(copied, data.len() as u64);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
        assert!(src.exists());
        // 200_000 bytes in 64 KiB chunks.
        assert_eq!(reports.len(), 4);
        assert_eq!(reports.last(), Some(&(200_000, 200_000)));
        assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_small_file_single_chunk() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = create_test_file(dir.path(), "small.txt", b"hello world");
        let dst = dir.path().join("out.txt");

        let mut calls = 0;
        transfer_file(&src, &dst, 0, Mode::Copy, |_, _| calls += 1, &CancelToken::new())
            .expect("Transfer should succeed");
        assert_eq!(calls, 1);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"hello world");
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = create_test_file(dir.path(), "empty", b"");
        let dst = dir.path().join("empty.out");

        let copied = transfer_file(&src, &dst, 0, Mode::Copy, |_, _| {}, &CancelToken::new())
            .expect("Transfer should succeed");
        assert_eq!(copied, 0);
        assert!(dst.exists());
    }

    #[test]
    fn test_resume_from_offset() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = patterned(150_000);
        let src = create_test_file(dir.path(), "src.bin", &data);
        // Destination holds the first 65536 bytes plus some unacknowledged garbage.
        let mut partial = data[..65_536].to_vec();
        partial.extend_from_slice(b"garbage past the checkpoint");
        let dst = create_test_file(dir.path(), "dst.bin", &partial);

        let mut first_report = None;
        let copied = transfer_file(
            &src,
            &dst,
            65_536,
            Mode::Copy,
            |done, _| {
                first_report.get_or_insert(done);
            },
            &CancelToken::new(),
        )
        .expect("Resume should succeed");

        assert_eq!(copied, 150_000);
        assert_eq!(first_report, Some(131_072));
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
    }

    #[test]
    fn test_durable_offset_after_sync() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = create_test_file(dir.path(), "partial.bin", &patterned(1_000));
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open file");

        assert_eq!(durable_offset(&file, &path, 1_000, 0), 1_000);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_durable_offset_falls_back_when_sync_fails() {
        // Character devices reject fsync.
        let path = Path::new("/dev/null");
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .expect("Failed to open /dev/null");

        assert_eq!(durable_offset(&file, path, 131_072, 65_536), 65_536);
    }

    #[test]
    fn test_resume_with_missing_destination_restarts() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = patterned(100_000);
        let src = create_test_file(dir.path(), "src.bin", &data);
        let dst = dir.path().join("gone.bin");

        let mut first_report = None;
        transfer_file(
            &src,
            &dst,
            50_000,
            Mode::Copy,
            |done, _| {
                first_report.get_or_insert(done);
            },
            &CancelToken::new(),
        )
        .expect("Transfer should succeed");

        assert_eq!(first_report, Some(DEFAULT_CHUNK_SIZE as u64));
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
    }

    #[test]
    fn test_cancel_between_chunks_reports_offset() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = patterned(300_000);
        let src = create_test_file(dir.path(), "src.bin", &data);
        let dst = dir.path().join("dst.bin");
        let cancel = CancelToken::new();

        let result = transfer_file(
            &src,
            &dst,
            0,
            Mode::Move,
            |done, _| {
                if done >= 2 * DEFAULT_CHUNK_SIZE as u64 {
                    cancel.cancel();
                }
            },
            &cancel,
        );

        match result {
            Err(TransferError::Cancelled { bytes_copied }) => {
                assert_eq!(bytes_copied, 2 * DEFAULT_CHUNK_SIZE as u64);
                let written = fs::read(&dst).expect("Failed to read dest");
                assert_eq!(written.as_slice(), &data[..bytes_copied as usize]);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        // Move semantics never delete on a partial copy.
        assert!(src.exists());

        // Finish from the reported offset.
        let copied = transfer_file(
            &src,
            &dst,
            2 * DEFAULT_CHUNK_SIZE as u64,
            Mode::Copy,
            |_, _| {},
            &CancelToken::new(),
        )
        .expect("Resume should succeed");
        assert_eq!(copied, 300_000);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), data);
    }

    #[test]
    fn test_move_deletes_source_on_success() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = create_test_file(dir.path(), "src.txt", b"moving");
        let dst = dir.path().join("dst.txt");

        transfer_file(&src, &dst, 0, Mode::Move, |_, _| {}, &CancelToken::new())
            .expect("Move should succeed");
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), b"moving");
    }

    #[test]
    fn test_growing_source_is_size_mismatch() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data = patterned(100_000);
        let src = create_test_file(dir.path(), "src.bin", &data);
        let dst = dir.path().join("dst.bin");

        let mut appended = false;
        let result = transfer_file(
            &src,
            &dst,
            0,
            Mode::Move,
            |_, _| {
                if !appended {
                    let mut f = OpenOptions::new()
                        .append(true)
                        .open(&src)
                        .expect("Failed to open source for append");
                    f.write_all(&[7u8; 1000]).expect("Failed to append");
                    appended = true;
                }
            },
            &CancelToken::new(),
        );

        match result {
            Err(err @ TransferError::SizeMismatch { .. }) => assert_eq!(err.bytes_copied(), 0),
            other => panic!("expected size mismatch, got {other:?}"),
        }
        assert!(src.exists());
    }

    #[test]
    fn test_missing_source_is_read_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = transfer_file(
            &dir.path().join("missing"),
            &dir.path().join("out"),
            0,
            Mode::Copy,
            |_, _| {},
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(TransferError::Read { bytes_copied: 0, .. })));
    }

    #[test]
    fn test_unwritable_destination_is_write_error() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = create_test_file(dir.path(), "src.txt", b"data");
        let result = transfer_file(
            &src,
            &dir.path().join("no_such_dir").join("out"),
            0,
            Mode::Copy,
            |_, _| {},
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(TransferError::Write { .. })));
    }
}
