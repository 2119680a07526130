//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Walking a source tree into relative file and directory lists
//! - Creating destination directories
//! - Preserving timestamps
//! - Removing a drained source tree after a move

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::EngineError;

/// One regular file found under a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// `/`-separated path relative to the scanned root
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

/// Result of walking a tree.
#[derive(Debug, Default)]
pub struct ScannedTree {
    /// Files in discovery order (entries sorted by name within each directory)
    pub files: Vec<ScannedFile>,
    /// Relative directory paths, parents before children
    pub directories: Vec<String>,
}

impl ScannedTree {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Enumerate the source directory tree.
///
/// Symbolic links and entries whose names are not valid UTF-8 are not
/// migrated; they are logged and skipped.
///
/// # Errors
/// Returns EngineError if any directory cannot be read
pub fn enumerate_tree(source: &Path) -> Result<ScannedTree, EngineError> {
    let mut tree = ScannedTree::default();

    fn recurse(path: &Path, rel_path: &str, tree: &mut ScannedTree) -> Result<(), EngineError> {
        let enumeration_failed = |e: io::Error| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        };

        let mut entries = fs::read_dir(path)
            .map_err(enumeration_failed)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(enumeration_failed)?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let entry_path = entry.path();
            let file_type = entry.file_type().map_err(enumeration_failed)?;

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                tracing::warn!(path = %entry_path.display(), "skipping entry with non-UTF-8 name");
                continue;
            };
            let rel_full_path = if rel_path.is_empty() {
                name.to_string()
            } else {
                format!("{rel_path}/{name}")
            };

            if file_type.is_symlink() {
                tracing::warn!(path = %entry_path.display(), "skipping symbolic link");
            } else if file_type.is_dir() {
                tree.directories.push(rel_full_path.clone());
                recurse(&entry_path, &rel_full_path, tree)?;
            } else {
                let metadata = entry.metadata().map_err(enumeration_failed)?;
                tree.files.push(ScannedFile {
                    relative_path: rel_full_path,
                    absolute_path: entry_path,
                    size: metadata.len(),
                });
            }
        }
        Ok(())
    }

    recurse(source, "", &mut tree)?;
    Ok(tree)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails or the parent is a file
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Create `root` and every relative directory under it. Existing ones are fine.
pub fn create_directories(root: &Path, directories: &[String]) -> Result<(), EngineError> {
    let create = |path: PathBuf| {
        fs::create_dir_all(&path).map_err(|e| EngineError::DirectoryCreationFailed { path, source: e })
    };

    create(root.to_path_buf())?;
    for dir in directories {
        create(crate::model::relative_to_path(root, dir))?;
    }
    Ok(())
}

/// Copy access and modification times from `src` to `dst`.
pub fn copy_timestamps(src: &Path, dst: &Path) -> Result<(), EngineError> {
    let metadata = fs::metadata(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    let atime = filetime::FileTime::from_last_access_time(&metadata);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })
}

/// Delete a source file after its copy has been recorded. Missing is fine.
pub fn remove_source_file(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Remove every empty directory under and including `root`, deepest first.
///
/// Files are never deleted here. Returns the number of entries left behind
/// (files, links, or directories that stayed non-empty).
pub fn remove_empty_tree(root: &Path) -> Result<usize, EngineError> {
    fn prune(dir: &Path) -> Result<usize, EngineError> {
        let entries = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut leftover = 0;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::EnumerationFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                leftover += prune(&entry.path())?;
            } else {
                tracing::warn!(path = %entry.path().display(), "leaving unexpected entry in source tree");
                leftover += 1;
            }
        }

        if leftover == 0 {
            fs::remove_dir(dir).map_err(|e| EngineError::WriteError {
                path: dir.to_path_buf(),
                source: e,
            })?;
            Ok(0)
        } else {
            Ok(leftover + 1)
        }
    }

    match fs::symlink_metadata(root) {
        Ok(_) => prune(root),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(EngineError::EnumerationFailed {
            path: root.to_path_buf(),
            source: e,
        }),
    }
}

/// Make `path` absolute and lexically normalised without touching the disk.
pub fn absolute_path(path: &Path) -> Result<PathBuf, EngineError> {
    if path.as_os_str().is_empty() {
        return Err(EngineError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is empty".to_string(),
        });
    }

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| EngineError::InvalidPath {
                path: path.to_path_buf(),
                reason: format!("cannot resolve working directory: {e}"),
            })?
            .join(path)
    };

    let mut normalised = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    Ok(normalised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_enumerate_flat_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir(&src).expect("Failed to create src dir");

        let mut file1 = fs::File::create(src.join("file1.txt")).expect("Failed to create file1");
        file1.write_all(b"test data 1").expect("Failed to write file1");
        drop(file1);

        let mut file2 = fs::File::create(src.join("file2.txt")).expect("Failed to create file2");
        file2.write_all(b"test data 2").expect("Failed to write file2");
        drop(file2);

        let tree = enumerate_tree(&src).expect("Failed to enumerate");

        assert_eq!(tree.files.len(), 2, "Expected 2 files, got {}", tree.files.len());
        assert!(tree.directories.is_empty());
        assert_eq!(tree.total_bytes(), 22);
        assert_eq!(tree.files[0].relative_path, "file1.txt");
        assert_eq!(tree.files[1].relative_path, "file2.txt");
    }

    #[test]
    fn test_enumerate_nested_directory() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        let subdir = src.join("subdir");
        let empty = src.join("subdir").join("empty");
        fs::create_dir_all(&empty).expect("Failed to create dirs");

        fs::write(src.join("file1.txt"), b"data1").expect("Failed to write file1");
        fs::write(subdir.join("file2.txt"), b"data2").expect("Failed to write file2");

        let tree = enumerate_tree(&src).expect("Failed to enumerate");

        assert_eq!(tree.directories, vec!["subdir".to_string(), "subdir/empty".to_string()]);
        let rels: Vec<&str> = tree.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["file1.txt", "subdir/file2.txt"]);
        assert_eq!(tree.files[1].absolute_path, subdir.join("file2.txt"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_enumerate_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir(&src).expect("Failed to create src dir");
        fs::write(src.join("good.txt"), b"ok").expect("Failed to write file");
        fs::write(src.join(OsStr::from_bytes(b"bad\xff.bin")), b"skipped")
            .expect("Failed to write file");

        let tree = enumerate_tree(&src).expect("Unrepresentable names should not abort the scan");

        let rels: Vec<&str> = tree.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["good.txt"]);
    }

    #[test]
    fn test_enumerate_nonexistent_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = enumerate_tree(&temp_dir.path().join("nonexistent"));
        assert!(matches!(result, Err(EngineError::EnumerationFailed { .. })));
    }

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(temp_dir.path().join("subdir").is_dir());
    }

    #[test]
    fn test_ensure_parent_dir_rejects_file_parent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("blocker"), b"x").expect("Failed to write");
        let result = ensure_parent_dir_exists(&temp_dir.path().join("blocker").join("file.txt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_copy_timestamps() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a");
        let dst = temp_dir.path().join("b");
        fs::write(&src, b"a").expect("Failed to write");
        fs::write(&dst, b"a").expect("Failed to write");

        let old = filetime::FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&src, old).expect("Failed to set mtime");

        copy_timestamps(&src, &dst).expect("Failed to copy timestamps");
        let dst_meta = fs::metadata(&dst).expect("Failed to stat");
        assert_eq!(filetime::FileTime::from_last_modification_time(&dst_meta), old);
    }

    #[test]
    fn test_remove_empty_tree_keeps_leftovers() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("root");
        fs::create_dir_all(root.join("a").join("b")).expect("Failed to create dirs");
        fs::create_dir_all(root.join("c")).expect("Failed to create dirs");
        fs::write(root.join("c").join("late.txt"), b"x").expect("Failed to write");

        let leftover = remove_empty_tree(&root).expect("Prune should succeed");
        assert!(leftover > 0);
        assert!(!root.join("a").exists());
        assert!(root.join("c").join("late.txt").exists());

        fs::remove_file(root.join("c").join("late.txt")).expect("Failed to remove");
        assert_eq!(remove_empty_tree(&root).expect("Prune should succeed"), 0);
        assert!(!root.exists());
        assert_eq!(remove_empty_tree(&root).expect("Missing root is fine"), 0);
    }

    #[test]
    fn test_absolute_path_normalises() {
        let abs = absolute_path(Path::new("some/./dir/../file")).expect("Should resolve");
        assert!(abs.is_absolute());
        assert!(abs.ends_with("some/file"));
        assert!(absolute_path(Path::new("")).is_err());
    }
}
