//! Content digests used to verify copied files.
//!
//! This module provides:
//! - Digest algorithms (SHA-256, BLAKE3, MD5) backed by their crates
//! - Streaming file digests that never hold a whole file in memory
//! - Verification of a file against an expected digest

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer for digest computation.
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
    /// MD5 (deprecated, kept for compatibility with older manifests)
    Md5,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

impl ChecksumAlgorithm {
    /// Parse algorithm from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }
}

/// A computed digest value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Lowercase hex digest
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental digest computation
pub trait ChecksumHasher {
    /// Feed more data into the hasher
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the digest
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute the digest of an in-memory buffer
pub fn checksum_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of a file, streaming it in fixed-size blocks
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    let read_error = |e: std::io::Error| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }

    Ok(hasher.finalize())
}

/// Check a file against an expected digest.
///
/// Returns `Ok(false)` on mismatch and `Err` only if the file cannot be read.
pub fn verify_file(path: &Path, expected: &ChecksumValue) -> Result<bool, EngineError> {
    let actual = compute_file_checksum(path, expected.algorithm())?;
    Ok(actual.hex() == expected.hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(ChecksumAlgorithm::from_str("md5"), Some(ChecksumAlgorithm::Md5));
        assert_eq!(ChecksumAlgorithm::from_str("SHA256"), Some(ChecksumAlgorithm::Sha256));
        assert_eq!(ChecksumAlgorithm::from_str("blake3"), Some(ChecksumAlgorithm::Blake3));
        assert_eq!(ChecksumAlgorithm::from_str("crc32"), None);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            checksum_bytes(b"hello", ChecksumAlgorithm::Md5).hex(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            checksum_bytes(b"hello", ChecksumAlgorithm::Sha256).hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let blake = checksum_bytes(b"hello", ChecksumAlgorithm::Blake3);
        assert_eq!(blake.hex().len(), 64);
        assert_eq!(blake.hex(), blake3::hash(b"hello").to_hex().as_str());
    }

    #[test]
    fn test_checksum_value_display() {
        let cs = ChecksumValue::new(ChecksumAlgorithm::Sha256, "abc123".to_string());
        assert_eq!(cs.to_string(), "abc123");
        assert_eq!(cs.to_string_with_algo(), "sha256:abc123");
    }

    #[test]
    fn test_file_checksum_streams_across_blocks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("large.bin");

        // Spans several read blocks and ends mid-block.
        let data: Vec<u8> = (0..(DIGEST_BUFFER_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(&data).expect("Failed to write file");
        drop(file);

        for algorithm in [
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Blake3,
            ChecksumAlgorithm::Md5,
        ] {
            let from_file = compute_file_checksum(&path, algorithm).expect("Digest should succeed");
            assert_eq!(from_file, checksum_bytes(&data, algorithm));
        }
    }

    #[test]
    fn test_verify_file_match_and_mismatch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("file.txt");
        std::fs::write(&path, b"identical content").expect("Failed to write file");

        let expected = checksum_bytes(b"identical content", ChecksumAlgorithm::Sha256);
        assert!(verify_file(&path, &expected).expect("Verification should succeed"));

        std::fs::write(&path, b"tampered content!").expect("Failed to write file");
        assert!(!verify_file(&path, &expected).expect("Verification should succeed even with mismatch"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("nope"), ChecksumAlgorithm::Sha256);
        assert!(matches!(result, Err(EngineError::ReadError { .. })));
    }

    #[test]
    fn test_checksum_value_serde() {
        let cs = checksum_bytes(b"abc", ChecksumAlgorithm::Blake3);
        let json = serde_json::to_string(&cs).expect("Serialize should succeed");
        assert!(json.contains("\"blake3\""));
        let back: ChecksumValue = serde_json::from_str(&json).expect("Deserialize should succeed");
        assert_eq!(back, cs);
    }
}
