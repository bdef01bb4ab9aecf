//! Content hashing and digest comparison.
//!
//! BLAKE3 is the manifest digest; SHA256 is accepted for download
//! verification only. All digests are lowercase hex and compared
//! case-insensitively.

use crate::config::CacheConfig;
use crate::error::{KeelError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the BLAKE3 digest of a file as lowercase hex.
pub fn compute_blake3(path: impl AsRef<Path>) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    stream_file(path.as_ref(), |chunk| {
        hasher.update(chunk);
    })?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the SHA256 digest of a file as lowercase hex.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut hasher = Sha256::new();
    stream_file(path.as_ref(), |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

/// BLAKE3 digest of an in-memory buffer.
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Case-insensitive digest comparison. Empty digests never match.
pub fn hashes_match(a: &str, b: &str) -> bool {
    !a.is_empty() && a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

/// Check a file against an expected BLAKE3 digest.
///
/// An empty expectation or an unreadable file reports `false`.
pub fn file_matches_blake3(path: impl AsRef<Path>, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    compute_blake3(path)
        .map(|actual| hashes_match(&actual, expected))
        .unwrap_or(false)
}

/// Verify a file against an expected BLAKE3 digest.
pub fn verify_blake3(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_blake3(path)?;
    if hashes_match(&actual, expected) {
        Ok(())
    } else {
        Err(KeelError::HashMismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

fn stream_file(path: &Path, mut sink: impl FnMut(&[u8])) -> Result<()> {
    let mut file = std::fs::File::open(path).map_err(|e| KeelError::io_with_path(e, path))?;
    let mut buffer = vec![0u8; CacheConfig::HASH_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| KeelError::io_with_path(e, path))?;
        if n == 0 {
            break;
        }
        sink(&buffer[..n]);
    }
    Ok(())
}
