//! Streaming SHA256 verification of model files.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

use crate::error::ModelError;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Hex-encoded SHA256 of the file at `path`, read in fixed-size blocks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Case-insensitive comparison of two hex digests.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Verify `path` against `expected`.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), ModelError> {
    let actual = sha256_file(path)?;
    if checksums_match(expected, &actual) {
        debug!("Checksum verified for {:?}: {}", path, actual);
        Ok(())
    } else {
        Err(ModelError::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}
