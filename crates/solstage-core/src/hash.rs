// SHA-256 content hashing for filter documents.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HashError {
    #[error("hash must be 64 hex characters, got {0}")]
    BadLength(usize),

    #[error("invalid hex in hash: {0}")]
    BadHex(String),
}

/// Raw SHA-256 digest of `bytes`.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `bytes`. This is the form anchored on-chain and
/// compared against downloaded documents.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Parse a 64-character hex hash back into bytes.
pub fn hex_to_hash(s: &str) -> Result<[u8; 32], HashError> {
    if s.len() != 64 {
        return Err(HashError::BadLength(s.len()));
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|e| HashError::BadHex(e.to_string()))?;
    Ok(out)
}
