//! Content hashing for staleness detection.
//!
//! A single SHA-256 helper shared by the rewriter (post-image hashes) and
//! the transaction manager (pre-image hashes, validate-phase comparison).

use sha2::{Digest, Sha256};

/// Lowercase hex-encoded SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
