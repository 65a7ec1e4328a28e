//! Integrity: SHA-256 over the bytes that travel (compressed form when compressed).

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify reassembled bytes against the digest the sender announced.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> bool {
    digest(payload) == *expected
}
