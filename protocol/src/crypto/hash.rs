// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Hashing Utilities
//!
//! SHA-256 is the only digest in Quire. CIDs, DID derivation, ledger
//! operation chaining and HTTP `Content-Digest` all go through here, so
//! there is exactly one place to audit.

use sha2::{Digest, Sha256};

/// SHA-256 of `data` as a fixed-size array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over several slices without concatenating them first.
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hex-encoded SHA-256. Handy for log fields.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Lowercase, unpadded RFC 4648 base32 of `data`.
pub fn base32_lower(data: &[u8]) -> String {
    let encoded = multibase::encode(multibase::Base::Base32Lower, data);
    // Drop the single-character multibase prefix ('b').
    encoded[1..].to_string()
}
