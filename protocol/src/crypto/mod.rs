// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Cryptographic Primitives for Quire
//!
//! Boring, well-audited building blocks, each a thin typed wrapper:
//!
//! - **ECDSA P-256 / SHA-256** for ledger operations and HTTP signatures.
//! - **AES-256-GCM** for private keys at rest.
//! - **SHA-256** for CIDs, DID derivation and content digests.

pub mod encryption;
pub mod hash;
pub mod keys;

pub use encryption::{decrypt, encrypt, EncryptionError};
pub use hash::{sha256, sha256_hex};
pub use keys::{
    generate_key_pair, public_key_from_multibase, public_key_to_multibase, GeneratedKeyPair,
    KeyError, P256PublicKey, SigningKeypair,
};
