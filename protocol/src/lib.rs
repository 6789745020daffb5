// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Quire: Core Library
//!
//! Quire hosts user-owned data repositories. Each repository belongs to a
//! DID, every record in it is content-addressed, and every change lands in
//! a hash-linked commit log that other instances can replay.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants and the instance configuration.
//! - **crypto**: P-256 keys, AES-256-GCM sealing, hashing helpers.
//! - **addressing**: Canonical JSON and CIDv1 computation.
//! - **identity**: DID documents, the operation chain, the embedded and
//!   remote ledgers, and the encrypted key store.
//! - **storage**: sled trees and the write transaction behind commits.
//! - **repo**: Record URIs, TIDs, the repository store and the firehose.
//! - **httpsig**: RFC 9421 request signing between instances.
//! - **pds**: The [`pds::Pds`] facade tying the above together.
//!
//! ## Guarantees
//!
//! 1. A record change and its commit are written atomically.
//! 2. Local sequences per DID are gap-free; the global sequence totally
//!    orders all commits.
//! 3. Resolving a DID either verifies the whole operation chain or fails.
//! 4. Private keys are only ever decrypted for a single signature.

pub mod addressing;
pub mod config;
pub mod crypto;
pub mod httpsig;
pub mod identity;
pub mod pds;
pub mod repo;
pub mod storage;

pub use pds::{Pds, PdsError};
