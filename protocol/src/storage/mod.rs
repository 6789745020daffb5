// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Storage Module
//!
//! Persistent storage for a Quire instance. One sled database holds the
//! repository (records, blocks, commits) and, in separate trees, the
//! embedded ledger and the encrypted key store.
//!
//! ## Design Decisions
//!
//! 1. **One transaction per commit.** A record change, its block, its
//!    commit and both sequence counters are written in a single sled
//!    multi-tree transaction.
//!
//! 2. **Bincode on disk, JSON on the wire.** Rows are bincode. Record
//!    bodies are kept as canonical JSON bytes because those bytes are what
//!    the CID names.
//!
//! 3. **Nothing is deleted.** Record deletion writes a tombstone, rotated
//!    keys are marked invalid, ledger operations only append.

pub mod db;

pub use db::{DbError, DbResult, PendingWrite, QuireDb, RecordChange, RecordEntry};
