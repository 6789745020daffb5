// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Repository Module
//!
//! Per-DID record collections with a tamper-evident commit chain, and the
//! firehose that replicates those commits in global order.
//!
//! ## Architecture
//!
//! ```text
//! uri.rs        -- at:// record URIs and their validation
//! tid.rs        -- sortable timestamp record keys
//! commit.rs     -- Commit, CommitOp, chain verification
//! repository.rs -- record CRUD, sequence retry loop, broadcast
//! firehose.rs   -- backlog + live event stream
//! ```

pub mod commit;
pub mod firehose;
pub mod repository;
pub mod tid;
pub mod uri;

pub use commit::{verify_commit_chain, ChainFault, ChainReport, Commit, CommitOp};
pub use firehose::FirehoseEvent;
pub use repository::{
    CreateRecordInput, DeleteRecordInput, ListOptions, PutRecordInput, RecordPage, RecordView,
    RepoError, Repository, WriteResult,
};
pub use tid::TidClock;
pub use uri::{AtUri, UriError};
