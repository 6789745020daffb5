// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Commits
//!
//! A commit is the log entry written alongside every record mutation. For a
//! single DID the commits form a chain:
//!
//! ```text
//! commit_cid[1] = H({data: new_cid[1], prev: null})
//! commit_cid[n] = H({data: new_cid[n], prev: commit_cid[n-1]})
//! ```
//!
//! `local_seq` numbers a DID's commits `1, 2, 3, ...` with no gaps, and
//! `global_seq` orders every commit on the instance for replication.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addressing::{cid_string, compute_commit_cid, option_cid_string, Cid, CidError};

/// The kind of change a commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOp {
    Create,
    Update,
    Delete,
}

impl CommitOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitOp::Create => "create",
            CommitOp::Update => "update",
            CommitOp::Delete => "delete",
        }
    }
}

impl fmt::Display for CommitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the commit log.
///
/// Stored with bincode, so no field may be skipped conditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub global_seq: u64,
    pub local_seq: u64,
    pub did: String,
    pub record_uri: String,
    /// CID of the new record version, or of the tombstone document for a
    /// delete.
    #[serde(with = "cid_string")]
    pub new_cid: Cid,
    pub operation: CommitOp,
    /// CID of the record version this commit replaces.
    #[serde(with = "option_cid_string")]
    pub prev_cid: Option<Cid>,
    #[serde(with = "cid_string")]
    pub commit_cid: Cid,
    pub committed_at: DateTime<Utc>,
}

/// Outcome of re-deriving a DID's commit chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub did: String,
    pub length: u64,
    pub head: Option<Cid>,
    /// First problem found, if any.
    pub fault: Option<ChainFault>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.fault.is_none()
    }
}

/// Why a chain failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainFault {
    /// `local_seq` values are not exactly `1..=n`.
    SequenceGap { expected: u64, found: u64 },
    /// The stored commit CID does not match the recomputed one.
    CommitMismatch {
        local_seq: u64,
        stored: Cid,
        recomputed: Cid,
    },
    /// A commit belongs to a different DID.
    ForeignCommit { local_seq: u64, did: String },
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainFault::SequenceGap { expected, found } => {
                write!(f, "expected local seq {}, found {}", expected, found)
            }
            ChainFault::CommitMismatch {
                local_seq,
                stored,
                recomputed,
            } => write!(
                f,
                "commit {} stored {} but recomputes to {}",
                local_seq, stored, recomputed
            ),
            ChainFault::ForeignCommit { local_seq, did } => {
                write!(f, "commit {} belongs to {}", local_seq, did)
            }
        }
    }
}

/// Recompute every commit CID of `commits` (ordered by `local_seq`) from
/// genesis and report the first inconsistency.
pub fn verify_commit_chain(did: &str, commits: &[Commit]) -> Result<ChainReport, CidError> {
    let mut prev_commit: Option<Cid> = None;
    let mut fault = None;

    for (i, commit) in commits.iter().enumerate() {
        let expected_seq = i as u64 + 1;
        if commit.did != did {
            fault = Some(ChainFault::ForeignCommit {
                local_seq: commit.local_seq,
                did: commit.did.clone(),
            });
            break;
        }
        if commit.local_seq != expected_seq {
            fault = Some(ChainFault::SequenceGap {
                expected: expected_seq,
                found: commit.local_seq,
            });
            break;
        }

        let recomputed = compute_commit_cid(&commit.new_cid, prev_commit.as_ref())?;
        if recomputed != commit.commit_cid {
            fault = Some(ChainFault::CommitMismatch {
                local_seq: commit.local_seq,
                stored: commit.commit_cid,
                recomputed,
            });
            break;
        }
        prev_commit = Some(recomputed);
    }

    Ok(ChainReport {
        did: did.to_string(),
        length: commits.len() as u64,
        head: commits.last().map(|c| c.commit_cid),
        fault,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::compute_cid;
    use serde_json::json;

    const DID: &str = "did:plc:testtesttesttesttesttest";

    fn chain(n: u64) -> Vec<Commit> {
        let mut out = Vec::new();
        let mut prev: Option<Cid> = None;
        for seq in 1..=n {
            let new_cid = compute_cid(&json!({"n": seq})).unwrap();
            let commit_cid = compute_commit_cid(&new_cid, prev.as_ref()).unwrap();
            out.push(Commit {
                global_seq: seq * 10,
                local_seq: seq,
                did: DID.into(),
                record_uri: format!("at://{}/app.test.post/{}", DID, seq),
                new_cid,
                operation: CommitOp::Create,
                prev_cid: None,
                commit_cid,
                committed_at: Utc::now(),
            });
            prev = Some(commit_cid);
        }
        out
    }

    #[test]
    fn intact_chain_verifies() {
        let commits = chain(4);
        let report = verify_commit_chain(DID, &commits).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.length, 4);
        assert_eq!(report.head, Some(commits[3].commit_cid));
    }

    #[test]
    fn empty_chain_is_valid() {
        let report = verify_commit_chain(DID, &[]).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.head, None);
    }

    #[test]
    fn rewritten_history_is_detected() {
        let mut commits = chain(3);
        commits[1].new_cid = compute_cid(&json!({"n": "forged"})).unwrap();
        let report = verify_commit_chain(DID, &commits).unwrap();
        assert!(matches!(
            report.fault,
            Some(ChainFault::CommitMismatch { local_seq: 2, .. })
        ));
    }

    #[test]
    fn sequence_gap_is_detected() {
        let mut commits = chain(3);
        commits.remove(1);
        let report = verify_commit_chain(DID, &commits).unwrap();
        assert_eq!(
            report.fault,
            Some(ChainFault::SequenceGap {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn commit_json_uses_camel_case() {
        let commit = &chain(1)[0];
        let value = serde_json::to_value(commit).unwrap();
        assert_eq!(value["localSeq"], 1);
        assert_eq!(value["operation"], "create");
        assert!(value["prevCid"].is_null());
        assert_eq!(value["commitCid"], commit.commit_cid.to_string());
    }

    #[test]
    fn commit_survives_bincode() {
        let commit = chain(2).pop().unwrap();
        let bytes = bincode::serialize(&commit).unwrap();
        let back: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, commit);
    }
}
