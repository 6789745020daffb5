// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # QuireDb: Persistent Storage Engine
//!
//! The persistence layer for records, blocks and the commit log, built on
//! sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree          | Key                              | Value                  |
//! |---------------|----------------------------------|------------------------|
//! | `records`     | `did \0 collection \0 rkey`      | `bincode(RecordEntry)` |
//! | `blocks`      | CID bytes                        | canonical JSON bytes   |
//! | `commits`     | `global_seq` (8B BE)             | `bincode(Commit)`      |
//! | `did_commits` | `did \0 local_seq` (8B BE)       | `global_seq` (8B BE)   |
//! | `metadata`    | key (UTF-8)                      | value (bytes)          |
//!
//! Sequence numbers are big-endian so that sled's lexicographic order is
//! numeric order. A reverse prefix scan over `did_commits` yields a DID's
//! highest local sequence in one step.
//!
//! The identity layer opens its own trees (`ledger_ops`, `signing_keys`)
//! through [`QuireDb::open_tree`].
//!
//! ## Atomicity
//!
//! [`QuireDb::apply_write`] runs one serializable multi-tree transaction
//! over all five trees. The record row, the block, the commit, the
//! per-DID sequence slot and the global counter land together or not at
//! all. The `(did, local_seq)` slot in `did_commits` is the uniqueness
//! constraint: a writer that finds it taken aborts with
//! [`DbError::SequenceTaken`] and the repository retries.

use std::ops::Bound;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{abort, ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, IVec, Tree};

use crate::addressing::{canonical_bytes, cid_for_bytes, cid_string, compute_commit_cid, Cid};
use crate::repo::commit::{Commit, CommitOp};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),

    /// Another writer claimed this `(did, local_seq)` slot first.
    #[error("local sequence {local_seq} already taken for {did}")]
    SequenceTaken { did: String, local_seq: u64 },

    #[error("storage integrity violated: {0}")]
    Integrity(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A row of the `records` tree. The record body lives in `blocks` under
/// `cid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub uri: String,
    #[serde(with = "cid_string")]
    pub cid: Cid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone marker. Deleted rows stay in the tree.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RecordEntry {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// The record-level half of a write.
#[derive(Debug, Clone)]
pub enum RecordChange {
    /// Create or replace the record with these canonical bytes.
    Upsert { cid: Cid, canonical: Vec<u8> },
    /// Tombstone the live record.
    Delete,
}

/// Everything [`QuireDb::apply_write`] needs for one commit.
#[derive(Debug, Clone)]
pub struct PendingWrite<'a> {
    pub did: &'a str,
    pub collection: &'a str,
    pub record_key: &'a str,
    pub uri: &'a str,
    pub change: &'a RecordChange,
    /// The slot this writer is trying to claim.
    pub local_seq: u64,
    pub committed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree for the last assigned global seq.
const META_GLOBAL_SEQ: &[u8] = b"global_seq";

fn record_prefix(did: &str, collection: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(did.len() + collection.len() + 2);
    key.extend_from_slice(did.as_bytes());
    key.push(0);
    key.extend_from_slice(collection.as_bytes());
    key.push(0);
    key
}

fn record_row_key(did: &str, collection: &str, record_key: &str) -> Vec<u8> {
    let mut key = record_prefix(did, collection);
    key.extend_from_slice(record_key.as_bytes());
    key
}

fn did_prefix(did: &str) -> Vec<u8> {
    let mut key = did.as_bytes().to_vec();
    key.push(0);
    key
}

fn did_seq_key(did: &str, local_seq: u64) -> Vec<u8> {
    let mut key = did_prefix(did);
    key.extend_from_slice(&local_seq.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8]) -> DbResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Serialization("invalid sequence bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Lift a storage error into a transaction abort.
fn aborting<T>(result: DbResult<T>) -> Result<T, ConflictableTransactionError<DbError>> {
    result.map_err(ConflictableTransactionError::Abort)
}

// ---------------------------------------------------------------------------
// QuireDb
// ---------------------------------------------------------------------------

/// Persistent storage engine for a Quire instance.
///
/// # Thread Safety
///
/// sled trees support lock-free concurrent reads and serializable
/// transactions. `QuireDb` is cheap to clone and can be shared freely.
#[derive(Debug, Clone)]
pub struct QuireDb {
    db: Db,
    records: Tree,
    blocks: Tree,
    commits: Tree,
    did_commits: Tree,
    metadata: Tree,
}

impl QuireDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in a temporary directory and disappears on
    /// drop. Ideal for tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            records: db.open_tree("records")?,
            blocks: db.open_tree("blocks")?,
            commits: db.open_tree("commits")?,
            did_commits: db.open_tree("did_commits")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    /// Open a named tree in the same database. Created if missing.
    pub fn open_tree(&self, name: &str) -> DbResult<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    // -- Records ------------------------------------------------------------

    /// The stored row for a record, live or tombstoned.
    pub fn get_record_entry(
        &self,
        did: &str,
        collection: &str,
        record_key: &str,
    ) -> DbResult<Option<RecordEntry>> {
        match self.records.get(record_row_key(did, collection, record_key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Live records of one collection, ordered by record key.
    ///
    /// `cursor` is exclusive in the direction of travel. Tombstoned rows are
    /// skipped and do not count towards `limit`.
    pub fn list_record_entries(
        &self,
        did: &str,
        collection: &str,
        cursor: Option<&str>,
        reverse: bool,
        limit: usize,
    ) -> DbResult<Vec<(String, RecordEntry)>> {
        let prefix = record_prefix(did, collection);
        // Prefix ends with the 0x00 separator; bumping it bounds the scan.
        let mut upper = prefix.clone();
        if let Some(last) = upper.last_mut() {
            *last = 1;
        }

        let (start, end) = match (cursor, reverse) {
            (Some(c), false) => (
                Bound::Excluded(record_row_key(did, collection, c)),
                Bound::Excluded(upper),
            ),
            (Some(c), true) => (
                Bound::Included(prefix.clone()),
                Bound::Excluded(record_row_key(did, collection, c)),
            ),
            (None, _) => (Bound::Included(prefix.clone()), Bound::Excluded(upper)),
        };

        let range = self.records.range::<Vec<u8>, _>((start, end));
        let rows: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> = if reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut out = Vec::new();
        for row in rows {
            if out.len() >= limit {
                break;
            }
            let (key, value) = row?;
            let entry: RecordEntry = decode(&value)?;
            if !entry.is_live() {
                continue;
            }
            let record_key = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            out.push((record_key, entry));
        }
        Ok(out)
    }

    /// Canonical bytes stored under `cid`.
    pub fn get_block(&self, cid: &Cid) -> DbResult<Option<Vec<u8>>> {
        Ok(self.blocks.get(cid.to_bytes())?.map(|b| b.to_vec()))
    }

    // -- Commit log ---------------------------------------------------------

    /// Highest local sequence for `did`, or 0 when it has no commits.
    pub fn latest_local_seq(&self, did: &str) -> DbResult<u64> {
        match self.did_commits.scan_prefix(did_prefix(did)).next_back() {
            Some(row) => {
                let (key, _) = row?;
                read_u64(&key[key.len() - 8..])
            }
            None => Ok(0),
        }
    }

    /// Last assigned global sequence, or 0 on an empty log.
    pub fn latest_global_seq(&self) -> DbResult<u64> {
        match self.metadata.get(META_GLOBAL_SEQ)? {
            Some(bytes) => read_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn get_commit(&self, global_seq: u64) -> DbResult<Option<Commit>> {
        match self.commits.get(global_seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` commits with `global_seq > after`, ascending.
    pub fn commits_after(&self, after: u64, limit: usize) -> DbResult<Vec<Commit>> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for row in self.commits.range(start.to_be_bytes()..).take(limit) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Every commit of `did` ordered by local sequence.
    pub fn commits_for_did(&self, did: &str) -> DbResult<Vec<Commit>> {
        let mut out = Vec::new();
        for row in self.did_commits.scan_prefix(did_prefix(did)) {
            let (_, global) = row?;
            let global_seq = read_u64(&global)?;
            let commit = self.get_commit(global_seq)?.ok_or_else(|| {
                DbError::Integrity(format!("commit {} indexed but missing", global_seq))
            })?;
            out.push(commit);
        }
        Ok(out)
    }

    /// Apply one record change and its commit atomically.
    ///
    /// Create vs update is decided inside the transaction from the current
    /// row, so a concurrent writer cannot make this commit lie about what it
    /// replaced.
    ///
    /// # Errors
    ///
    /// - [`DbError::SequenceTaken`] when `write.local_seq` is already used.
    /// - [`DbError::NotFound`] when deleting a record with no live row.
    pub fn apply_write(&self, write: &PendingWrite<'_>) -> DbResult<Commit> {
        let row_key = record_row_key(write.did, write.collection, write.record_key);
        let seq_key = did_seq_key(write.did, write.local_seq);
        let prev_seq_key = (write.local_seq > 1).then(|| did_seq_key(write.did, write.local_seq - 1));

        let outcome = (
            &self.records,
            &self.blocks,
            &self.commits,
            &self.did_commits,
            &self.metadata,
        )
            .transaction(|(records, blocks, commits, did_commits, metadata)| {
                if did_commits.get(seq_key.as_slice())?.is_some() {
                    return abort(DbError::SequenceTaken {
                        did: write.did.to_string(),
                        local_seq: write.local_seq,
                    });
                }

                let existing: Option<RecordEntry> = match records.get(row_key.as_slice())? {
                    Some(bytes) => Some(aborting(decode(&bytes))?),
                    None => None,
                };
                let live = existing.filter(RecordEntry::is_live);

                let (operation, new_cid, prev_cid, entry) = match write.change {
                    RecordChange::Upsert { cid, canonical } => {
                        blocks.insert(cid.to_bytes(), canonical.as_slice())?;
                        let (operation, prev_cid, created_at) = match &live {
                            Some(current) => (CommitOp::Update, Some(current.cid), current.created_at),
                            None => (CommitOp::Create, None, write.committed_at),
                        };
                        let entry = RecordEntry {
                            uri: write.uri.to_string(),
                            cid: *cid,
                            created_at,
                            updated_at: write.committed_at,
                            deleted_at: None,
                        };
                        (operation, *cid, prev_cid, entry)
                    }
                    RecordChange::Delete => {
                        let Some(current) = live else {
                            return abort(DbError::NotFound(write.uri.to_string()));
                        };
                        let tombstone = serde_json::json!({
                            "$tombstone": write.uri,
                            "prev": current.cid.to_string(),
                        });
                        let bytes = aborting(
                            canonical_bytes(&tombstone)
                                .map_err(|e| DbError::Serialization(e.to_string())),
                        )?;
                        let tombstone_cid = aborting(
                            cid_for_bytes(&bytes).map_err(|e| DbError::Serialization(e.to_string())),
                        )?;
                        blocks.insert(tombstone_cid.to_bytes(), bytes)?;
                        let entry = RecordEntry {
                            updated_at: write.committed_at,
                            deleted_at: Some(write.committed_at),
                            ..current.clone()
                        };
                        (CommitOp::Delete, tombstone_cid, Some(current.cid), entry)
                    }
                };

                let prev_commit_cid = match &prev_seq_key {
                    Some(key) => {
                        let Some(global) = did_commits.get(key.as_slice())? else {
                            return abort(DbError::Integrity(format!(
                                "{} has no commit at local seq {}",
                                write.did,
                                write.local_seq - 1
                            )));
                        };
                        let Some(bytes) = commits.get(&global)? else {
                            return abort(DbError::Integrity(format!(
                                "commit {:?} indexed but missing",
                                global
                            )));
                        };
                        let prev: Commit = aborting(decode(&bytes))?;
                        Some(prev.commit_cid)
                    }
                    None => None,
                };
                let commit_cid = aborting(
                    compute_commit_cid(&new_cid, prev_commit_cid.as_ref())
                        .map_err(|e| DbError::Serialization(e.to_string())),
                )?;

                let global_seq = match metadata.get(META_GLOBAL_SEQ)? {
                    Some(bytes) => aborting(read_u64(&bytes))? + 1,
                    None => 1,
                };
                let global_key = global_seq.to_be_bytes();

                let commit = Commit {
                    global_seq,
                    local_seq: write.local_seq,
                    did: write.did.to_string(),
                    record_uri: write.uri.to_string(),
                    new_cid,
                    operation,
                    prev_cid,
                    commit_cid,
                    committed_at: write.committed_at,
                };

                metadata.insert(META_GLOBAL_SEQ, &global_key[..])?;
                commits.insert(&global_key[..], aborting(encode(&commit))?)?;
                did_commits.insert(seq_key.as_slice(), &global_key[..])?;
                records.insert(row_key.as_slice(), aborting(encode(&entry))?)?;

                Ok(commit)
            });

        outcome.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => DbError::Sled(e),
        })
    }

    // -- Utility ------------------------------------------------------------

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::compute_cid;
    use serde_json::json;

    const DID: &str = "did:plc:aaaaaaaaaaaaaaaaaaaaaaaa";
    const COLLECTION: &str = "app.quire.note";

    fn upsert(value: serde_json::Value) -> RecordChange {
        let canonical = canonical_bytes(&value).unwrap();
        RecordChange::Upsert {
            cid: cid_for_bytes(&canonical).unwrap(),
            canonical,
        }
    }

    fn write(db: &QuireDb, rkey: &str, change: &RecordChange) -> DbResult<Commit> {
        let uri = format!("at://{}/{}/{}", DID, COLLECTION, rkey);
        let local_seq = db.latest_local_seq(DID)? + 1;
        db.apply_write(&PendingWrite {
            did: DID,
            collection: COLLECTION,
            record_key: rkey,
            uri: &uri,
            change,
            local_seq,
            committed_at: Utc::now(),
        })
    }

    #[test]
    fn open_temporary_database() {
        let db = QuireDb::open_temporary().expect("should create temp db");
        assert_eq!(db.commit_count(), 0);
        assert_eq!(db.latest_global_seq().unwrap(), 0);
        assert_eq!(db.latest_local_seq(DID).unwrap(), 0);
    }

    #[test]
    fn open_persistent_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = QuireDb::open(dir.path()).expect("should open db");
            write(&db, "a", &upsert(json!({"v": 1}))).unwrap();
            db.flush().unwrap();
        }
        let db = QuireDb::open(dir.path()).expect("should reopen db");
        assert_eq!(db.latest_global_seq().unwrap(), 1);
        assert!(db.get_record_entry(DID, COLLECTION, "a").unwrap().is_some());
    }

    #[test]
    fn first_write_is_create_then_update() {
        let db = QuireDb::open_temporary().unwrap();
        let first = write(&db, "a", &upsert(json!({"v": 1}))).unwrap();
        assert_eq!(first.operation, CommitOp::Create);
        assert_eq!(first.local_seq, 1);
        assert_eq!(first.prev_cid, None);

        let second = write(&db, "a", &upsert(json!({"v": 2}))).unwrap();
        assert_eq!(second.operation, CommitOp::Update);
        assert_eq!(second.local_seq, 2);
        assert_eq!(second.prev_cid, Some(first.new_cid));
        assert_eq!(
            second.commit_cid,
            compute_commit_cid(&second.new_cid, Some(&first.commit_cid)).unwrap()
        );
    }

    #[test]
    fn taken_sequence_aborts_without_side_effects() {
        let db = QuireDb::open_temporary().unwrap();
        write(&db, "a", &upsert(json!({"v": 1}))).unwrap();

        let change = upsert(json!({"v": 2}));
        let uri = format!("at://{}/{}/b", DID, COLLECTION);
        let err = db
            .apply_write(&PendingWrite {
                did: DID,
                collection: COLLECTION,
                record_key: "b",
                uri: &uri,
                change: &change,
                local_seq: 1,
                committed_at: Utc::now(),
            })
            .unwrap_err();

        assert!(matches!(err, DbError::SequenceTaken { local_seq: 1, .. }));
        assert!(db.get_record_entry(DID, COLLECTION, "b").unwrap().is_none());
        assert_eq!(db.latest_global_seq().unwrap(), 1);
    }

    #[test]
    fn delete_tombstones_and_keeps_row() {
        let db = QuireDb::open_temporary().unwrap();
        let created = write(&db, "a", &upsert(json!({"v": 1}))).unwrap();
        let deleted = write(&db, "a", &RecordChange::Delete).unwrap();

        assert_eq!(deleted.operation, CommitOp::Delete);
        assert_eq!(deleted.prev_cid, Some(created.new_cid));
        let tombstone = compute_cid(&json!({
            "$tombstone": created.record_uri,
            "prev": created.new_cid.to_string(),
        }))
        .unwrap();
        assert_eq!(deleted.new_cid, tombstone);

        let row = db.get_record_entry(DID, COLLECTION, "a").unwrap().unwrap();
        assert!(!row.is_live());
        assert_eq!(row.cid, created.new_cid);
    }

    #[test]
    fn delete_of_missing_record_is_not_found() {
        let db = QuireDb::open_temporary().unwrap();
        let err = write(&db, "ghost", &RecordChange::Delete).unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        assert_eq!(db.commit_count(), 0);
    }

    #[test]
    fn put_after_delete_is_create() {
        let db = QuireDb::open_temporary().unwrap();
        write(&db, "a", &upsert(json!({"v": 1}))).unwrap();
        write(&db, "a", &RecordChange::Delete).unwrap();
        let again = write(&db, "a", &upsert(json!({"v": 3}))).unwrap();
        assert_eq!(again.operation, CommitOp::Create);
        assert_eq!(again.prev_cid, None);
    }

    #[test]
    fn listing_skips_tombstones_and_honours_cursor() {
        let db = QuireDb::open_temporary().unwrap();
        for rkey in ["a", "b", "c", "d"] {
            write(&db, rkey, &upsert(json!({"k": rkey}))).unwrap();
        }
        write(&db, "b", &RecordChange::Delete).unwrap();

        let keys = |rows: Vec<(String, RecordEntry)>| -> Vec<String> {
            rows.into_iter().map(|(k, _)| k).collect()
        };

        let all = db.list_record_entries(DID, COLLECTION, None, false, 10).unwrap();
        assert_eq!(keys(all), vec!["a", "c", "d"]);

        let page = db.list_record_entries(DID, COLLECTION, Some("a"), false, 1).unwrap();
        assert_eq!(keys(page), vec!["c"]);

        let rev = db.list_record_entries(DID, COLLECTION, None, true, 10).unwrap();
        assert_eq!(keys(rev), vec!["d", "c", "a"]);

        let rev_page = db.list_record_entries(DID, COLLECTION, Some("d"), true, 10).unwrap();
        assert_eq!(keys(rev_page), vec!["c", "a"]);
    }

    #[test]
    fn listing_is_scoped_to_collection() {
        let db = QuireDb::open_temporary().unwrap();
        write(&db, "a", &upsert(json!({"k": 1}))).unwrap();
        let other = db
            .list_record_entries(DID, "app.quire.other", None, false, 10)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn commit_log_reads() {
        let db = QuireDb::open_temporary().unwrap();
        for i in 0..5 {
            write(&db, &format!("r{}", i), &upsert(json!({"i": i}))).unwrap();
        }

        assert_eq!(db.latest_global_seq().unwrap(), 5);
        assert_eq!(db.latest_local_seq(DID).unwrap(), 5);

        let after = db.commits_after(2, 10).unwrap();
        let seqs: Vec<u64> = after.iter().map(|c| c.global_seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        assert_eq!(db.commits_after(0, 2).unwrap().len(), 2);
        assert!(db.commits_after(u64::MAX, 10).unwrap().is_empty());

        let chain = db.commits_for_did(DID).unwrap();
        let locals: Vec<u64> = chain.iter().map(|c| c.local_seq).collect();
        assert_eq!(locals, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn blocks_hold_canonical_bytes() {
        let db = QuireDb::open_temporary().unwrap();
        let commit = write(&db, "a", &upsert(json!({"z": 1, "a": 2}))).unwrap();
        let bytes = db.get_block(&commit.new_cid).unwrap().unwrap();
        assert_eq!(bytes, br#"{"a":2,"z":1}"#);
    }
}
