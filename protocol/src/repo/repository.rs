// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Repository Store
//!
//! Record CRUD on top of [`QuireDb`]. Every mutation produces exactly one
//! commit, written in the same transaction as the record change.
//!
//! ## Sequence assignment
//!
//! ```text
//! loop (at most SEQUENCE_RETRY_BUDGET times):
//!     next = latest_local_seq(did) + 1
//!     apply_write(next)            -- claims (did, next) or aborts
//!     on SequenceTaken: sleep(jitter), retry
//! then: broadcast the commit to firehose subscribers
//! ```
//!
//! No lock is held between computing `next` and claiming it. Two writers
//! racing for the same slot are serialized by the storage transaction, and
//! the loser recomputes. Running out of attempts is reported as
//! [`RepoError::SequenceExhausted`], never as success.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::addressing::{canonical_bytes, cid_for_bytes, cid_string, Cid, CidError};
use crate::config::{
    DEFAULT_LIST_LIMIT, FIREHOSE_CHANNEL_CAPACITY, MAX_LIST_LIMIT, SEQUENCE_RETRY_BACKOFF_MS,
    SEQUENCE_RETRY_BUDGET,
};
use crate::repo::commit::{verify_commit_chain, ChainReport, Commit};
use crate::repo::firehose::{self, FirehoseEvent};
use crate::repo::tid::TidClock;
use crate::repo::uri::{validate_collection, validate_record_key, validate_repo_did, AtUri, UriError};
use crate::storage::{DbError, PendingWrite, QuireDb, RecordChange};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    /// Every attempt to claim the next local sequence lost a race.
    #[error("could not assign a sequence number for {did} after {attempts} attempts")]
    SequenceExhausted { did: String, attempts: usize },

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

impl From<UriError> for RepoError {
    fn from(e: UriError) -> Self {
        RepoError::Validation(e.to_string())
    }
}

impl From<CidError> for RepoError {
    fn from(e: CidError) -> Self {
        RepoError::Validation(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateRecordInput {
    pub did: String,
    pub collection: String,
    pub record: Value,
}

#[derive(Debug, Clone)]
pub struct PutRecordInput {
    pub did: String,
    pub collection: String,
    pub record_key: String,
    pub record: Value,
}

#[derive(Debug, Clone)]
pub struct DeleteRecordInput {
    pub did: String,
    pub collection: String,
    pub record_key: String,
}

/// Result of a successful create or put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub uri: String,
    #[serde(with = "cid_string")]
    pub cid: Cid,
    #[serde(skip)]
    pub commit: Commit,
}

/// A live record as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub uri: String,
    #[serde(with = "cid_string")]
    pub cid: Cid,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Defaults to 50, capped at 100.
    pub limit: Option<usize>,
    pub reverse: bool,
    /// Exclusive record key to continue after.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<RecordView>,
    /// Pass back as `cursor` for the next page. `None` on the last page.
    pub cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Owns record, block and commit persistence, and the commit broadcast.
pub struct Repository {
    db: QuireDb,
    events: broadcast::Sender<Commit>,
    tids: TidClock,
}

impl Repository {
    pub fn new(db: QuireDb) -> Self {
        let (events, _) = broadcast::channel(FIREHOSE_CHANNEL_CAPACITY);
        Self {
            db,
            events,
            tids: TidClock::new(),
        }
    }

    pub fn db(&self) -> &QuireDb {
        &self.db
    }

    /// Create a record under a fresh TID record key.
    pub async fn create_record(&self, input: CreateRecordInput) -> Result<WriteResult, RepoError> {
        let uri = AtUri::new(&input.did, &input.collection, &self.tids.next())?;
        self.upsert(uri, &input.record).await
    }

    /// Create or replace the record at an explicit key.
    pub async fn put_record(&self, input: PutRecordInput) -> Result<WriteResult, RepoError> {
        let uri = AtUri::new(&input.did, &input.collection, &input.record_key)?;
        self.upsert(uri, &input.record).await
    }

    /// Tombstone a live record.
    pub async fn delete_record(&self, input: DeleteRecordInput) -> Result<Commit, RepoError> {
        let uri = AtUri::new(&input.did, &input.collection, &input.record_key)?;
        self.commit_change(&uri, RecordChange::Delete).await
    }

    /// The live record at `uri`. Absent and deleted records are `NotFound`.
    pub async fn get_record(&self, uri: &str) -> Result<RecordView, RepoError> {
        let uri = AtUri::parse(uri)?;
        let entry = self
            .db
            .get_record_entry(&uri.did, &uri.collection, &uri.record_key)?
            .filter(|entry| entry.is_live())
            .ok_or_else(|| RepoError::NotFound(uri.to_string()))?;
        let value = self.load_value(&entry.cid)?;
        Ok(RecordView {
            uri: entry.uri,
            cid: entry.cid,
            value,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /// One page of live records in a collection, ordered by record key.
    pub async fn list_records(
        &self,
        did: &str,
        collection: &str,
        options: ListOptions,
    ) -> Result<RecordPage, RepoError> {
        validate_repo_did(did)?;
        validate_collection(collection)?;
        if let Some(cursor) = &options.cursor {
            validate_record_key(cursor)?;
        }
        let limit = options
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let rows = self.db.list_record_entries(
            did,
            collection,
            options.cursor.as_deref(),
            options.reverse,
            limit,
        )?;

        let cursor = (rows.len() == limit)
            .then(|| rows.last().map(|(key, _)| key.clone()))
            .flatten();
        let mut records = Vec::with_capacity(rows.len());
        for (_, entry) in rows {
            let value = self.load_value(&entry.cid)?;
            records.push(RecordView {
                uri: entry.uri,
                cid: entry.cid,
                value,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            });
        }
        Ok(RecordPage { records, cursor })
    }

    /// The commit chain of `did`, ordered by local sequence.
    pub async fn commits_for(&self, did: &str) -> Result<Vec<Commit>, RepoError> {
        validate_repo_did(did)?;
        Ok(self.db.commits_for_did(did)?)
    }

    /// Recompute every commit CID of `did` from genesis.
    pub async fn verify_chain(&self, did: &str) -> Result<ChainReport, RepoError> {
        let commits = self.commits_for(did).await?;
        Ok(verify_commit_chain(did, &commits)?)
    }

    /// Events with `seq > cursor`, then live events. With no cursor, only
    /// events committed after the call.
    pub fn subscribe(&self, cursor: Option<u64>) -> BoxStream<'static, Result<FirehoseEvent, RepoError>> {
        firehose::subscribe(self.db.clone(), self.events.subscribe(), cursor)
    }

    /// Number of live firehose subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    // -- internals ----------------------------------------------------------

    fn load_value(&self, cid: &Cid) -> Result<Value, RepoError> {
        let bytes = self
            .db
            .get_block(cid)?
            .ok_or_else(|| DbError::Integrity(format!("block {} missing", cid)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RepoError::Storage(DbError::Serialization(e.to_string())))
    }

    async fn upsert(&self, uri: AtUri, record: &Value) -> Result<WriteResult, RepoError> {
        if !record.is_object() {
            return Err(RepoError::Validation("record must be a JSON object".into()));
        }
        let canonical = canonical_bytes(record)?;
        let cid = cid_for_bytes(&canonical)?;

        let commit = self
            .commit_change(&uri, RecordChange::Upsert { cid, canonical })
            .await?;
        Ok(WriteResult {
            uri: uri.to_string(),
            cid,
            commit,
        })
    }

    async fn commit_change(&self, uri: &AtUri, change: RecordChange) -> Result<Commit, RepoError> {
        let uri_string = uri.to_string();

        for attempt in 1..=SEQUENCE_RETRY_BUDGET {
            let local_seq = self.db.latest_local_seq(&uri.did)? + 1;
            let write = PendingWrite {
                did: &uri.did,
                collection: &uri.collection,
                record_key: &uri.record_key,
                uri: &uri_string,
                change: &change,
                local_seq,
                committed_at: Utc::now(),
            };

            match self.db.apply_write(&write) {
                Ok(commit) => {
                    // Nobody listening is fine; the log is the source of truth.
                    let _ = self.events.send(commit.clone());
                    info!(
                        did = %commit.did,
                        seq = commit.global_seq,
                        local_seq = commit.local_seq,
                        operation = %commit.operation,
                        "commit written"
                    );
                    return Ok(commit);
                }
                Err(DbError::SequenceTaken { .. }) => {
                    debug!(did = %uri.did, local_seq, attempt, "local sequence taken");
                    if attempt < SEQUENCE_RETRY_BUDGET {
                        let ceiling = SEQUENCE_RETRY_BACKOFF_MS * attempt as u64;
                        let jitter = rand::thread_rng().gen_range(1..=ceiling);
                        tokio::time::sleep(Duration::from_millis(jitter)).await;
                    }
                }
                Err(DbError::NotFound(what)) => return Err(RepoError::NotFound(what)),
                Err(e) => return Err(e.into()),
            }
        }

        warn!(did = %uri.did, attempts = SEQUENCE_RETRY_BUDGET, "sequence retry budget exhausted");
        Err(RepoError::SequenceExhausted {
            did: uri.did.clone(),
            attempts: SEQUENCE_RETRY_BUDGET,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::compute_cid;
    use crate::repo::commit::CommitOp;
    use crate::repo::tid::is_valid_tid;
    use serde_json::json;
    use std::sync::Arc;

    const DID: &str = "did:plc:aaaaaaaaaaaaaaaaaaaaaaaa";
    const COLLECTION: &str = "app.quire.note";

    fn repo() -> Repository {
        Repository::new(QuireDb::open_temporary().unwrap())
    }

    fn put(did: &str, rkey: &str, record: Value) -> PutRecordInput {
        PutRecordInput {
            did: did.into(),
            collection: COLLECTION.into(),
            record_key: rkey.into(),
            record,
        }
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let repo = repo();
        let record = json!({"$type": COLLECTION, "text": "hello", "n": 1});
        let written = repo
            .create_record(CreateRecordInput {
                did: DID.into(),
                collection: COLLECTION.into(),
                record: record.clone(),
            })
            .await
            .unwrap();

        let uri = AtUri::parse(&written.uri).unwrap();
        assert!(is_valid_tid(&uri.record_key));
        assert_eq!(written.cid, compute_cid(&record).unwrap());
        assert_eq!(written.commit.operation, CommitOp::Create);

        let view = repo.get_record(&written.uri).await.unwrap();
        assert_eq!(view.value, record);
        assert_eq!(view.cid, written.cid);
    }

    #[tokio::test]
    async fn put_replaces_and_links_prev() {
        let repo = repo();
        let first = repo.put_record(put(DID, "self", json!({"v": 1}))).await.unwrap();
        let second = repo.put_record(put(DID, "self", json!({"v": 2}))).await.unwrap();

        assert_eq!(second.commit.operation, CommitOp::Update);
        assert_eq!(second.commit.prev_cid, Some(first.cid));
        assert_ne!(first.cid, second.cid);
        let view = repo.get_record(&second.uri).await.unwrap();
        assert_eq!(view.value, json!({"v": 2}));
        assert_eq!(view.created_at, first.commit.committed_at);
    }

    #[tokio::test]
    async fn non_object_and_float_records_rejected() {
        let repo = repo();
        assert!(matches!(
            repo.put_record(put(DID, "a", json!([1, 2]))).await,
            Err(RepoError::Validation(_))
        ));
        assert!(matches!(
            repo.put_record(put(DID, "a", json!({"x": 1.5}))).await,
            Err(RepoError::Validation(_))
        ));
        assert!(repo.commits_for(DID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_hides_record_and_second_delete_fails() {
        let repo = repo();
        let written = repo.put_record(put(DID, "gone", json!({"v": 1}))).await.unwrap();
        let input = DeleteRecordInput {
            did: DID.into(),
            collection: COLLECTION.into(),
            record_key: "gone".into(),
        };

        let commit = repo.delete_record(input.clone()).await.unwrap();
        assert_eq!(commit.operation, CommitOp::Delete);
        assert_eq!(commit.prev_cid, Some(written.cid));
        assert!(matches!(
            repo.get_record(&written.uri).await,
            Err(RepoError::NotFound(_))
        ));
        assert!(matches!(
            repo.delete_record(input).await,
            Err(RepoError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_uri_is_validation_error() {
        let repo = repo();
        assert!(matches!(
            repo.get_record("at://nope").await,
            Err(RepoError::Validation(_))
        ));
        assert!(matches!(
            repo.put_record(put(DID, "..", json!({}))).await,
            Err(RepoError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn list_pages_through_collection() {
        let repo = repo();
        for i in 0..5 {
            repo.put_record(put(DID, &format!("k{}", i), json!({"i": i})))
                .await
                .unwrap();
        }

        let first = repo
            .list_records(DID, COLLECTION, ListOptions { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.cursor.as_deref(), Some("k1"));

        let rest = repo
            .list_records(
                DID,
                COLLECTION,
                ListOptions {
                    limit: Some(10),
                    cursor: first.cursor,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let values: Vec<i64> = rest.records.iter().map(|r| r.value["i"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![2, 3, 4]);
        assert!(rest.cursor.is_none());

        let reversed = repo
            .list_records(DID, COLLECTION, ListOptions { reverse: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(reversed.records[0].value["i"], 4);
    }

    #[tokio::test]
    async fn list_limit_is_capped() {
        let repo = repo();
        for i in 0..(MAX_LIST_LIMIT + 5) {
            repo.put_record(put(DID, &format!("r{:04}", i), json!({"i": i})))
                .await
                .unwrap();
        }
        let page = repo
            .list_records(DID, COLLECTION, ListOptions { limit: Some(1000), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.records.len(), MAX_LIST_LIMIT);

        let default = repo
            .list_records(DID, COLLECTION, ListOptions::default())
            .await
            .unwrap();
        assert_eq!(default.records.len(), DEFAULT_LIST_LIMIT);
    }

    #[tokio::test]
    async fn chain_verifies_after_mixed_writes() {
        let repo = repo();
        repo.put_record(put(DID, "a", json!({"v": 1}))).await.unwrap();
        repo.put_record(put(DID, "a", json!({"v": 2}))).await.unwrap();
        repo.put_record(put(DID, "b", json!({"v": 3}))).await.unwrap();
        repo.delete_record(DeleteRecordInput {
            did: DID.into(),
            collection: COLLECTION.into(),
            record_key: "a".into(),
        })
        .await
        .unwrap();

        let report = repo.verify_chain(DID).await.unwrap();
        assert!(report.is_valid(), "{:?}", report.fault);
        assert_eq!(report.length, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_get_dense_local_sequences() {
        const K: usize = 12;
        let repo = Arc::new(repo());

        let tasks: Vec<_> = (0..K)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.put_record(put(DID, &format!("c{}", i), json!({"i": i})))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seqs: Vec<u64> = repo
            .commits_for(DID)
            .await
            .unwrap()
            .iter()
            .map(|c| c.local_seq)
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=K as u64).collect::<Vec<_>>());
        assert!(repo.verify_chain(DID).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn dids_have_independent_local_sequences() {
        let repo = repo();
        let other = "did:plc:bbbbbbbbbbbbbbbbbbbbbbbb";
        let a = repo.put_record(put(DID, "x", json!({}))).await.unwrap();
        let b = repo.put_record(put(other, "x", json!({}))).await.unwrap();
        assert_eq!(a.commit.local_seq, 1);
        assert_eq!(b.commit.local_seq, 1);
        assert_eq!(b.commit.global_seq, a.commit.global_seq + 1);
    }
}
