// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! End-to-end tests for the Quire core.
//!
//! These drive the public API the way a hosting node does: a [`Pds`] on an
//! on-disk database, DIDs on the embedded ledger, records written through
//! the facade and read back through the firehose. Each test owns its own
//! temporary directory.

use std::time::Duration;

use axum::http::HeaderMap;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

use quire_protocol::addressing::compute_commit_cid;
use quire_protocol::config::{InstanceConfig, KeyEncryptionKey, LedgerEndpoint, SIGNING_KEY_PURPOSE};
use quire_protocol::crypto::keys::SigningKeypair;
use quire_protocol::httpsig::{self, SignableRequest, VerifyFailure};
use quire_protocol::identity::operation::{replay, OperationDraft};
use quire_protocol::identity::{IdentityLedger, LedgerError, OperationType};
use quire_protocol::pds::{DidDocumentUpdate, NewDid, Pds, PdsError};
use quire_protocol::repo::{
    CommitOp, CreateRecordInput, DeleteRecordInput, FirehoseEvent, PutRecordInput, RepoError,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const COLLECTION: &str = "app.test.note";

fn config(dir: &TempDir) -> InstanceConfig {
    InstanceConfig {
        ledger: LedgerEndpoint::Embedded,
        public_url: "https://a.quire.test".into(),
        key_encryption_key: KeyEncryptionKey::from_bytes([42u8; 32]),
        data_dir: dir.path().to_path_buf(),
    }
}

fn open(dir: &TempDir) -> Pds {
    Pds::open(config(dir)).expect("open pds")
}

async fn new_did(pds: &Pds, handle: &str) -> String {
    pds.create_did(NewDid {
        handle: handle.into(),
        service_url: None,
    })
    .await
    .expect("create did")
}

async fn put(pds: &Pds, did: &str, rkey: &str, value: i64) {
    pds.put_record(PutRecordInput {
        did: did.into(),
        collection: COLLECTION.into(),
        record_key: rkey.into(),
        record: json!({"value": value}),
    })
    .await
    .expect("put record");
}

async fn next_event(
    stream: &mut futures::stream::BoxStream<'static, Result<FirehoseEvent, RepoError>>,
) -> FirehoseEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("event within timeout")
        .expect("stream open")
        .expect("event ok")
}

// ---------------------------------------------------------------------------
// Records and commits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_put_delete_scenario() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = "did:example:abc";

    let created = pds
        .create_record(CreateRecordInput {
            did: did.into(),
            collection: COLLECTION.into(),
            record: json!({"$type": "x", "value": 1}),
        })
        .await
        .unwrap();
    assert!(created.uri.starts_with("at://did:example:abc/app.test.note/"));
    let record_key = created.uri.rsplit('/').next().unwrap().to_string();
    let c1 = created.cid;

    let updated = pds
        .put_record(PutRecordInput {
            did: did.into(),
            collection: COLLECTION.into(),
            record_key: record_key.clone(),
            record: json!({"value": 2}),
        })
        .await
        .unwrap();
    let c2 = updated.cid;
    assert_eq!(updated.uri, created.uri);
    assert_ne!(c1, c2);
    assert_eq!(updated.commit.operation, CommitOp::Update);
    assert_eq!(updated.commit.prev_cid, Some(c1));

    let deleted = pds
        .delete_record(DeleteRecordInput {
            did: did.into(),
            collection: COLLECTION.into(),
            record_key,
        })
        .await
        .unwrap();
    assert_eq!(deleted.operation, CommitOp::Delete);
    assert_eq!(deleted.prev_cid, Some(c2));

    assert!(matches!(
        pds.get_record(&created.uri).await,
        Err(PdsError::Repo(RepoError::NotFound(_)))
    ));

    let report = pds.repository().verify_chain(did).await.unwrap();
    assert!(report.is_valid(), "{:?}", report.fault);
    assert_eq!(report.length, 3);
}

#[tokio::test]
async fn commit_chain_replays_from_genesis() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = "did:example:chain";
    for i in 0..6 {
        put(&pds, did, &format!("k{}", i % 2), i).await;
    }

    let commits = pds.repository().commits_for(did).await.unwrap();
    let mut prev = None;
    for (i, commit) in commits.iter().enumerate() {
        assert_eq!(commit.local_seq, i as u64 + 1);
        let expected = compute_commit_cid(&commit.new_cid, prev.as_ref()).unwrap();
        assert_eq!(commit.commit_cid, expected);
        prev = Some(commit.commit_cid);
    }
}

#[tokio::test]
async fn sequences_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let did = "did:example:durable";
    {
        let pds = open(&dir);
        put(&pds, did, "a", 1).await;
        put(&pds, did, "b", 2).await;
        pds.repository().db().flush().unwrap();
    }

    let pds = open(&dir);
    put(&pds, did, "c", 3).await;
    let commits = pds.repository().commits_for(did).await.unwrap();
    let locals: Vec<u64> = commits.iter().map(|c| c.local_seq).collect();
    assert_eq!(locals, vec![1, 2, 3]);
    assert_eq!(commits[2].global_seq, 3);
}

#[tokio::test]
async fn delete_of_missing_record_is_not_found() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let result = pds
        .delete_record(DeleteRecordInput {
            did: "did:example:abc".into(),
            collection: COLLECTION.into(),
            record_key: "ghost".into(),
        })
        .await;
    assert!(matches!(result, Err(PdsError::Repo(RepoError::NotFound(_)))));
}

// ---------------------------------------------------------------------------
// Firehose
// ---------------------------------------------------------------------------

#[tokio::test]
async fn firehose_replays_then_goes_live() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = "did:example:fire";
    const M: u64 = 7;
    for i in 0..M {
        put(&pds, did, &format!("r{}", i), i as i64).await;
    }

    let mut all = pds.subscribe_repos(Some(0));
    for expected in 1..=M {
        assert_eq!(next_event(&mut all).await.seq, expected);
    }

    let mut tail = pds.subscribe_repos(Some(M - 1));
    assert_eq!(next_event(&mut tail).await.seq, M);

    put(&pds, did, "late", 100).await;
    let live = next_event(&mut tail).await;
    assert_eq!(live.seq, M + 1);
    assert_eq!(live.record, Some(json!({"value": 100})));
    assert_eq!(next_event(&mut all).await.seq, M + 1);

    let idle = tokio::time::timeout(Duration::from_millis(100), tail.next()).await;
    assert!(idle.is_err(), "no duplicate after the handoff");
}

#[tokio::test]
async fn firehose_orders_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let pds = std::sync::Arc::new(open(&dir));
    let mut stream = pds.subscribe_repos(Some(0));

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let pds = pds.clone();
            tokio::spawn(async move {
                for i in 0..4 {
                    put(&pds, &format!("did:example:w{}", w), &format!("k{}", i), i).await;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let mut seqs = Vec::new();
    for _ in 0..12 {
        seqs.push(next_event(&mut stream).await.seq);
    }
    assert_eq!(seqs, (1..=12).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forged_update_is_rejected_without_mutation() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = new_did(&pds, "alice.quire.test").await;
    let ledger = pds.ledger().shared();
    let before = ledger.operation_log(&did).await.unwrap();

    let state = replay(&did, &before).unwrap();
    let thief = SigningKeypair::generate();
    let forged = OperationDraft {
        op_type: OperationType::Update,
        signing_key: thief.public_key(),
        handle: "mallory.quire.test".into(),
        service: "https://evil.test".into(),
        prev: Some(state.head),
    }
    .sign(&thief)
    .unwrap();

    let result = ledger.submit(&did, &forged).await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
    assert_eq!(ledger.operation_log(&did).await.unwrap(), before);
    assert_eq!(
        pds.resolve_did(&did).await.unwrap().handle(),
        Some("alice.quire.test")
    );
}

#[tokio::test]
async fn rotation_keeps_history_and_old_signatures_stop_verifying() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = new_did(&pds, "alice.quire.test").await;

    let headers = HeaderMap::new();
    let request = SignableRequest {
        method: "GET",
        target_uri: "https://b.quire.test/xrpc/app.quire.ping",
        headers: &headers,
        body: None,
    };
    let old_signature = pds.sign_request(&did, &request).unwrap();

    pds.update_did_document(
        &did,
        DidDocumentUpdate {
            rotate_signing_key: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let history = pds.keys().history(&did).unwrap();
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_active());
    assert!(history[0].public_key().is_ok());
    assert!(history[1].is_active());

    let mut stale = HeaderMap::new();
    old_signature.apply(&mut stale).unwrap();
    let verification = pds
        .verify_request(&SignableRequest {
            headers: &stale,
            ..request
        })
        .await
        .unwrap();
    assert_eq!(verification.failure, Some(VerifyFailure::BadSignature));

    let fresh = pds.sign_request(&did, &request).unwrap();
    let mut current = HeaderMap::new();
    fresh.apply(&mut current).unwrap();
    let verification = pds
        .verify_request(&SignableRequest {
            headers: &current,
            ..request
        })
        .await
        .unwrap();
    assert!(verification.verified);
}

#[tokio::test]
async fn keys_are_sealed_under_the_instance_key() {
    let dir = TempDir::new().unwrap();
    let did = {
        let pds = open(&dir);
        let did = new_did(&pds, "alice.quire.test").await;
        pds.repository().db().flush().unwrap();
        did
    };

    let mut wrong = config(&dir);
    wrong.key_encryption_key = KeyEncryptionKey::from_bytes([1u8; 32]);
    let pds = Pds::open(wrong).unwrap();
    let stored = pds.keys().active(&did, SIGNING_KEY_PURPOSE).unwrap().unwrap();
    assert!(matches!(
        pds.keys().unwrap_signing_key(&stored),
        Err(LedgerError::Encryption(_))
    ));
}

// ---------------------------------------------------------------------------
// HTTP signatures between instances
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signed_body_round_trip_and_tamper() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = new_did(&pds, "alice.quire.test").await;

    let body = serde_json::to_vec(&json!({"op": "follow"})).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    let uri = "https://b.quire.test/xrpc/app.quire.follow";
    let signature = pds
        .sign_request(
            &did,
            &SignableRequest {
                method: "POST",
                target_uri: uri,
                headers: &headers,
                body: Some(&body),
            },
        )
        .unwrap();
    signature.apply(&mut headers).unwrap();

    let ok = pds
        .verify_request(&SignableRequest {
            method: "POST",
            target_uri: uri,
            headers: &headers,
            body: Some(&body),
        })
        .await
        .unwrap();
    assert!(ok.verified);
    assert_eq!(ok.signer_did.as_deref(), Some(did.as_str()));

    let tampered = serde_json::to_vec(&json!({"op": "block"})).unwrap();
    let bad = pds
        .verify_request(&SignableRequest {
            method: "POST",
            target_uri: uri,
            headers: &headers,
            body: Some(&tampered),
        })
        .await
        .unwrap();
    assert!(!bad.verified);
    assert_eq!(bad.failure, Some(VerifyFailure::DigestMismatch));
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let dir = TempDir::new().unwrap();
    let pds = open(&dir);
    let did = new_did(&pds, "alice.quire.test").await;

    let key = pds.keys().active(&did, SIGNING_KEY_PURPOSE).unwrap().unwrap();
    let signer = pds.keys().unwrap_signing_key(&key).unwrap();
    let created = chrono::Utc::now().timestamp() - 301;

    let unsigned = HeaderMap::new();
    let mut headers = HeaderMap::new();
    let request = SignableRequest {
        method: "GET",
        target_uri: "https://b.quire.test/",
        headers: &unsigned,
        body: None,
    };
    httpsig::sign_at(&request, &signer, &format!("{}#atproto", did), created)
        .unwrap()
        .apply(&mut headers)
        .unwrap();

    let verification = pds
        .verify_request(&SignableRequest {
            headers: &headers,
            ..request
        })
        .await
        .unwrap();
    assert!(matches!(verification.failure, Some(VerifyFailure::Stale { .. })));
}
