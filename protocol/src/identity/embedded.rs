// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Embedded Ledger
//!
//! Keeps operation chains in the `ledger_ops` tree of the instance
//! database, keyed `did \0 index` (index as 8-byte big-endian). A new
//! operation is validated against the replayed chain and written with
//! compare-and-swap on the next free index, so two concurrent updates
//! cannot both extend the same head.
//!
//! A genesis operation is written in one transaction with the DID counter
//! in `ledger_meta`, which `/health` reads without scanning chains.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Tree;
use tracing::{debug, warn};

use crate::identity::ledger::{IdentityLedger, LedgerError};
use crate::identity::operation::{genesis_state, replay, OperationError, SignedOperation};
use crate::storage::{DbError, QuireDb};

const LEDGER_TREE: &str = "ledger_ops";
const LEDGER_META_TREE: &str = "ledger_meta";
const META_DID_COUNT: &[u8] = b"did_count";

fn decode_count(bytes: Option<sled::IVec>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b.as_ref()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn op_prefix(did: &str) -> Vec<u8> {
    let mut key = did.as_bytes().to_vec();
    key.push(0);
    key
}

fn op_key(did: &str, index: u64) -> Vec<u8> {
    let mut key = op_prefix(did);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// A ledger hosted inside this instance's sled database.
#[derive(Debug, Clone)]
pub struct EmbeddedLedger {
    ops: Tree,
    meta: Tree,
}

impl EmbeddedLedger {
    pub fn open(db: &QuireDb) -> Result<Self, LedgerError> {
        Ok(Self {
            ops: db.open_tree(LEDGER_TREE)?,
            meta: db.open_tree(LEDGER_META_TREE)?,
        })
    }

    fn load(&self, did: &str) -> Result<Vec<SignedOperation>, LedgerError> {
        let mut ops = Vec::new();
        for row in self.ops.scan_prefix(op_prefix(did)) {
            let (_, value) = row?;
            let op: SignedOperation = bincode::deserialize(&value)
                .map_err(|e| LedgerError::Storage(DbError::Serialization(e.to_string())))?;
            ops.push(op);
        }
        Ok(ops)
    }

    /// Number of DIDs with at least a genesis operation.
    pub fn did_count(&self) -> Result<u64, LedgerError> {
        Ok(decode_count(self.meta.get(META_DID_COUNT)?))
    }

    /// Write a genesis operation and count the new DID together.
    fn append_genesis(&self, did: &str, bytes: Vec<u8>) -> Result<bool, LedgerError> {
        let key = op_key(did, 0);
        let outcome = (&self.ops, &self.meta).transaction(|(ops, meta)| {
            if ops.get(&key)?.is_some() {
                return Ok(false);
            }
            ops.insert(key.as_slice(), bytes.as_slice())?;
            let count = decode_count(meta.get(META_DID_COUNT)?) + 1;
            meta.insert(META_DID_COUNT, &count.to_be_bytes()[..])?;
            Ok::<_, ConflictableTransactionError<LedgerError>>(true)
        });
        outcome.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => LedgerError::from(e),
        })
    }

    fn append(&self, did: &str, index: u64, bytes: Vec<u8>) -> Result<bool, LedgerError> {
        if index == 0 {
            return self.append_genesis(did, bytes);
        }
        Ok(self
            .ops
            .compare_and_swap(op_key(did, index), None::<&[u8]>, Some(bytes))?
            .is_ok())
    }
}

#[async_trait]
impl IdentityLedger for EmbeddedLedger {
    async fn operation_log(&self, did: &str) -> Result<Vec<SignedOperation>, LedgerError> {
        self.load(did)
    }

    async fn submit(&self, did: &str, op: &SignedOperation) -> Result<(), LedgerError> {
        let existing = self.load(did)?;

        if existing.is_empty() {
            let state = genesis_state(op)?;
            if state.did != did {
                return Err(OperationError::DidMismatch {
                    expected: did.to_string(),
                    derived: state.did,
                }
                .into());
            }
        } else {
            replay(did, &existing)?.apply(op)?;
        }

        let index = existing.len() as u64;
        let bytes = bincode::serialize(op)
            .map_err(|e| LedgerError::Storage(DbError::Serialization(e.to_string())))?;

        if self.append(did, index, bytes)? {
            debug!(did = %did, index, "ledger operation appended");
            Ok(())
        } else {
            warn!(did = %did, index, "ledger operation lost a race for its slot");
            Err(LedgerError::Validation(format!(
                "operation {} of {} was written concurrently",
                index, did
            )))
        }
    }

    fn kind(&self) -> &'static str {
        "embedded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;
    use crate::identity::operation::{derive_did, OperationDraft, OperationType};

    fn genesis(kp: &SigningKeypair) -> SignedOperation {
        OperationDraft {
            op_type: OperationType::Create,
            signing_key: kp.public_key(),
            handle: "carol.quire.test".into(),
            service: "https://pds.quire.test".into(),
            prev: None,
        }
        .sign(kp)
        .unwrap()
    }

    fn update(prev: &SignedOperation, signer: &SigningKeypair, handle: &str) -> SignedOperation {
        OperationDraft {
            op_type: OperationType::Update,
            signing_key: signer.public_key(),
            handle: handle.into(),
            service: prev.service.clone(),
            prev: Some(prev.cid().unwrap()),
        }
        .sign(signer)
        .unwrap()
    }

    #[tokio::test]
    async fn submit_genesis_and_update() {
        let db = QuireDb::open_temporary().unwrap();
        let ledger = EmbeddedLedger::open(&db).unwrap();
        let kp = SigningKeypair::generate();
        let g = genesis(&kp);
        let did = derive_did(&g).unwrap();

        ledger.submit(&did, &g).await.unwrap();
        ledger.submit(&did, &update(&g, &kp, "c2.quire.test")).await.unwrap();

        assert_eq!(ledger.operation_log(&did).await.unwrap().len(), 2);
        assert_eq!(ledger.did_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn did_count_tracks_genesis_only() {
        let db = QuireDb::open_temporary().unwrap();
        let ledger = EmbeddedLedger::open(&db).unwrap();
        let kp = SigningKeypair::generate();
        let g = genesis(&kp);
        let did = derive_did(&g).unwrap();

        ledger.submit(&did, &g).await.unwrap();
        assert!(ledger.submit(&did, &g).await.is_err());
        ledger.submit(&did, &update(&g, &kp, "c3.quire.test")).await.unwrap();
        assert_eq!(ledger.did_count().unwrap(), 1);

        let other = genesis(&SigningKeypair::generate());
        ledger.submit(&derive_did(&other).unwrap(), &other).await.unwrap();
        assert_eq!(ledger.did_count().unwrap(), 2);

        // The counter lives in storage, not in this handle.
        assert_eq!(EmbeddedLedger::open(&db).unwrap().did_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn genesis_under_wrong_did_rejected() {
        let db = QuireDb::open_temporary().unwrap();
        let ledger = EmbeddedLedger::open(&db).unwrap();
        let g = genesis(&SigningKeypair::generate());
        let result = ledger.submit("did:plc:aaaaaaaaaaaaaaaaaaaaaaaa", &g).await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
        assert_eq!(ledger.did_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn second_update_on_same_head_rejected() {
        let db = QuireDb::open_temporary().unwrap();
        let ledger = EmbeddedLedger::open(&db).unwrap();
        let kp = SigningKeypair::generate();
        let g = genesis(&kp);
        let did = derive_did(&g).unwrap();
        ledger.submit(&did, &g).await.unwrap();

        let a = update(&g, &kp, "a.quire.test");
        let b = update(&g, &kp, "b.quire.test");
        ledger.submit(&did, &a).await.unwrap();
        assert!(matches!(
            ledger.submit(&did, &b).await,
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(ledger.operation_log(&did).await.unwrap(), vec![g, a]);
    }

    #[tokio::test]
    async fn corrupted_chain_fails_closed() {
        let db = QuireDb::open_temporary().unwrap();
        let ledger = EmbeddedLedger::open(&db).unwrap();
        let kp = SigningKeypair::generate();
        let g = genesis(&kp);
        let did = derive_did(&g).unwrap();
        ledger.submit(&did, &g).await.unwrap();

        // Write an unauthenticated operation straight into the tree.
        let rogue = SigningKeypair::generate();
        let forged = update(&g, &rogue, "mallory.quire.test");
        ledger
            .ops
            .insert(op_key(&did, 1), bincode::serialize(&forged).unwrap())
            .unwrap();

        assert!(matches!(
            ledger.resolve(&did).await,
            Err(LedgerError::Validation(_))
        ));
    }
}
