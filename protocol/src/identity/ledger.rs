// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Identity Ledger
//!
//! The ledger is the source of truth for DID documents. Two backends share
//! one async trait:
//!
//! - [`EmbeddedLedger`]: operations in a sled tree of the local database.
//! - [`RemoteLedger`]: operations fetched from and submitted to an HTTP
//!   ledger service.
//!
//! A backend only moves signed operations around (`operation_log` and
//! `submit`). Building, signing and replaying operations happens once, in
//! the provided trait methods, so both backends fail closed the same way.
//! The backend is chosen from configuration by [`ledger_from_config`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::LedgerEndpoint;
use crate::crypto::encryption::EncryptionError;
use crate::crypto::keys::{KeyError, P256PublicKey, SigningKeypair};
use crate::identity::did::{validate_did, DidDocument, DidError};
use crate::identity::embedded::EmbeddedLedger;
use crate::identity::operation::{
    derive_did, replay, OperationDraft, OperationError, OperationType, SignedOperation,
};
use crate::identity::remote::RemoteLedger;
use crate::storage::{DbError, QuireDb};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("DID not found: {0}")]
    NotFound(String),

    /// The chain or a submitted operation failed verification.
    #[error("ledger validation failed: {0}")]
    Validation(String),

    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger storage error: {0}")]
    Storage(#[from] DbError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("key encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

impl From<OperationError> for LedgerError {
    fn from(e: OperationError) -> Self {
        LedgerError::Validation(e.to_string())
    }
}

impl From<DidError> for LedgerError {
    fn from(e: DidError) -> Self {
        LedgerError::Validation(e.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        LedgerError::Storage(DbError::Sled(e))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Inputs for a new DID.
pub struct CreateDidOptions<'a> {
    /// Signs the genesis operation and becomes the DID's `#atproto` key.
    pub signing_key: &'a SigningKeypair,
    pub handle: String,
    pub service_url: String,
}

/// Fields to replace in a DID document. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct DidChanges {
    pub handle: Option<String>,
    pub service_endpoint: Option<String>,
    pub signing_key: Option<P256PublicKey>,
}

impl DidChanges {
    pub fn is_empty(&self) -> bool {
        self.handle.is_none() && self.service_endpoint.is_none() && self.signing_key.is_none()
    }
}

fn check_handle(handle: &str) -> Result<(), LedgerError> {
    let ok = !handle.is_empty()
        && handle.contains('.')
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(LedgerError::Validation(format!("invalid handle '{}'", handle)))
    }
}

/// Sign the genesis operation for a new DID and derive the DID from it,
/// without touching any ledger.
pub fn genesis_operation(
    options: CreateDidOptions<'_>,
) -> Result<(String, SignedOperation), LedgerError> {
    check_handle(&options.handle)?;
    let genesis = OperationDraft {
        op_type: OperationType::Create,
        signing_key: options.signing_key.public_key(),
        handle: options.handle,
        service: options.service_url,
        prev: None,
    }
    .sign(options.signing_key)?;
    let did = derive_did(&genesis)?;
    Ok((did, genesis))
}

// ---------------------------------------------------------------------------
// IdentityLedger
// ---------------------------------------------------------------------------

/// A store of DID operation chains.
#[async_trait]
pub trait IdentityLedger: Send + Sync {
    /// The raw signed chain of `did`, genesis first.
    async fn operation_log(&self, did: &str) -> Result<Vec<SignedOperation>, LedgerError>;

    /// Validate `op` against the stored chain of `did` and append it.
    /// A genesis operation creates the DID.
    async fn submit(&self, did: &str, op: &SignedOperation) -> Result<(), LedgerError>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Write a self-signed genesis operation and return the new DID.
    async fn create(&self, options: CreateDidOptions<'_>) -> Result<String, LedgerError> {
        let (did, genesis) = genesis_operation(options)?;
        self.submit(&did, &genesis).await?;
        tracing::info!(did = %did, ledger = self.kind(), "DID created");
        Ok(did)
    }

    /// Replay the chain of `did`. Never returns a partially verified
    /// document.
    async fn resolve(&self, did: &str) -> Result<DidDocument, LedgerError> {
        validate_did(did)?;
        let ops = self.operation_log(did).await?;
        if ops.is_empty() {
            return Err(LedgerError::NotFound(did.to_string()));
        }
        Ok(replay(did, &ops)?.to_document())
    }

    /// Append an update signed by `signer`, which must hold the current
    /// signing key. Nothing is submitted if local validation fails.
    async fn update(
        &self,
        did: &str,
        changes: &DidChanges,
        signer: &SigningKeypair,
    ) -> Result<DidDocument, LedgerError> {
        validate_did(did)?;
        if let Some(handle) = &changes.handle {
            check_handle(handle)?;
        }

        let ops = self.operation_log(did).await?;
        if ops.is_empty() {
            return Err(LedgerError::NotFound(did.to_string()));
        }
        let current = replay(did, &ops)?;

        let signing_key = match &changes.signing_key {
            Some(key) => key.clone(),
            None => P256PublicKey::from_multibase(&current.signing_key)?,
        };
        let op = OperationDraft {
            op_type: OperationType::Update,
            signing_key,
            handle: changes.handle.clone().unwrap_or_else(|| current.handle.clone()),
            service: changes
                .service_endpoint
                .clone()
                .unwrap_or_else(|| current.service.clone()),
            prev: Some(current.head),
        }
        .sign(signer)?;

        let next = current.apply(&op)?;
        self.submit(did, &op).await?;
        tracing::info!(did = %did, ops = next.length, ledger = self.kind(), "DID updated");
        Ok(next.to_document())
    }
}

/// Anything that can turn a DID into a verified document.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, LedgerError>;
}

#[async_trait]
impl<T: IdentityLedger + ?Sized> DidResolver for T {
    async fn resolve_did(&self, did: &str) -> Result<DidDocument, LedgerError> {
        self.resolve(did).await
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// The ledger chosen by configuration.
#[derive(Clone)]
pub enum LedgerHandle {
    Embedded(Arc<EmbeddedLedger>),
    Remote(Arc<RemoteLedger>),
}

impl LedgerHandle {
    pub fn shared(&self) -> Arc<dyn IdentityLedger> {
        match self {
            LedgerHandle::Embedded(l) => l.clone(),
            LedgerHandle::Remote(l) => l.clone(),
        }
    }

    /// The embedded ledger, when this instance hosts one.
    pub fn embedded(&self) -> Option<Arc<EmbeddedLedger>> {
        match self {
            LedgerHandle::Embedded(l) => Some(l.clone()),
            LedgerHandle::Remote(_) => None,
        }
    }
}

/// Build the ledger named by `endpoint`. The embedded ledger lives in `db`.
pub fn ledger_from_config(endpoint: &LedgerEndpoint, db: &QuireDb) -> Result<LedgerHandle, LedgerError> {
    match endpoint {
        LedgerEndpoint::Embedded => Ok(LedgerHandle::Embedded(Arc::new(EmbeddedLedger::open(db)?))),
        LedgerEndpoint::Remote(url) => Ok(LedgerHandle::Remote(Arc::new(RemoteLedger::new(url)?))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded() -> (QuireDb, Arc<dyn IdentityLedger>) {
        let db = QuireDb::open_temporary().unwrap();
        let handle = ledger_from_config(&LedgerEndpoint::Embedded, &db).unwrap();
        assert!(handle.embedded().is_some());
        (db, handle.shared())
    }

    async fn create(ledger: &dyn IdentityLedger, kp: &SigningKeypair) -> String {
        ledger
            .create(CreateDidOptions {
                signing_key: kp,
                handle: "alice.quire.test".into(),
                service_url: "https://pds.quire.test".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_resolve() {
        let (_db, ledger) = embedded();
        let kp = SigningKeypair::generate();
        let did = create(ledger.as_ref(), &kp).await;

        let doc = ledger.resolve(&did).await.unwrap();
        assert_eq!(doc.id, did);
        assert_eq!(doc.handle(), Some("alice.quire.test"));
        assert_eq!(doc.signing_key().unwrap(), kp.public_key());
        assert_eq!(doc.service_endpoint(), Some("https://pds.quire.test"));
    }

    #[tokio::test]
    async fn genesis_can_be_prepared_before_submission() {
        let (_db, ledger) = embedded();
        let kp = SigningKeypair::generate();
        let (did, genesis) = genesis_operation(CreateDidOptions {
            signing_key: &kp,
            handle: "alice.quire.test".into(),
            service_url: "https://pds.quire.test".into(),
        })
        .unwrap();
        assert!(matches!(ledger.resolve(&did).await, Err(LedgerError::NotFound(_))));

        ledger.submit(&did, &genesis).await.unwrap();
        assert_eq!(ledger.resolve(&did).await.unwrap().signing_key().unwrap(), kp.public_key());
    }

    #[tokio::test]
    async fn unknown_did_is_not_found() {
        let (_db, ledger) = embedded();
        assert!(matches!(
            ledger.resolve("did:plc:aaaaaaaaaaaaaaaaaaaaaaaa").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_did_is_validation_error() {
        let (_db, ledger) = embedded();
        assert!(matches!(
            ledger.resolve("did:web:example.com").await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn update_rotates_key_and_handle() {
        let (_db, ledger) = embedded();
        let k1 = SigningKeypair::generate();
        let k2 = SigningKeypair::generate();
        let did = create(ledger.as_ref(), &k1).await;

        let changes = DidChanges {
            handle: Some("bob.quire.test".into()),
            signing_key: Some(k2.public_key()),
            ..Default::default()
        };
        let doc = ledger.update(&did, &changes, &k1).await.unwrap();
        assert_eq!(doc.handle(), Some("bob.quire.test"));
        assert_eq!(doc.signing_key().unwrap(), k2.public_key());

        // The old key no longer has authority.
        let again = DidChanges {
            handle: Some("eve.quire.test".into()),
            ..Default::default()
        };
        assert!(matches!(
            ledger.update(&did, &again, &k1).await,
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(ledger.operation_log(&did).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_with_wrong_key_does_not_mutate() {
        let (_db, ledger) = embedded();
        let owner = SigningKeypair::generate();
        let attacker = SigningKeypair::generate();
        let did = create(ledger.as_ref(), &owner).await;

        let changes = DidChanges {
            signing_key: Some(attacker.public_key()),
            ..Default::default()
        };
        assert!(matches!(
            ledger.update(&did, &changes, &attacker).await,
            Err(LedgerError::Validation(_))
        ));
        let doc = ledger.resolve(&did).await.unwrap();
        assert_eq!(doc.signing_key().unwrap(), owner.public_key());
    }

    #[tokio::test]
    async fn bad_handle_rejected() {
        let (_db, ledger) = embedded();
        let kp = SigningKeypair::generate();
        let result = ledger
            .create(CreateDidOptions {
                signing_key: &kp,
                handle: "no spaces allowed".into(),
                service_url: "https://pds.quire.test".into(),
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn resolver_blanket_impl() {
        let (_db, ledger) = embedded();
        let kp = SigningKeypair::generate();
        let did = create(ledger.as_ref(), &kp).await;
        assert_eq!(ledger.resolve_did(&did).await.unwrap().id, did);
    }
}
