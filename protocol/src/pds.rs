// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Pds
//!
//! The entry points a hosting instance exposes to its collaborators. A
//! [`Pds`] owns one sled database and wires together:
//!
//! - the [`KeyStore`] holding each hosted DID's sealed signing key,
//! - the identity ledger selected by [`InstanceConfig::ledger`],
//! - the [`Repository`] and its firehose.
//!
//! Private keys leave the key store only inside [`Pds::update_did_document`]
//! and [`Pds::sign_request`], and only for the duration of one signature.

use futures::stream::BoxStream;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{InstanceConfig, SIGNING_KEY_PURPOSE};
use crate::crypto::keys::{generate_key_pair, KeyError, SigningKeypair};
use crate::httpsig::{self, HttpSigError, SignableRequest, SignatureHeaders, Verification};
use crate::identity::did::{DidDocument, SIGNING_KEY_FRAGMENT};
use crate::identity::keystore::{KeyStore, StoredKey};
use crate::identity::ledger::{
    genesis_operation, ledger_from_config, CreateDidOptions, DidChanges, IdentityLedger,
    LedgerError, LedgerHandle,
};
use crate::repo::commit::Commit;
use crate::repo::firehose::FirehoseEvent;
use crate::repo::repository::{
    CreateRecordInput, DeleteRecordInput, ListOptions, PutRecordInput, RecordPage, RecordView,
    RepoError, Repository, WriteResult,
};
use crate::storage::{DbError, QuireDb};

#[derive(Debug, Error)]
pub enum PdsError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Storage(#[from] DbError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Signature(#[from] HttpSigError),

    #[error("no active signing key for {0}")]
    NoSigningKey(String),
}

/// Inputs for [`Pds::create_did`].
#[derive(Debug, Clone)]
pub struct NewDid {
    pub handle: String,
    /// Defaults to this instance's public URL.
    pub service_url: Option<String>,
}

/// Inputs for [`Pds::update_did_document`].
#[derive(Debug, Clone, Default)]
pub struct DidDocumentUpdate {
    pub handle: Option<String>,
    pub service_endpoint: Option<String>,
    /// Generate a fresh signing key and publish it in the same operation.
    pub rotate_signing_key: bool,
}

pub struct Pds {
    config: InstanceConfig,
    repo: Repository,
    ledger: LedgerHandle,
    keys: KeyStore,
}

impl Pds {
    /// Open (or create) the database under `config.data_dir`.
    pub fn open(config: InstanceConfig) -> Result<Self, PdsError> {
        let db = QuireDb::open(&config.data_dir)?;
        Self::with_db(config, db)
    }

    /// Build on an already opened database. Tests pass a temporary one.
    pub fn with_db(config: InstanceConfig, db: QuireDb) -> Result<Self, PdsError> {
        let ledger = ledger_from_config(&config.ledger, &db)?;
        let keys = KeyStore::open(&db, config.key_encryption_key.clone())?;
        info!(
            ledger = ledger.shared().kind(),
            public_url = %config.public_url,
            "instance ready"
        );
        Ok(Self {
            repo: Repository::new(db),
            ledger,
            keys,
            config,
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Generate a key, register a DID on the ledger, and keep the key
    /// sealed locally.
    ///
    /// The key is sealed as pending before the genesis operation is
    /// submitted, so a DID never reaches the ledger without its key on disk.
    pub async fn create_did(&self, request: NewDid) -> Result<String, PdsError> {
        let pair = generate_key_pair();
        let service_url = request
            .service_url
            .unwrap_or_else(|| self.config.public_url.clone());

        let signer = SigningKeypair::from_private_jwk(&pair.private_jwk)?;
        let (did, genesis) = genesis_operation(CreateDidOptions {
            signing_key: &signer,
            handle: request.handle,
            service_url,
        })?;
        drop(signer);

        let stored = self.keys.store_pending(&did, SIGNING_KEY_PURPOSE, &pair)?;
        self.ledger.shared().submit(&did, &genesis).await?;
        self.keys.activate(&did, &stored.key_id, None)?;
        info!(did = %did, ledger = self.ledger.shared().kind(), "DID created");
        Ok(did)
    }

    pub async fn resolve_did(&self, did: &str) -> Result<DidDocument, PdsError> {
        Ok(self.ledger.shared().resolve(did).await?)
    }

    /// Sign and submit an update with the DID's active key.
    ///
    /// With `rotate_signing_key` the new key is stored pending before
    /// submission, so requests signed meanwhile still use the published
    /// key. Once the ledger accepts, the new key is activated and the old
    /// one invalidated together. A rejected rotation discards the new key.
    /// When the outcome is unknown the key stays pending and the next
    /// update settles it against the published document.
    pub async fn update_did_document(
        &self,
        did: &str,
        update: DidDocumentUpdate,
    ) -> Result<DidDocument, PdsError> {
        self.settle_pending_keys(did).await?;
        let current = self.active_key(did)?;
        let signer = self.keys.unwrap_signing_key(&current)?;

        let rotated: Option<StoredKey> = if update.rotate_signing_key {
            Some(self.keys.store_pending(did, SIGNING_KEY_PURPOSE, &generate_key_pair())?)
        } else {
            None
        };
        let changes = DidChanges {
            handle: update.handle,
            service_endpoint: update.service_endpoint,
            signing_key: rotated.as_ref().map(StoredKey::public_key).transpose()?,
        };

        let result = self.ledger.shared().update(did, &changes, &signer).await;
        drop(signer);

        match (result, rotated) {
            (Ok(document), Some(new_key)) => {
                self.keys
                    .activate(did, &new_key.key_id, Some(&current.key_id))?;
                info!(did = %did, old_key = %current.key_id, "signing key rotated");
                Ok(document)
            }
            (Ok(document), None) => Ok(document),
            (Err(e @ (LedgerError::Validation(_) | LedgerError::NotFound(_))), Some(new_key)) => {
                warn!(did = %did, error = %e, "rotation rejected, discarding new key");
                self.keys.invalidate(did, &new_key.key_id)?;
                Err(e.into())
            }
            (Err(e), Some(new_key)) => {
                warn!(did = %did, key_id = %new_key.key_id, error = %e, "rotation outcome unknown, key left pending");
                Err(e.into())
            }
            (Err(e), None) => Err(e.into()),
        }
    }

    /// Activate a pending key that the ledger already publishes for `did`.
    /// Covers a rotation or creation interrupted after the ledger accepted.
    async fn settle_pending_keys(&self, did: &str) -> Result<(), PdsError> {
        let pending = self.keys.pending(did, SIGNING_KEY_PURPOSE)?;
        if pending.is_empty() {
            return Ok(());
        }
        let published = match self.ledger.shared().resolve(did).await {
            Ok(document) => document.signing_key().map_err(LedgerError::from)?,
            Err(LedgerError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for key in pending {
            if key.public_key()? != published {
                continue;
            }
            let replaces = self
                .keys
                .active(did, SIGNING_KEY_PURPOSE)?
                .map(|active| active.key_id);
            self.keys.activate(did, &key.key_id, replaces.as_deref())?;
            warn!(did = %did, key_id = %key.key_id, "settled interrupted key activation");
        }
        Ok(())
    }

    fn active_key(&self, did: &str) -> Result<StoredKey, PdsError> {
        self.keys
            .active(did, SIGNING_KEY_PURPOSE)?
            .ok_or_else(|| PdsError::NoSigningKey(did.to_string()))
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    pub async fn create_record(&self, input: CreateRecordInput) -> Result<WriteResult, PdsError> {
        Ok(self.repo.create_record(input).await?)
    }

    pub async fn put_record(&self, input: PutRecordInput) -> Result<WriteResult, PdsError> {
        Ok(self.repo.put_record(input).await?)
    }

    pub async fn delete_record(&self, input: DeleteRecordInput) -> Result<Commit, PdsError> {
        Ok(self.repo.delete_record(input).await?)
    }

    pub async fn get_record(&self, uri: &str) -> Result<RecordView, PdsError> {
        Ok(self.repo.get_record(uri).await?)
    }

    pub async fn list_records(
        &self,
        did: &str,
        collection: &str,
        options: ListOptions,
    ) -> Result<RecordPage, PdsError> {
        Ok(self.repo.list_records(did, collection, options).await?)
    }

    pub fn subscribe_repos(
        &self,
        cursor: Option<u64>,
    ) -> BoxStream<'static, Result<FirehoseEvent, RepoError>> {
        self.repo.subscribe(cursor)
    }

    // -----------------------------------------------------------------------
    // Inter-instance requests
    // -----------------------------------------------------------------------

    /// Sign an outbound request as `did`.
    pub fn sign_request(
        &self,
        did: &str,
        request: &SignableRequest<'_>,
    ) -> Result<SignatureHeaders, PdsError> {
        let key = self.active_key(did)?;
        let signer = self.keys.unwrap_signing_key(&key)?;
        let key_id = format!("{}#{}", did, SIGNING_KEY_FRAGMENT);
        Ok(httpsig::sign(request, &signer, &key_id)?)
    }

    /// Check an inbound request against the signer's DID document.
    pub async fn verify_request(
        &self,
        request: &SignableRequest<'_>,
    ) -> Result<Verification, PdsError> {
        let ledger = self.ledger.shared();
        Ok(httpsig::verify(request, ledger.as_ref()).await?)
    }
}
