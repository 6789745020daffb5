// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Key Store
//!
//! Signing keys bound to a DID, kept in the `signing_keys` tree:
//!
//! ```text
//! did \0 key_id  ->  bincode(StoredKey)
//! ```
//!
//! The private half is sealed with AES-256-GCM under the instance
//! [`KeyEncryptionKey`], with `did|key_id` as associated data. It is
//! opened only by [`KeyStore::unwrap_signing_key`], and the resulting
//! [`SigningKeypair`] is meant to live for one signing call.
//!
//! A key stored with [`KeyStore::store_pending`] is never returned by
//! [`KeyStore::active`] until [`KeyStore::activate`] promotes it, which
//! happens only after the ledger publishes it.
//!
//! Rotation never deletes: the old row gets `invalidated_at` and stays
//! readable so historical signatures can still be checked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Tree;
use uuid::Uuid;

use crate::config::KeyEncryptionKey;
use crate::crypto::encryption::{decrypt_bound, encrypt_bound};
use crate::crypto::keys::{GeneratedKeyPair, KeyError, P256PublicKey, SigningKeypair};
use crate::identity::ledger::LedgerError;
use crate::storage::{DbError, QuireDb};

const KEYSTORE_TREE: &str = "signing_keys";

/// One stored key. The private half is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub did: String,
    pub key_id: String,
    pub purpose: String,
    pub public_jwk: String,
    sealed_private_jwk: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// `None` while the ledger has not yet published this key.
    pub activated_at: Option<DateTime<Utc>>,
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl StoredKey {
    pub fn is_active(&self) -> bool {
        self.activated_at.is_some() && self.invalidated_at.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.activated_at.is_none() && self.invalidated_at.is_none()
    }

    pub fn public_key(&self) -> Result<P256PublicKey, KeyError> {
        P256PublicKey::from_jwk(&self.public_jwk)
    }

    fn aad(did: &str, key_id: &str) -> Vec<u8> {
        format!("{}|{}", did, key_id).into_bytes()
    }
}

fn row_prefix(did: &str) -> Vec<u8> {
    let mut key = did.as_bytes().to_vec();
    key.push(0);
    key
}

fn row_key(did: &str, key_id: &str) -> Vec<u8> {
    let mut key = row_prefix(did);
    key.extend_from_slice(key_id.as_bytes());
    key
}

fn storage_err(e: impl ToString) -> LedgerError {
    LedgerError::Storage(DbError::Serialization(e.to_string()))
}

type TxResult<T> = Result<T, ConflictableTransactionError<LedgerError>>;

fn read_row(tx: &TransactionalTree, did: &str, key_id: &str) -> TxResult<StoredKey> {
    let bytes = tx.get(row_key(did, key_id))?.ok_or_else(|| {
        ConflictableTransactionError::Abort(LedgerError::NotFound(format!("{} key {}", did, key_id)))
    })?;
    bincode::deserialize(&bytes).map_err(|e| ConflictableTransactionError::Abort(storage_err(e)))
}

fn write_row(tx: &TransactionalTree, key: &StoredKey) -> TxResult<()> {
    let bytes =
        bincode::serialize(key).map_err(|e| ConflictableTransactionError::Abort(storage_err(e)))?;
    tx.insert(row_key(&key.did, &key.key_id), bytes)?;
    Ok(())
}

/// Encrypted signing keys for the DIDs hosted here.
#[derive(Clone)]
pub struct KeyStore {
    keys: Tree,
    kek: KeyEncryptionKey,
}

impl KeyStore {
    pub fn open(db: &QuireDb, kek: KeyEncryptionKey) -> Result<Self, LedgerError> {
        Ok(Self {
            keys: db.open_tree(KEYSTORE_TREE)?,
            kek,
        })
    }

    fn put(&self, key: &StoredKey) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(key).map_err(storage_err)?;
        self.keys.insert(row_key(&key.did, &key.key_id), bytes)?;
        Ok(())
    }

    /// Seal and persist a pair that is already published for `did`.
    pub fn store(
        &self,
        did: &str,
        purpose: &str,
        pair: &GeneratedKeyPair,
    ) -> Result<StoredKey, LedgerError> {
        self.seal(did, purpose, pair, Some(Utc::now()))
    }

    /// Seal and persist a pair the ledger has not accepted yet.
    pub fn store_pending(
        &self,
        did: &str,
        purpose: &str,
        pair: &GeneratedKeyPair,
    ) -> Result<StoredKey, LedgerError> {
        self.seal(did, purpose, pair, None)
    }

    fn seal(
        &self,
        did: &str,
        purpose: &str,
        pair: &GeneratedKeyPair,
        activated_at: Option<DateTime<Utc>>,
    ) -> Result<StoredKey, LedgerError> {
        // Refuse to store a pair whose halves disagree.
        let from_private = SigningKeypair::from_private_jwk(&pair.private_jwk)?;
        if from_private.public_key() != P256PublicKey::from_jwk(&pair.public_jwk)? {
            return Err(KeyError::InvalidPublicKey.into());
        }

        let key_id = Uuid::new_v4().to_string();
        let sealed = encrypt_bound(
            pair.private_jwk.as_bytes(),
            &self.kek,
            &StoredKey::aad(did, &key_id),
        )?;
        let stored = StoredKey {
            did: did.to_string(),
            key_id,
            purpose: purpose.to_string(),
            public_jwk: pair.public_jwk.clone(),
            sealed_private_jwk: sealed,
            created_at: Utc::now(),
            activated_at,
            invalidated_at: None,
        };
        self.put(&stored)?;
        tracing::debug!(
            did = %did,
            key_id = %stored.key_id,
            purpose,
            pending = stored.is_pending(),
            "signing key stored"
        );
        Ok(stored)
    }

    /// The most recently activated, non-invalidated key for `purpose`.
    pub fn active(&self, did: &str, purpose: &str) -> Result<Option<StoredKey>, LedgerError> {
        Ok(self
            .history(did)?
            .into_iter()
            .filter(|k| k.purpose == purpose && k.is_active())
            .max_by_key(|k| k.activated_at))
    }

    /// Keys for `purpose` still waiting on the ledger.
    pub fn pending(&self, did: &str, purpose: &str) -> Result<Vec<StoredKey>, LedgerError> {
        Ok(self
            .history(did)?
            .into_iter()
            .filter(|k| k.purpose == purpose && k.is_pending())
            .collect())
    }

    /// Promote a pending key and retire `replaces` in one transaction.
    /// Promoting an already active key only retires `replaces`.
    pub fn activate(
        &self,
        did: &str,
        key_id: &str,
        replaces: Option<&str>,
    ) -> Result<StoredKey, LedgerError> {
        let outcome = self.keys.transaction(|tx| {
            let now = Utc::now();
            let mut key = read_row(tx, did, key_id)?;
            if key.invalidated_at.is_some() {
                return Err(ConflictableTransactionError::Abort(LedgerError::Validation(
                    format!("key {} of {} was discarded", key_id, did),
                )));
            }
            if key.activated_at.is_none() {
                key.activated_at = Some(now);
                write_row(tx, &key)?;
            }
            if let Some(old_id) = replaces.filter(|old_id| *old_id != key_id) {
                let mut old = read_row(tx, did, old_id)?;
                if old.invalidated_at.is_none() {
                    old.invalidated_at = Some(now);
                    write_row(tx, &old)?;
                }
            }
            Ok(key)
        });

        let key = outcome.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => LedgerError::from(e),
        })?;
        tracing::info!(did = %did, key_id = %key_id, replaces = ?replaces, "signing key activated");
        Ok(key)
    }

    /// Open the sealed private key. Drop the result right after signing.
    pub fn unwrap_signing_key(&self, key: &StoredKey) -> Result<SigningKeypair, LedgerError> {
        let plaintext = p256::elliptic_curve::zeroize::Zeroizing::new(decrypt_bound(
            &key.sealed_private_jwk,
            &self.kek,
            &StoredKey::aad(&key.did, &key.key_id),
        )?);
        let jwk = std::str::from_utf8(&plaintext).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(SigningKeypair::from_private_jwk(jwk)?)
    }

    /// Mark a key as rotated out. Invalidating twice keeps the first
    /// timestamp.
    pub fn invalidate(&self, did: &str, key_id: &str) -> Result<StoredKey, LedgerError> {
        let bytes = self
            .keys
            .get(row_key(did, key_id))?
            .ok_or_else(|| LedgerError::NotFound(format!("{} key {}", did, key_id)))?;
        let mut key: StoredKey = bincode::deserialize(&bytes).map_err(storage_err)?;
        if key.invalidated_at.is_none() {
            key.invalidated_at = Some(Utc::now());
            self.put(&key)?;
            tracing::info!(did = %did, key_id = %key_id, "signing key invalidated");
        }
        Ok(key)
    }

    /// Every key ever stored for `did`, oldest first.
    pub fn history(&self, did: &str) -> Result<Vec<StoredKey>, LedgerError> {
        let mut keys = Vec::new();
        for row in self.keys.scan_prefix(row_prefix(did)) {
            let (_, value) = row?;
            keys.push(bincode::deserialize::<StoredKey>(&value).map_err(storage_err)?);
        }
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }
}
