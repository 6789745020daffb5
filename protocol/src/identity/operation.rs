// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Ledger Operations
//!
//! A DID's history is an append-only chain of signed operations:
//!
//! ```text
//! op[0]  type=create  prev=null        signed by op[0].signingKey
//! op[1]  type=update  prev=cid(op[0])  signed by op[0].signingKey
//! op[n]  type=update  prev=cid(op[n-1]) signed by op[n-1].signingKey
//! ```
//!
//! Each operation carries the complete state (key, handle, service), so
//! the current document is simply the last operation of a valid chain.
//! `sig` is base64url ECDSA P-256 over the canonical bytes of the
//! operation with `sig` removed.
//!
//! The DID itself is `did:plc:` + the first 24 characters of
//! base32-lower(sha256(canonical signed genesis)). Whoever holds the
//! genesis operation can recompute it.
//!
//! [`replay`] is strict: the first broken link fails the whole chain and
//! no partial state is returned.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addressing::{canonical_bytes, compute_cid, parse_cid, Cid, CidError};
use crate::config::{DID_METHOD, DID_SUFFIX_LENGTH};
use crate::crypto::hash::{base32_lower, sha256};
use crate::crypto::keys::{KeyError, P256PublicKey, SigningKeypair};
use crate::identity::did::DidDocument;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an operation or chain was rejected.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation chain is empty")]
    EmptyChain,

    #[error("operation {index}: expected type '{expected}'")]
    UnexpectedType { index: usize, expected: OperationType },

    #[error("genesis derives {derived}, not {expected}")]
    DidMismatch { expected: String, derived: String },

    #[error("operation {index}: prev is {found:?}, expected {expected:?}")]
    PrevMismatch {
        index: usize,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("operation {index}: signature does not verify")]
    BadSignature { index: usize },

    #[error("invalid signing key: {0}")]
    Key(#[from] KeyError),

    #[error("encoding error: {0}")]
    Encoding(#[from] CidError),
}

// ---------------------------------------------------------------------------
// Operation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => f.write_str("create"),
            OperationType::Update => f.write_str("update"),
        }
    }
}

/// One signed entry of a DID's operation chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOperation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Multibase P-256 key that authorizes the *next* operation.
    pub signing_key: String,
    pub handle: String,
    pub service: String,
    /// CID of the previous operation, `null` for genesis.
    pub prev: Option<String>,
    /// base64url(r || s).
    pub sig: String,
}

/// The content of an operation before it is signed.
#[derive(Debug, Clone)]
pub struct OperationDraft {
    pub op_type: OperationType,
    pub signing_key: P256PublicKey,
    pub handle: String,
    pub service: String,
    pub prev: Option<Cid>,
}

impl OperationDraft {
    /// Sign with `signer`. For genesis the signer must hold `signing_key`;
    /// for updates it must hold the key of the previous operation.
    pub fn sign(self, signer: &SigningKeypair) -> Result<SignedOperation, OperationError> {
        let mut op = SignedOperation {
            op_type: self.op_type,
            signing_key: self.signing_key.to_multibase(),
            handle: self.handle,
            service: self.service,
            prev: self.prev.map(|c| c.to_string()),
            sig: String::new(),
        };
        let signature = signer.sign(&op.signing_bytes()?);
        op.sig = URL_SAFE_NO_PAD.encode(signature);
        Ok(op)
    }
}

impl SignedOperation {
    /// Canonical bytes with `sig` removed.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, OperationError> {
        let mut value = serde_json::to_value(self).map_err(CidError::from)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("sig");
        }
        Ok(canonical_bytes(&value)?)
    }

    /// CID of the full signed operation. Successors reference this as `prev`.
    pub fn cid(&self) -> Result<Cid, OperationError> {
        Ok(compute_cid(self)?)
    }

    pub fn prev_cid(&self) -> Result<Option<Cid>, OperationError> {
        Ok(self.prev.as_deref().map(parse_cid).transpose()?)
    }

    pub fn verify_signature(&self, key: &P256PublicKey) -> Result<bool, OperationError> {
        let Ok(sig) = URL_SAFE_NO_PAD.decode(&self.sig) else {
            return Ok(false);
        };
        Ok(key.verify(&self.signing_bytes()?, &sig))
    }

    pub fn signing_public_key(&self) -> Result<P256PublicKey, OperationError> {
        Ok(P256PublicKey::from_multibase(&self.signing_key)?)
    }
}

/// Derive the DID named by a signed genesis operation.
pub fn derive_did(genesis: &SignedOperation) -> Result<String, OperationError> {
    let bytes = canonical_bytes(&serde_json::to_value(genesis).map_err(CidError::from)?)?;
    let encoded = base32_lower(&sha256(&bytes));
    Ok(format!("did:{}:{}", DID_METHOD, &encoded[..DID_SUFFIX_LENGTH]))
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// The state a valid chain leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationState {
    pub did: String,
    pub signing_key: String,
    pub handle: String,
    pub service: String,
    /// CID of the last operation.
    pub head: Cid,
    pub length: usize,
}

impl OperationState {
    pub fn to_document(&self) -> DidDocument {
        DidDocument::build(&self.did, &self.handle, &self.signing_key, &self.service)
    }

    /// Check that `op` is a valid successor and return the new state.
    pub fn apply(&self, op: &SignedOperation) -> Result<OperationState, OperationError> {
        let index = self.length;
        if op.op_type != OperationType::Update {
            return Err(OperationError::UnexpectedType {
                index,
                expected: OperationType::Update,
            });
        }

        let expected = self.head.to_string();
        if op.prev.as_deref() != Some(expected.as_str()) {
            return Err(OperationError::PrevMismatch {
                index,
                expected: Some(expected),
                found: op.prev.clone(),
            });
        }

        let authority = P256PublicKey::from_multibase(&self.signing_key)?;
        if !op.verify_signature(&authority)? {
            return Err(OperationError::BadSignature { index });
        }
        // The new key must at least parse, or the chain would be stuck.
        op.signing_public_key()?;

        Ok(OperationState {
            did: self.did.clone(),
            signing_key: op.signing_key.clone(),
            handle: op.handle.clone(),
            service: op.service.clone(),
            head: op.cid()?,
            length: self.length + 1,
        })
    }
}

/// Validate a genesis operation on its own and return the DID it creates.
pub fn genesis_state(genesis: &SignedOperation) -> Result<OperationState, OperationError> {
    if genesis.op_type != OperationType::Create {
        return Err(OperationError::UnexpectedType {
            index: 0,
            expected: OperationType::Create,
        });
    }
    if genesis.prev.is_some() {
        return Err(OperationError::PrevMismatch {
            index: 0,
            expected: None,
            found: genesis.prev.clone(),
        });
    }
    let key = genesis.signing_public_key()?;
    if !genesis.verify_signature(&key)? {
        return Err(OperationError::BadSignature { index: 0 });
    }

    Ok(OperationState {
        did: derive_did(genesis)?,
        signing_key: genesis.signing_key.clone(),
        handle: genesis.handle.clone(),
        service: genesis.service.clone(),
        head: genesis.cid()?,
        length: 1,
    })
}

/// Replay a full chain for `did`. Fails closed on the first bad link.
pub fn replay(did: &str, ops: &[SignedOperation]) -> Result<OperationState, OperationError> {
    let (genesis, rest) = ops.split_first().ok_or(OperationError::EmptyChain)?;
    let mut state = genesis_state(genesis)?;
    if state.did != did {
        return Err(OperationError::DidMismatch {
            expected: did.to_string(),
            derived: state.did,
        });
    }
    for op in rest {
        state = state.apply(op)?;
    }
    Ok(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
