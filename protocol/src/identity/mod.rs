// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Identity Module
//!
//! DIDs, their documents and the keys that control them.
//!
//! The identity stack is layered:
//!
//! 1. **Operations**: signed, hash-chained ledger entries. Replaying a
//!    valid chain yields the current DID document.
//! 2. **Ledger**: where the chains live, either embedded in this
//!    instance's database or behind a remote HTTP service.
//! 3. **Key store**: the private halves of the DID signing keys, sealed
//!    under the instance key-encryption key.
//!
//! ## Design Decisions
//!
//! - ECDSA P-256 everywhere. The same key signs ledger operations and
//!   outbound HTTP requests.
//! - Verification fails closed. A chain with one bad link resolves to an
//!   error, never to the last good state.

pub mod did;
pub mod embedded;
pub mod keystore;
pub mod ledger;
pub mod operation;
pub mod remote;

pub use did::{validate_did, DidDocument, DidError, Service, VerificationMethod};
pub use embedded::EmbeddedLedger;
pub use keystore::{KeyStore, StoredKey};
pub use ledger::{
    genesis_operation, ledger_from_config, CreateDidOptions, DidChanges, DidResolver,
    IdentityLedger, LedgerError, LedgerHandle,
};
pub use operation::{OperationError, OperationType, SignedOperation};
pub use remote::RemoteLedger;
