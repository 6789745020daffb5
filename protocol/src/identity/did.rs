// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # DID Documents
//!
//! Quire identities use the `did:plc:` method: the identifier is derived
//! from the hash of the signed genesis operation, and the document is the
//! result of replaying that DID's operation chain.
//!
//! ## DID Format
//!
//! ```text
//! did:plc:<24 chars of base32-lower(sha256(genesis))>
//! ```
//!
//! ## DID Document
//!
//! - `id`: the DID string
//! - `alsoKnownAs`: the handle as `at://<handle>`
//! - `verificationMethod`: one `Multikey` entry, fragment `#atproto`
//! - `service`: one `AtprotoPersonalDataServer` entry, fragment
//!   `#atproto_pds`
//!
//! ## Standards References
//!
//! - [DID Core v1.0](https://www.w3.org/TR/did-core/)
//! - [Multikey](https://www.w3.org/TR/controller-document/#multikey)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DID_METHOD, DID_SUFFIX_LENGTH};
use crate::crypto::keys::{KeyError, P256PublicKey};

/// Context URI for the W3C DID Core specification.
const DID_CONTEXT: &str = "https://www.w3.org/ns/did/v1";

/// Context URI for Multikey verification methods.
const MULTIKEY_CONTEXT: &str = "https://w3id.org/security/multikey/v1";

/// Verification method type for multibase-encoded keys.
pub const VERIFICATION_METHOD_TYPE: &str = "Multikey";

/// Fragment of the signing key inside the document.
pub const SIGNING_KEY_FRAGMENT: &str = "atproto";

/// Fragment and type of the personal data server service entry.
pub const PDS_SERVICE_FRAGMENT: &str = "atproto_pds";
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";

/// Handles are published as `at://<handle>`.
const HANDLE_SCHEME: &str = "at://";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during DID operations.
#[derive(Debug, Error)]
pub enum DidError {
    /// The DID string does not match the expected format.
    #[error("invalid DID format: {0}")]
    InvalidFormat(String),

    /// The DID method is not "plc".
    #[error("unsupported DID method: expected '{}', got '{0}'", DID_METHOD)]
    UnsupportedMethod(String),

    /// The document does not carry a usable signing key.
    #[error("DID document has no usable verification method: {0}")]
    MissingKey(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Check that `did` is a well-formed `did:plc:` identifier.
pub fn validate_did(did: &str) -> Result<(), DidError> {
    let parts: Vec<&str> = did.splitn(3, ':').collect();
    if parts.len() != 3 || parts[0] != "did" {
        return Err(DidError::InvalidFormat(
            "DID must have format 'did:<method>:<identifier>'".into(),
        ));
    }
    if parts[1] != DID_METHOD {
        return Err(DidError::UnsupportedMethod(parts[1].to_string()));
    }

    let suffix = parts[2];
    let alphabet_ok = suffix
        .bytes()
        .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b));
    if suffix.len() != DID_SUFFIX_LENGTH || !alphabet_ok {
        return Err(DidError::InvalidFormat(format!(
            "identifier must be {} base32 characters",
            DID_SUFFIX_LENGTH
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DID Document Types
// ---------------------------------------------------------------------------

/// A DID document as produced by replaying a ledger chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,

    pub id: String,

    pub also_known_as: Vec<String>,

    pub verification_method: Vec<VerificationMethod>,

    pub service: Vec<Service>,
}

impl DidDocument {
    /// Assemble the document for one replayed state.
    pub fn build(did: &str, handle: &str, signing_key: &str, service_endpoint: &str) -> Self {
        Self {
            context: vec![DID_CONTEXT.to_string(), MULTIKEY_CONTEXT.to_string()],
            id: did.to_string(),
            also_known_as: vec![format!("{}{}", HANDLE_SCHEME, handle)],
            verification_method: vec![VerificationMethod {
                id: format!("{}#{}", did, SIGNING_KEY_FRAGMENT),
                type_: VERIFICATION_METHOD_TYPE.to_string(),
                controller: did.to_string(),
                public_key_multibase: signing_key.to_string(),
            }],
            service: vec![Service {
                id: format!("#{}", PDS_SERVICE_FRAGMENT),
                type_: PDS_SERVICE_TYPE.to_string(),
                service_endpoint: service_endpoint.to_string(),
            }],
        }
    }

    /// The handle from the first `at://` alias.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix(HANDLE_SCHEME))
    }

    /// Look up a verification method by fragment. Accepts both `#frag` and
    /// the absolute `did#frag` form.
    pub fn verification_method(&self, fragment: &str) -> Option<&VerificationMethod> {
        let fragment = fragment.rsplit('#').next().unwrap_or(fragment);
        self.verification_method
            .iter()
            .find(|vm| vm.id.rsplit('#').next() == Some(fragment))
    }

    /// The `#atproto` signing key, decoded.
    pub fn signing_key(&self) -> Result<P256PublicKey, DidError> {
        let vm = self
            .verification_method(SIGNING_KEY_FRAGMENT)
            .ok_or_else(|| DidError::MissingKey(format!("{}#{}", self.id, SIGNING_KEY_FRAGMENT)))?;
        vm.public_key()
    }

    /// Endpoint of the personal data server service.
    pub fn service_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with(PDS_SERVICE_FRAGMENT) && s.type_ == PDS_SERVICE_TYPE)
            .map(|s| s.service_endpoint.as_str())
    }

    pub fn to_json(&self) -> Result<String, DidError> {
        serde_json::to_string_pretty(self).map_err(|e| DidError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, DidError> {
        serde_json::from_str(json).map_err(|e| DidError::Serialization(e.to_string()))
    }

    /// Structural checks: DID format, Core context, at least one key.
    pub fn validate(&self) -> Result<(), DidError> {
        validate_did(&self.id)?;
        if !self.context.iter().any(|c| c == DID_CONTEXT) {
            return Err(DidError::InvalidFormat(
                "document must include DID Core context".into(),
            ));
        }
        if self.verification_method.is_empty() {
            return Err(DidError::MissingKey(self.id.clone()));
        }
        Ok(())
    }
}

/// A verification method entry in a DID document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,

    #[serde(rename = "type")]
    pub type_: String,

    pub controller: String,

    /// `z` + base58btc(p256-pub multicodec || compressed point).
    pub public_key_multibase: String,
}

impl VerificationMethod {
    pub fn public_key(&self) -> Result<P256PublicKey, DidError> {
        Ok(P256PublicKey::from_multibase(&self.public_key_multibase)?)
    }
}

/// A service entry in a DID document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,

    #[serde(rename = "type")]
    pub type_: String,

    pub service_endpoint: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    const DID: &str = "did:plc:abcdefghijklmnopqrstuvwx";

    fn doc() -> (SigningKeypair, DidDocument) {
        let kp = SigningKeypair::generate();
        let doc = DidDocument::build(
            DID,
            "alice.quire.test",
            &kp.public_key().to_multibase(),
            "https://pds.quire.test",
        );
        (kp, doc)
    }

    #[test]
    fn valid_did_accepted() {
        assert!(validate_did(DID).is_ok());
        assert!(validate_did("did:plc:234567abcdefghijklmnopqr").is_ok());
    }

    #[test]
    fn invalid_did_prefix_rejected() {
        assert!(matches!(
            validate_did("notadid:plc:abcdefghijklmnopqrstuvwx"),
            Err(DidError::InvalidFormat(_))
        ));
    }

    #[test]
    fn wrong_method_rejected() {
        assert!(matches!(
            validate_did("did:web:example.com"),
            Err(DidError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn wrong_suffix_rejected() {
        assert!(validate_did("did:plc:short").is_err());
        assert!(validate_did("did:plc:ABCDEFGHIJKLMNOPQRSTUVWX").is_err());
        assert!(validate_did("did:plc:abcdefghijklmnopqrstuvw1").is_err());
    }

    #[test]
    fn document_has_required_fields() {
        let (kp, doc) = doc();
        assert!(doc.validate().is_ok());
        assert_eq!(doc.id, DID);
        assert_eq!(doc.handle(), Some("alice.quire.test"));
        assert_eq!(doc.service_endpoint(), Some("https://pds.quire.test"));
        assert_eq!(doc.signing_key().unwrap(), kp.public_key());
    }

    #[test]
    fn verification_method_lookup_accepts_both_forms() {
        let (_, doc) = doc();
        assert!(doc.verification_method("#atproto").is_some());
        assert!(doc.verification_method("atproto").is_some());
        assert!(doc
            .verification_method(&format!("{}#atproto", DID))
            .is_some());
        assert!(doc.verification_method("#other").is_none());
    }

    #[test]
    fn json_uses_did_core_names() {
        let (_, doc) = doc();
        let value: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(value["alsoKnownAs"][0], "at://alice.quire.test");
        assert_eq!(value["verificationMethod"][0]["type"], "Multikey");
        assert_eq!(value["verificationMethod"][0]["id"], format!("{}#atproto", DID));
        assert_eq!(value["service"][0]["id"], "#atproto_pds");
        assert_eq!(value["service"][0]["type"], "AtprotoPersonalDataServer");
        assert_eq!(value["service"][0]["serviceEndpoint"], "https://pds.quire.test");
    }

    #[test]
    fn json_roundtrip() {
        let (_, doc) = doc();
        let back = DidDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(back, doc);
    }
}
