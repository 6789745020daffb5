// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Key Management
//!
//! ECDSA P-256 keypairs for Quire identities. One key per DID per purpose
//! signs ledger operations and outbound HTTP requests.
//!
//! Three encodings show up in the system:
//!
//! - **JWK**. The key store keeps the public key as a JWK string and the
//!   private key as a sealed JWK.
//! - **Multibase**. DID documents and ledger operations embed the public key
//!   as `z` + base58btc(`0x80 0x24` || compressed SEC1 point).
//! - **Raw signature**. 64 bytes `r || s`, low-S normalized.
//!
//! ## Security considerations
//!
//! - Keys come from `OsRng`.
//! - `SecretKey` zeroizes on drop, and private JWKs travel as
//!   `Zeroizing<String>`.
//! - Key bytes are never logged. `Debug` prints the public half only.

use std::fmt;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::elliptic_curve::zeroize::Zeroizing;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::config::{P256_COMPRESSED_KEY_LENGTH, P256_MULTICODEC_PREFIX, P256_SIGNATURE_LENGTH};

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key material")]
    InvalidSecretKey,

    #[error("invalid public key: not a P-256 point")]
    InvalidPublicKey,

    #[error("invalid multibase key: {0}")]
    InvalidMultibase(String),
}

/// A freshly generated keypair in exchange form.
///
/// `private_jwk` zeroizes on drop. Seal it with
/// [`crate::crypto::encryption::encrypt`] and let it go.
pub struct GeneratedKeyPair {
    pub public_jwk: String,
    pub private_jwk: Zeroizing<String>,
}

impl fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("public_jwk", &self.public_jwk)
            .field("private_jwk", &"<redacted>")
            .finish()
    }
}

/// Generate a P-256 keypair from the OS RNG.
pub fn generate_key_pair() -> GeneratedKeyPair {
    SigningKeypair::generate().to_jwk_pair()
}

/// Convert a public JWK to its multibase exchange form.
pub fn public_key_to_multibase(public_jwk: &str) -> Result<String, KeyError> {
    Ok(P256PublicKey::from_jwk(public_jwk)?.to_multibase())
}

/// Inverse of [`public_key_to_multibase`].
pub fn public_key_from_multibase(multibase: &str) -> Result<String, KeyError> {
    Ok(P256PublicKey::from_multibase(multibase)?.to_jwk())
}

/// A P-256 signing keypair.
///
/// Not `Clone` and not `Serialize`. The private half leaves only through
/// [`SigningKeypair::to_jwk_pair`].
pub struct SigningKeypair {
    secret: SecretKey,
}

impl SigningKeypair {
    /// Fresh keypair from `OsRng`.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Rebuild a keypair from a private JWK (the `d` parameter must be present).
    pub fn from_private_jwk(jwk: &str) -> Result<Self, KeyError> {
        let secret = SecretKey::from_jwk_str(jwk).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    /// Deterministic keypair from 32 bytes of scalar. Test fixtures only
    /// need this; real keys come from [`SigningKeypair::generate`].
    pub fn from_scalar_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    pub fn public_key(&self) -> P256PublicKey {
        P256PublicKey {
            key: VerifyingKey::from(self.secret.public_key()),
        }
    }

    /// Both halves as JWK strings.
    pub fn to_jwk_pair(&self) -> GeneratedKeyPair {
        GeneratedKeyPair {
            public_jwk: self.secret.public_key().to_jwk_string(),
            private_jwk: self.secret.to_jwk_string(),
        }
    }

    /// ECDSA P-256 / SHA-256 over `message`, low-S normalized, as `r || s`.
    pub fn sign(&self, message: &[u8]) -> [u8; P256_SIGNATURE_LENGTH] {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(message);
        let signature = signature.normalize_s().unwrap_or(signature);

        let mut out = [0u8; P256_SIGNATURE_LENGTH];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKeypair(pub={})", self.public_key().to_multibase())
    }
}

/// The public half of a signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct P256PublicKey {
    key: VerifyingKey,
}

impl P256PublicKey {
    pub fn from_jwk(jwk: &str) -> Result<Self, KeyError> {
        let public = PublicKey::from_jwk_str(jwk).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self {
            key: VerifyingKey::from(public),
        })
    }

    pub fn to_jwk(&self) -> String {
        PublicKey::from(&self.key).to_jwk_string()
    }

    /// 33-byte compressed SEC1 encoding.
    pub fn to_compressed_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn from_compressed_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    /// `z` + base58btc(p256-pub multicodec || compressed point).
    pub fn to_multibase(&self) -> String {
        let mut prefixed = P256_MULTICODEC_PREFIX.to_vec();
        prefixed.extend_from_slice(&self.to_compressed_bytes());
        format!("z{}", bs58::encode(prefixed).into_string())
    }

    pub fn from_multibase(encoded: &str) -> Result<Self, KeyError> {
        let body = encoded
            .strip_prefix('z')
            .ok_or_else(|| KeyError::InvalidMultibase("expected base58btc 'z' prefix".into()))?;
        let decoded = bs58::decode(body)
            .into_vec()
            .map_err(|e| KeyError::InvalidMultibase(e.to_string()))?;
        let point = decoded
            .strip_prefix(P256_MULTICODEC_PREFIX.as_slice())
            .ok_or_else(|| KeyError::InvalidMultibase("not a p256-pub multicodec".into()))?;
        if point.len() != P256_COMPRESSED_KEY_LENGTH {
            return Err(KeyError::InvalidMultibase(format!(
                "expected {} key bytes, got {}",
                P256_COMPRESSED_KEY_LENGTH,
                point.len()
            )));
        }
        Self::from_compressed_bytes(point)
    }

    /// `true` iff `signature` is a valid `r || s` over `message`.
    ///
    /// Malformed signatures are just `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.key.verify(message, &signature).is_ok()
    }
}

impl fmt::Debug for P256PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P256PublicKey({})", self.to_multibase())
    }
}

impl fmt::Display for P256PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_multibase())
    }
}
