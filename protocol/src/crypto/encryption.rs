// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # AES-256-GCM Key Wrapping
//!
//! Private signing keys never touch disk in the clear. They are sealed with
//! the instance-wide [`KeyEncryptionKey`] and opened only for the duration
//! of a single signing call.
//!
//! ## Wire format
//!
//! Both [`encrypt`] and [`encrypt_bound`] return `nonce || ciphertext`,
//! where the ciphertext carries the 16-byte GCM tag. The nonce is 96 random
//! bits from the OS RNG for every call.
//!
//! [`encrypt_bound`] also authenticates an AAD string. The key store passes
//! `did || key_id` there, so a sealed key copied onto another row no
//! longer opens.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::config::{KeyEncryptionKey, AES_NONCE_LENGTH, AES_TAG_LENGTH};

/// Errors that can occur while sealing or opening key material.
///
/// `DecryptFailed` does not say whether the key or the ciphertext was wrong.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key or corrupted ciphertext")]
    DecryptFailed,

    #[error("ciphertext too short: must be at least {} bytes", AES_NONCE_LENGTH + AES_TAG_LENGTH)]
    CiphertextTooShort,
}

/// Seal `plaintext` under the instance key.
///
/// # Example
///
/// ```
/// use quire_protocol::config::KeyEncryptionKey;
/// use quire_protocol::crypto::encryption::{decrypt, encrypt};
///
/// let kek = KeyEncryptionKey::from_bytes([0x42u8; 32]);
/// let sealed = encrypt(b"private jwk", &kek).unwrap();
/// assert_eq!(decrypt(&sealed, &kek).unwrap(), b"private jwk");
/// ```
pub fn encrypt(plaintext: &[u8], instance_key: &KeyEncryptionKey) -> Result<Vec<u8>, EncryptionError> {
    encrypt_bound(plaintext, instance_key, &[])
}

/// Open data sealed by [`encrypt`].
pub fn decrypt(sealed: &[u8], instance_key: &KeyEncryptionKey) -> Result<Vec<u8>, EncryptionError> {
    decrypt_bound(sealed, instance_key, &[])
}

/// Seal `plaintext` and authenticate `aad` alongside it.
pub fn encrypt_bound(
    plaintext: &[u8],
    instance_key: &KeyEncryptionKey,
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(instance_key.as_bytes())
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open data sealed by [`encrypt_bound`]. The same `aad` must be supplied.
pub fn decrypt_bound(
    sealed: &[u8],
    instance_key: &KeyEncryptionKey,
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < AES_NONCE_LENGTH + AES_TAG_LENGTH {
        return Err(EncryptionError::CiphertextTooShort);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(instance_key.as_bytes())
        .map_err(|_| EncryptionError::DecryptFailed)?;

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}
