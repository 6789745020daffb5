// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Protocol Configuration & Constants
//!
//! Every magic number in Quire lives here, next to the runtime
//! [`InstanceConfig`] that the node hands to [`crate::pds::Pds`].
//!
//! Constants that touch wire formats (CID codecs, signature parameters,
//! the TID alphabet) are part of the protocol. Changing them breaks every
//! repository and every signed request already out there.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version reported by the node.
pub const PROTOCOL_VERSION: &str = "0.1.0";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits, always.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Raw `r || s` length of a P-256 ECDSA signature.
pub const P256_SIGNATURE_LENGTH: usize = 64;

/// Compressed SEC1 length of a P-256 public key.
pub const P256_COMPRESSED_KEY_LENGTH: usize = 33;

/// Multicodec varint prefix for `p256-pub` (0x1200).
pub const P256_MULTICODEC_PREFIX: [u8; 2] = [0x80, 0x24];

/// Purpose tag of the key that signs ledger operations and HTTP requests.
pub const SIGNING_KEY_PURPOSE: &str = "signing";

// ---------------------------------------------------------------------------
// Content Addressing
// ---------------------------------------------------------------------------

/// Multicodec for DAG-JSON, the codec tag on every CID we mint.
pub const DAG_JSON_CODEC: u64 = 0x0129;

/// Multihash code for SHA2-256.
pub const SHA2_256_CODE: u64 = 0x12;

/// Length of the method-specific part of a ledger DID.
pub const DID_SUFFIX_LENGTH: usize = 24;

/// DID method served by the identity ledger.
pub const DID_METHOD: &str = "plc";

// ---------------------------------------------------------------------------
// Repository & Firehose
// ---------------------------------------------------------------------------

/// How many times the write path recomputes a local sequence after losing
/// a race on `(did, localSeq)` before giving up.
pub const SEQUENCE_RETRY_BUDGET: usize = 5;

/// Upper bound of the jittered backoff between sequence retries, per attempt.
pub const SEQUENCE_RETRY_BACKOFF_MS: u64 = 5;

/// Default page size for `list_records`.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Hard ceiling for `list_records`. Bigger requests are clamped.
pub const MAX_LIST_LIMIT: usize = 100;

/// Commits read per storage round trip while replaying a firehose backlog.
pub const BACKLOG_PAGE_SIZE: usize = 500;

/// Capacity of the live commit broadcast channel.
pub const FIREHOSE_CHANNEL_CAPACITY: usize = 1024;

/// Maximum record key length.
pub const MAX_RECORD_KEY_LENGTH: usize = 512;

// ---------------------------------------------------------------------------
// HTTP Message Signatures
// ---------------------------------------------------------------------------

/// Algorithm identifier carried in `Signature-Input`.
pub const HTTP_SIGNATURE_ALGORITHM: &str = "ecdsa-p256-sha256";

/// Label used for the single signature we emit and accept.
pub const HTTP_SIGNATURE_LABEL: &str = "sig";

/// Maximum distance between `created` and the verifier's clock.
pub const SIGNATURE_MAX_SKEW: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Ledger Transport
// ---------------------------------------------------------------------------

/// Sentinel ledger URL that selects the embedded ledger.
pub const EMBEDDED_LEDGER_SENTINEL: &str = "embedded";

/// Request timeout for the remote ledger client.
pub const LEDGER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Errors raised while assembling an [`InstanceConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key-encryption key must be {AES_KEY_LENGTH} bytes of hex")]
    InvalidKeyEncryptionKey,

    #[error("invalid ledger url: {0}")]
    InvalidLedgerUrl(String),
}

/// Where DID documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEndpoint {
    /// Ledger stored in this instance's own database.
    Embedded,
    /// Ledger reached over HTTP at the given base URL.
    Remote(String),
}

impl LedgerEndpoint {
    /// Parse a ledger URL, honoring the `embedded` sentinel.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(EMBEDDED_LEDGER_SENTINEL) {
            return Ok(Self::Embedded);
        }
        if !(raw.starts_with("http://") || raw.starts_with("https://")) {
            return Err(ConfigError::InvalidLedgerUrl(raw.to_string()));
        }
        Ok(Self::Remote(raw.trim_end_matches('/').to_string()))
    }
}

/// The instance-wide symmetric key that wraps every private signing key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyEncryptionKey([u8; AES_KEY_LENGTH]);

impl KeyEncryptionKey {
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self, ConfigError> {
        let bytes =
            hex::decode(hex_str.trim()).map_err(|_| ConfigError::InvalidKeyEncryptionKey)?;
        let arr: [u8; AES_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| ConfigError::InvalidKeyEncryptionKey)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyEncryptionKey(<redacted>)")
    }
}

/// Everything a [`crate::pds::Pds`] needs to come up.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Ledger selection: embedded or remote.
    pub ledger: LedgerEndpoint,
    /// This instance's externally reachable base URL. Written as the
    /// service endpoint of every DID created here.
    pub public_url: String,
    /// Wraps private keys at rest.
    pub key_encryption_key: KeyEncryptionKey,
    /// Directory holding the sled database.
    pub data_dir: PathBuf,
}
