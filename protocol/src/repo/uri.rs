// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! Record URIs: `at://<did>/<collection>/<record-key>`.
//!
//! - `did`: `did:<method>:<id>`, method lowercase ASCII letters.
//! - `collection`: an NSID with at least three dot-separated segments,
//!   e.g. `app.quire.note`.
//! - `record-key`: 1 to 512 characters of `[A-Za-z0-9._:~-]`, neither
//!   `.` nor `..`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::config::MAX_RECORD_KEY_LENGTH;

const URI_SCHEME: &str = "at://";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid record URI: {0}")]
    Malformed(String),

    #[error("invalid DID in record URI: {0}")]
    InvalidDid(String),

    #[error("invalid collection NSID: {0}")]
    InvalidCollection(String),

    #[error("invalid record key: {0}")]
    InvalidRecordKey(String),
}

/// A parsed, validated record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub record_key: String,
}

impl AtUri {
    pub fn new(did: &str, collection: &str, record_key: &str) -> Result<Self, UriError> {
        validate_repo_did(did)?;
        validate_collection(collection)?;
        validate_record_key(record_key)?;
        Ok(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            record_key: record_key.to_string(),
        })
    }

    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| UriError::Malformed(format!("'{}' does not start with at://", uri)))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [did, collection, record_key] => Self::new(did, collection, record_key),
            _ => Err(UriError::Malformed(format!(
                "'{}' is not at://<did>/<collection>/<record-key>",
                uri
            ))),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}",
            URI_SCHEME, self.did, self.collection, self.record_key
        )
    }
}

impl FromStr for AtUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Generic DID syntax. Method-specific rules are the ledger's business.
pub fn validate_repo_did(did: &str) -> Result<(), UriError> {
    let mut parts = did.splitn(3, ':');
    let (Some("did"), Some(method), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(UriError::InvalidDid(did.to_string()));
    };
    let method_ok = !method.is_empty() && method.bytes().all(|b| b.is_ascii_lowercase());
    let id_ok = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'%' | b'-'));
    if method_ok && id_ok {
        Ok(())
    } else {
        Err(UriError::InvalidDid(did.to_string()))
    }
}

pub fn validate_collection(nsid: &str) -> Result<(), UriError> {
    let segments: Vec<&str> = nsid.split('.').collect();
    if segments.len() < 3 {
        return Err(UriError::InvalidCollection(format!(
            "'{}' needs at least three segments",
            nsid
        )));
    }
    for segment in &segments {
        let ok = !segment.is_empty()
            && !segment.starts_with('-')
            && !segment.ends_with('-')
            && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
        if !ok {
            return Err(UriError::InvalidCollection(nsid.to_string()));
        }
    }
    Ok(())
}

pub fn validate_record_key(record_key: &str) -> Result<(), UriError> {
    if record_key.is_empty() || record_key.len() > MAX_RECORD_KEY_LENGTH {
        return Err(UriError::InvalidRecordKey(format!(
            "length must be 1..={}",
            MAX_RECORD_KEY_LENGTH
        )));
    }
    if record_key == "." || record_key == ".." {
        return Err(UriError::InvalidRecordKey(record_key.to_string()));
    }
    let ok = record_key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-'));
    if !ok {
        return Err(UriError::InvalidRecordKey(record_key.to_string()));
    }
    Ok(())
}
