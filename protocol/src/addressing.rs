// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Content Addressing
//!
//! Every record, every ledger operation and every commit is named by a CID
//! (CIDv1, DAG-JSON codec, SHA2-256 multihash, base32 multibase).
//!
//! ## Canonical form
//!
//! A document is hashed over its canonical bytes:
//!
//! - object keys sorted by their UTF-8 bytes, recursively,
//! - no insignificant whitespace,
//! - strings, integers, booleans and null as serde_json writes them,
//! - floating point numbers rejected.
//!
//! The canonical writer walks the `Value` itself, so key order never depends
//! on which serde_json features happen to be enabled in the build.
//!
//! ## Commit chaining
//!
//! [`compute_commit_cid`] hashes `{"data": <new cid>, "prev": <prev commit
//! cid | null>}`. Replaying a DID's commits from genesis therefore rebuilds
//! every stored commit CID, and rewriting any historical entry changes all
//! of its successors.

use std::io::Write;

pub use cid::Cid;
use cid::multihash::Multihash;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{DAG_JSON_CODEC, SHA2_256_CODE};
use crate::crypto::hash::sha256;

/// Errors raised while canonicalizing or hashing a document.
#[derive(Debug, Error)]
pub enum CidError {
    #[error("document is not representable: {0}")]
    Unrepresentable(String),

    #[error("floating point numbers are not allowed in content-addressed documents")]
    FloatNotAllowed,

    #[error("invalid CID: {0}")]
    InvalidCid(String),
}

impl From<serde_json::Error> for CidError {
    fn from(e: serde_json::Error) -> Self {
        CidError::Unrepresentable(e.to_string())
    }
}

impl From<std::io::Error> for CidError {
    fn from(e: std::io::Error) -> Self {
        CidError::Unrepresentable(e.to_string())
    }
}

/// Canonical bytes of a JSON value.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CidError> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical bytes of anything serde can turn into JSON.
pub fn canonical_bytes_of<T: Serialize + ?Sized>(doc: &T) -> Result<Vec<u8>, CidError> {
    canonical_bytes(&serde_json::to_value(doc)?)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), CidError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(child, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, child) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(child, out)?;
            }
            out.push(b']');
        }
        Value::Number(n) if n.is_f64() => return Err(CidError::FloatNotAllowed),
        Value::Null => out.write_all(b"null")?,
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// CID of already-canonical bytes.
pub fn cid_for_bytes(canonical: &[u8]) -> Result<Cid, CidError> {
    let digest = sha256(canonical);
    let multihash = Multihash::<64>::wrap(SHA2_256_CODE, &digest)
        .map_err(|e| CidError::InvalidCid(e.to_string()))?;
    Ok(Cid::new_v1(DAG_JSON_CODEC, multihash))
}

/// Canonicalize `doc` and hash it.
///
/// Identical logical content always yields the same CID, whatever the key
/// order of the input.
///
/// ```
/// use quire_protocol::addressing::compute_cid;
/// use serde_json::json;
///
/// let a = compute_cid(&json!({"value": 1, "$type": "x"})).unwrap();
/// let b = compute_cid(&json!({"$type": "x", "value": 1})).unwrap();
/// assert_eq!(a, b);
/// ```
pub fn compute_cid<T: Serialize + ?Sized>(doc: &T) -> Result<Cid, CidError> {
    cid_for_bytes(&canonical_bytes_of(doc)?)
}

/// Bind `new_cid` to the previous commit of the same DID.
pub fn compute_commit_cid(new_cid: &Cid, prev_commit_cid: Option<&Cid>) -> Result<Cid, CidError> {
    let link = serde_json::json!({
        "data": new_cid.to_string(),
        "prev": prev_commit_cid.map(|c| c.to_string()),
    });
    compute_cid(&link)
}

/// Parse the string form of a CID.
pub fn parse_cid(s: &str) -> Result<Cid, CidError> {
    Cid::try_from(s).map_err(|e| CidError::InvalidCid(e.to_string()))
}

/// Serde adapter storing a [`Cid`] as its string form.
pub mod cid_string {
    use super::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cid: &Cid, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&cid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Cid, D::Error> {
        let raw = String::deserialize(d)?;
        Cid::try_from(raw.as_str()).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Cid>`.
pub mod option_cid_string {
    use super::Cid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(cid: &Option<Cid>, s: S) -> Result<S::Ok, S::Error> {
        match cid {
            Some(c) => s.serialize_some(&c.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Cid>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| Cid::try_from(r.as_str()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
