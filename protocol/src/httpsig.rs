// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # HTTP Message Signatures
//!
//! A narrow profile of RFC 9421 for calls between Quire instances, signed
//! with the sending DID's P-256 key.
//!
//! ## Covered components
//!
//! | Request      | Components                                                  |
//! |--------------|-------------------------------------------------------------|
//! | without body | `@method`, `@target-uri`                                    |
//! | with body    | `@method`, `@target-uri`, `content-type`, `content-digest`  |
//!
//! An empty body counts as no body. The verifier insists on exactly the
//! component list that matches the request, so a signature made without
//! the body cannot be replayed with one.
//!
//! ## Signature base
//!
//! ```text
//! "@method": POST
//! "@target-uri": https://b.example/xrpc/com.example.op
//! "content-type": application/json
//! "content-digest": sha-256=:X48E9q...:
//! "@signature-params": ("@method" "@target-uri" "content-type" "content-digest");keyid="did:plc:...#atproto";alg="ecdsa-p256-sha256";created=1700000000
//! ```
//!
//! Lines are joined with `\n` and there is no trailing newline.
//!
//! ## Failure model
//!
//! Verification returns a [`Verification`], never an error, for anything
//! the request itself got wrong: missing headers, parse failures, stale
//! timestamps, digest or signature mismatches, unknown DIDs. Only a ledger
//! that cannot be reached (transport or storage) surfaces as `Err`, and
//! callers must treat that as a failed verification as well.

use std::fmt;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::config::{HTTP_SIGNATURE_ALGORITHM, HTTP_SIGNATURE_LABEL, SIGNATURE_MAX_SKEW};
use crate::crypto::hash::sha256;
use crate::crypto::keys::SigningKeypair;
use crate::identity::did::SIGNING_KEY_FRAGMENT;
use crate::identity::ledger::{DidResolver, LedgerError};

pub const SIGNATURE_INPUT_HEADER: &str = "signature-input";
pub const SIGNATURE_HEADER: &str = "signature";
pub const CONTENT_DIGEST_HEADER: &str = "content-digest";
const CONTENT_TYPE_HEADER: &str = "content-type";

const BODYLESS_COMPONENTS: [&str; 2] = ["@method", "@target-uri"];
const BODIED_COMPONENTS: [&str; 4] = ["@method", "@target-uri", "content-type", "content-digest"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors raised while *producing* a signature.
#[derive(Debug, Error)]
pub enum HttpSigError {
    #[error("request with a body needs a '{0}' header")]
    MissingHeader(&'static str),

    #[error("header value is not valid: {0}")]
    InvalidHeaderValue(String),
}

/// The parts of a request that get signed.
#[derive(Debug, Clone, Copy)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub target_uri: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

impl<'a> SignableRequest<'a> {
    fn body(&self) -> Option<&'a [u8]> {
        self.body.filter(|b| !b.is_empty())
    }
}

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature_input: String,
    pub signature: String,
    pub content_digest: Option<String>,
}

impl SignatureHeaders {
    /// Insert the headers into `headers`, replacing earlier values.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), HttpSigError> {
        let value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| HttpSigError::InvalidHeaderValue(e.to_string()))
        };
        headers.insert(
            HeaderName::from_static(SIGNATURE_INPUT_HEADER),
            value(&self.signature_input)?,
        );
        headers.insert(HeaderName::from_static(SIGNATURE_HEADER), value(&self.signature)?);
        if let Some(digest) = &self.content_digest {
            headers.insert(HeaderName::from_static(CONTENT_DIGEST_HEADER), value(digest)?);
        }
        Ok(())
    }
}

/// Why a verification failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    MissingHeader(&'static str),
    MalformedSignatureInput(String),
    MalformedSignature,
    UnsupportedAlgorithm(String),
    /// `created` is further than the allowed skew from now.
    Stale { created: i64, now: i64 },
    /// Covered components do not match the shape of the request.
    ComponentMismatch,
    DigestMismatch,
    UnresolvableDid(String),
    UnknownKey(String),
    BadSignature,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyFailure::MissingHeader(h) => write!(f, "missing header '{}'", h),
            VerifyFailure::MalformedSignatureInput(why) => write!(f, "malformed Signature-Input: {}", why),
            VerifyFailure::MalformedSignature => f.write_str("malformed Signature header"),
            VerifyFailure::UnsupportedAlgorithm(alg) => write!(f, "unsupported algorithm '{}'", alg),
            VerifyFailure::Stale { created, now } => {
                write!(f, "signature created at {} is outside the window around {}", created, now)
            }
            VerifyFailure::ComponentMismatch => f.write_str("covered components do not match request"),
            VerifyFailure::DigestMismatch => f.write_str("content digest does not match body"),
            VerifyFailure::UnresolvableDid(did) => write!(f, "cannot resolve {}", did),
            VerifyFailure::UnknownKey(id) => write!(f, "no verification method {}", id),
            VerifyFailure::BadSignature => f.write_str("signature does not verify"),
        }
    }
}

/// Outcome of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    /// The DID named by `keyid`, once it was parsed.
    pub signer_did: Option<String>,
    pub failure: Option<VerifyFailure>,
}

impl Verification {
    fn ok(did: String) -> Self {
        Self {
            verified: true,
            signer_did: Some(did),
            failure: None,
        }
    }

    fn failed(failure: VerifyFailure, did: Option<String>) -> Self {
        debug!(%failure, did = ?did, "HTTP signature rejected");
        Self {
            verified: false,
            signer_did: did,
            failure: Some(failure),
        }
    }
}

// ---------------------------------------------------------------------------
// Signature base
// ---------------------------------------------------------------------------

/// `sha-256=:<base64(sha256(body))>:`
pub fn content_digest(body: &[u8]) -> String {
    format!("sha-256=:{}:", STANDARD.encode(sha256(body)))
}

fn signature_params(components: &[&str], key_id: &str, created: i64) -> String {
    let list = components
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "({});keyid=\"{}\";alg=\"{}\";created={}",
        list, key_id, HTTP_SIGNATURE_ALGORITHM, created
    )
}

/// Component values in signing order.
struct BaseValues<'a> {
    method: String,
    target_uri: &'a str,
    content_type: Option<String>,
    content_digest: Option<String>,
}

fn signature_base(values: &BaseValues<'_>, params: &str) -> String {
    let mut lines = vec![
        format!("\"@method\": {}", values.method),
        format!("\"@target-uri\": {}", values.target_uri),
    ];
    if let (Some(content_type), Some(digest)) = (&values.content_type, &values.content_digest) {
        lines.push(format!("\"content-type\": {}", content_type));
        lines.push(format!("\"content-digest\": {}", digest));
    }
    lines.push(format!("\"@signature-params\": {}", params));
    lines.join("\n")
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Sign `request` now.
pub fn sign(
    request: &SignableRequest<'_>,
    signer: &SigningKeypair,
    key_id: &str,
) -> Result<SignatureHeaders, HttpSigError> {
    sign_at(request, signer, key_id, Utc::now().timestamp())
}

/// Sign `request` with an explicit `created` timestamp (unix seconds).
pub fn sign_at(
    request: &SignableRequest<'_>,
    signer: &SigningKeypair,
    key_id: &str,
    created: i64,
) -> Result<SignatureHeaders, HttpSigError> {
    let (components, content_type, digest) = match request.body() {
        Some(body) => {
            let content_type = header_str(request.headers, CONTENT_TYPE_HEADER)
                .ok_or(HttpSigError::MissingHeader(CONTENT_TYPE_HEADER))?
                .to_string();
            (&BODIED_COMPONENTS[..], Some(content_type), Some(content_digest(body)))
        }
        None => (&BODYLESS_COMPONENTS[..], None, None),
    };

    let params = signature_params(components, key_id, created);
    let base = signature_base(
        &BaseValues {
            method: request.method.to_ascii_uppercase(),
            target_uri: request.target_uri,
            content_type,
            content_digest: digest.clone(),
        },
        &params,
    );
    let signature = signer.sign(base.as_bytes());

    Ok(SignatureHeaders {
        signature_input: format!("{}={}", HTTP_SIGNATURE_LABEL, params),
        signature: format!("{}=:{}:", HTTP_SIGNATURE_LABEL, STANDARD.encode(signature)),
        content_digest: digest,
    })
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

struct ParsedInput {
    components: Vec<String>,
    key_id: String,
    alg: String,
    created: i64,
    /// Everything after `sig=`, reused verbatim in the base.
    raw_params: String,
}

fn parse_signature_input(header: &str) -> Result<ParsedInput, VerifyFailure> {
    let malformed = |why: &str| VerifyFailure::MalformedSignatureInput(why.to_string());
    let raw_params = header
        .strip_prefix(HTTP_SIGNATURE_LABEL)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| malformed("expected label 'sig'"))?;

    let inner = raw_params
        .strip_prefix('(')
        .ok_or_else(|| malformed("expected component list"))?;
    let close = inner.find(')').ok_or_else(|| malformed("unterminated component list"))?;
    let components = inner[..close]
        .split_whitespace()
        .map(|c| {
            c.strip_prefix('"')
                .and_then(|c| c.strip_suffix('"'))
                .map(str::to_string)
                .ok_or_else(|| malformed("component not quoted"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut key_id = None;
    let mut alg = None;
    let mut created = None;
    for param in inner[close + 1..].split(';').filter(|p| !p.is_empty()) {
        let (name, value) = param.split_once('=').ok_or_else(|| malformed("parameter without value"))?;
        let unquoted = value.strip_prefix('"').and_then(|v| v.strip_suffix('"'));
        match name {
            "keyid" => key_id = Some(unquoted.ok_or_else(|| malformed("keyid not quoted"))?.to_string()),
            "alg" => alg = Some(unquoted.ok_or_else(|| malformed("alg not quoted"))?.to_string()),
            "created" => created = Some(value.parse::<i64>().map_err(|_| malformed("created not an integer"))?),
            _ => {}
        }
    }

    Ok(ParsedInput {
        components,
        key_id: key_id.ok_or_else(|| malformed("missing keyid"))?,
        alg: alg.ok_or_else(|| malformed("missing alg"))?,
        created: created.ok_or_else(|| malformed("missing created"))?,
        raw_params: raw_params.to_string(),
    })
}

fn parse_signature(header: &str) -> Option<Vec<u8>> {
    let value = header
        .strip_prefix(HTTP_SIGNATURE_LABEL)?
        .strip_prefix('=')?
        .strip_prefix(':')?
        .strip_suffix(':')?;
    STANDARD.decode(value).ok()
}

/// Verify `request` against the signer's current DID document.
pub async fn verify<R: DidResolver + ?Sized>(
    request: &SignableRequest<'_>,
    resolver: &R,
) -> Result<Verification, LedgerError> {
    verify_at(request, resolver, Utc::now().timestamp()).await
}

/// [`verify`] with an explicit clock (unix seconds).
pub async fn verify_at<R: DidResolver + ?Sized>(
    request: &SignableRequest<'_>,
    resolver: &R,
    now: i64,
) -> Result<Verification, LedgerError> {
    let Some(input_header) = header_str(request.headers, SIGNATURE_INPUT_HEADER) else {
        return Ok(Verification::failed(VerifyFailure::MissingHeader(SIGNATURE_INPUT_HEADER), None));
    };
    let Some(signature_header) = header_str(request.headers, SIGNATURE_HEADER) else {
        return Ok(Verification::failed(VerifyFailure::MissingHeader(SIGNATURE_HEADER), None));
    };

    let input = match parse_signature_input(input_header) {
        Ok(input) => input,
        Err(failure) => return Ok(Verification::failed(failure, None)),
    };
    let (did, fragment) = match input.key_id.split_once('#') {
        Some((did, fragment)) => (did.to_string(), fragment.to_string()),
        None => (input.key_id.clone(), SIGNING_KEY_FRAGMENT.to_string()),
    };
    let fail = |failure: VerifyFailure| Ok(Verification::failed(failure, Some(did.clone())));

    if input.alg != HTTP_SIGNATURE_ALGORITHM {
        return fail(VerifyFailure::UnsupportedAlgorithm(input.alg));
    }
    let stale = now
        .checked_sub(input.created)
        .map_or(true, |skew| skew.unsigned_abs() > SIGNATURE_MAX_SKEW.as_secs());
    if stale {
        return fail(VerifyFailure::Stale {
            created: input.created,
            now,
        });
    }

    let body = request.body();
    let expected: &[&str] = if body.is_some() {
        &BODIED_COMPONENTS
    } else {
        &BODYLESS_COMPONENTS
    };
    if input.components.iter().map(String::as_str).ne(expected.iter().copied()) {
        return fail(VerifyFailure::ComponentMismatch);
    }

    let (content_type, digest) = match body {
        Some(body) => {
            let Some(content_type) = header_str(request.headers, CONTENT_TYPE_HEADER) else {
                return fail(VerifyFailure::MissingHeader(CONTENT_TYPE_HEADER));
            };
            let Some(claimed) = header_str(request.headers, CONTENT_DIGEST_HEADER) else {
                return fail(VerifyFailure::MissingHeader(CONTENT_DIGEST_HEADER));
            };
            if claimed != content_digest(body) {
                return fail(VerifyFailure::DigestMismatch);
            }
            (Some(content_type.to_string()), Some(claimed.to_string()))
        }
        None => (None, None),
    };

    let Some(signature) = parse_signature(signature_header) else {
        return fail(VerifyFailure::MalformedSignature);
    };

    let document = match resolver.resolve_did(&did).await {
        Ok(document) => document,
        Err(LedgerError::NotFound(_)) | Err(LedgerError::Validation(_)) => {
            return fail(VerifyFailure::UnresolvableDid(did.clone()));
        }
        Err(e) => return Err(e),
    };
    let Some(method) = document.verification_method(&fragment) else {
        return fail(VerifyFailure::UnknownKey(input.key_id.clone()));
    };
    let Ok(public_key) = method.public_key() else {
        return fail(VerifyFailure::UnknownKey(input.key_id.clone()));
    };

    let base = signature_base(
        &BaseValues {
            method: request.method.to_ascii_uppercase(),
            target_uri: request.target_uri,
            content_type,
            content_digest: digest,
        },
        &input.raw_params,
    );
    if !public_key.verify(base.as_bytes(), &signature) {
        return fail(VerifyFailure::BadSignature);
    }

    Ok(Verification::ok(did))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
