// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Remote Ledger
//!
//! HTTP client for a ledger service speaking the same operation format as
//! the embedded ledger:
//!
//! | Request                   | Meaning                                  |
//! |---------------------------|------------------------------------------|
//! | `GET  <base>/<did>/log`   | signed chain, genesis first; 404 unknown |
//! | `POST <base>/<did>`       | submit one signed operation              |
//!
//! The client never trusts the service's view of the document. It
//! downloads the raw chain and replays it locally, so a lying or broken
//! service produces a validation error rather than a wrong key.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::LEDGER_REQUEST_TIMEOUT;
use crate::identity::ledger::{IdentityLedger, LedgerError};
use crate::identity::operation::SignedOperation;

#[derive(Debug, Clone)]
pub struct RemoteLedger {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteLedger {
    /// `base_url` without a trailing slash, e.g. `https://plc.example.com`.
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(LEDGER_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Map a non-success response to the ledger error taxonomy.
async fn error_from_response(did: &str, response: reqwest::Response) -> LedgerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => LedgerError::NotFound(did.to_string()),
        s if s.is_client_error() => LedgerError::Validation(format!("ledger rejected ({}): {}", s, body)),
        s => LedgerError::Transport(format!("ledger returned {}: {}", s, body)),
    }
}

#[async_trait]
impl IdentityLedger for RemoteLedger {
    async fn operation_log(&self, did: &str) -> Result<Vec<SignedOperation>, LedgerError> {
        let url = format!("{}/{}/log", self.base_url, did);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(did, response).await);
        }

        let bytes = response.bytes().await?;
        let ops: Vec<SignedOperation> = serde_json::from_slice(&bytes)
            .map_err(|e| LedgerError::Validation(format!("malformed operation log: {}", e)))?;
        debug!(did = %did, ops = ops.len(), "fetched remote operation log");
        Ok(ops)
    }

    async fn submit(&self, did: &str, op: &SignedOperation) -> Result<(), LedgerError> {
        let url = format!("{}/{}", self.base_url, did);
        let response = self.client.post(&url).json(op).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(did, response).await);
        }
        debug!(did = %did, "submitted operation to remote ledger");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}
