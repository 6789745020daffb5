// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # HTTP + WebSocket API
//!
//! Builds the axum router for the node. Handlers share [`AppState`]
//! through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                                      | Description                      |
//! |--------|-------------------------------------------|----------------------------------|
//! | GET    | `/health`                                 | Liveness probe                   |
//! | GET    | `/xrpc/com.atproto.sync.subscribeRepos`   | Firehose WebSocket, `?cursor=N`  |
//! | GET    | `/ledger/:did`                            | Resolved DID document            |
//! | GET    | `/ledger/:did/log`                        | Signed operation chain           |
//! | POST   | `/ledger/:did`                            | Submit one signed operation      |
//!
//! The `/ledger` routes exist only when the node hosts the embedded
//! ledger. They speak the protocol [`RemoteLedger`] consumes, so other
//! nodes can point `QUIRE_LEDGER` at `<this node>/ledger`.
//!
//! [`RemoteLedger`]: quire_protocol::identity::RemoteLedger

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use quire_protocol::identity::{
    DidDocument, EmbeddedLedger, IdentityLedger, LedgerError, SignedOperation,
};
use quire_protocol::repo::RepoError;
use quire_protocol::Pds;

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub pds: Arc<Pds>,
    pub metrics: SharedMetrics,
}

/// State of the `/ledger` routes.
#[derive(Clone)]
struct LedgerState {
    ledger: Arc<EmbeddedLedger>,
    metrics: SharedMetrics,
}

impl LedgerState {
    fn count<T>(&self, result: &Result<T, LedgerError>) {
        match result {
            Ok(_) => self.metrics.ledger_ops_served_total.inc(),
            Err(LedgerError::Validation(_)) => self.metrics.ledger_ops_rejected_total.inc(),
            Err(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/xrpc/com.atproto.sync.subscribeRepos",
            get(subscribe_repos_handler),
        );

    if let Some(ledger) = state.pds.ledger().embedded() {
        let ledger_routes = Router::new()
            .route("/:did", get(ledger_document_handler).post(ledger_submit_handler))
            .route("/:did/log", get(ledger_log_handler))
            .with_state(LedgerState {
                ledger,
                metrics: Arc::clone(&state.metrics),
            });
        router = router.nest("/ledger", ledger_routes);
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error body returned by every REST endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let (status, error) = match &e {
            LedgerError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "InvalidOperation"),
            LedgerError::Transport(_) => (StatusCode::BAD_GATEWAY, "UpstreamError"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "ledger request failed");
        }
        Self {
            status,
            error,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Response payload for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub ledger: String,
    /// DIDs on the embedded ledger, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_dids: Option<u64>,
    pub firehose_subscribers: usize,
}

/// `GET /health`. Liveness only: reads counters, never scans storage.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.pds.ledger();
    Json(HealthResponse {
        status: "ok".into(),
        version: state.version.clone(),
        ledger: ledger.shared().kind().into(),
        hosted_dids: ledger.embedded().and_then(|l| match l.did_count() {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read DID count");
                None
            }
        }),
        firehose_subscribers: state.pds.repository().subscriber_count(),
    })
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    cursor: Option<u64>,
}

/// `GET /xrpc/com.atproto.sync.subscribeRepos?cursor=N`
///
/// Replays commits after `cursor`, then streams live ones as JSON text
/// frames. Without a cursor the stream starts at the current head.
async fn subscribe_repos_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SubscribeParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_firehose(socket, state, params.cursor))
}

/// Frame sent before closing when the stream fails.
fn error_frame(e: &RepoError) -> String {
    let error = match e {
        RepoError::NotFound(_) => "FutureCursor",
        _ => "InternalError",
    };
    serde_json::json!({ "error": error, "message": e.to_string() }).to_string()
}

async fn stream_firehose(mut socket: WebSocket, state: AppState, cursor: Option<u64>) {
    let mut events = state.pds.subscribe_repos(cursor);
    state.metrics.firehose_subscribers.inc();
    tracing::info!(?cursor, "firehose subscriber connected");

    loop {
        tokio::select! {
            next = events.next() => {
                let frame = match next {
                    Some(Ok(event)) => match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(seq = event.seq, error = %e, "failed to encode firehose event");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "firehose stream failed");
                        let _ = socket.send(Message::Text(error_frame(&e))).await;
                        break;
                    }
                    None => break,
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
                state.metrics.firehose_events_sent_total.inc();
            }
            msg = socket.recv() => {
                match msg {
                    // Push-only channel; client frames are ignored.
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    state.metrics.firehose_subscribers.dec();
    tracing::info!("firehose subscriber disconnected");
}

/// `GET /ledger/:did`
async fn ledger_document_handler(
    State(state): State<LedgerState>,
    Path(did): Path<String>,
) -> Result<Json<DidDocument>, ApiError> {
    let result = state.ledger.resolve(&did).await;
    state.count(&result);
    Ok(Json(result?))
}

/// `GET /ledger/:did/log`. Unknown DIDs are 404, not an empty list.
async fn ledger_log_handler(
    State(state): State<LedgerState>,
    Path(did): Path<String>,
) -> Result<Json<Vec<SignedOperation>>, ApiError> {
    let result = match state.ledger.operation_log(&did).await {
        Ok(ops) if ops.is_empty() => Err(LedgerError::NotFound(did)),
        other => other,
    };
    state.count(&result);
    Ok(Json(result?))
}

/// `POST /ledger/:did`
async fn ledger_submit_handler(
    State(state): State<LedgerState>,
    Path(did): Path<String>,
    Json(op): Json<SignedOperation>,
) -> Result<StatusCode, ApiError> {
    let result = state.ledger.submit(&did, &op).await;
    state.count(&result);
    match &result {
        Ok(()) => tracing::info!(did = %did, op_type = ?op.op_type, "ledger operation accepted"),
        Err(e) => tracing::warn!(did = %did, error = %e, "ledger operation rejected"),
    }
    result?;
    Ok(StatusCode::CREATED)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
