// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics` on the metrics
//! port. All metrics live in a dedicated [`prometheus::Registry`] with the
//! `quire` prefix.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles shared by request handlers.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Open firehose WebSocket connections.
    pub firehose_subscribers: IntGauge,
    /// Firehose events written to subscribers.
    pub firehose_events_sent_total: IntCounter,
    /// Ledger requests answered successfully.
    pub ledger_ops_served_total: IntCounter,
    /// Ledger submissions or lookups refused as invalid.
    pub ledger_ops_rejected_total: IntCounter,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    metric: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Create and register all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("quire".into()), None)?;

        let firehose_subscribers = register(
            &registry,
            IntGauge::new("firehose_subscribers", "Open firehose subscriptions")?,
        )?;
        let firehose_events_sent_total = register(
            &registry,
            IntCounter::new(
                "firehose_events_sent_total",
                "Firehose events delivered to subscribers",
            )?,
        )?;
        let ledger_ops_served_total = register(
            &registry,
            IntCounter::new(
                "ledger_ops_served_total",
                "Ledger reads and submissions answered successfully",
            )?,
        )?;
        let ledger_ops_rejected_total = register(
            &registry,
            IntCounter::new(
                "ledger_ops_rejected_total",
                "Ledger submissions and lookups rejected as invalid",
            )?,
        )?;

        Ok(Self {
            registry,
            firehose_subscribers,
            firehose_events_sent_total,
            ledger_ops_served_total,
            ledger_ops_rejected_total,
        })
    }

    /// Encode all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
