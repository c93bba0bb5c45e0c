//! Health check endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use outbox::OutboxStore;
use serde::Serialize;

/// The outbox of every service hosted by the node.
#[derive(Clone)]
pub struct HealthState {
    pub outboxes: Vec<(&'static str, Arc<dyn OutboxStore>)>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Rows waiting for publication per service.
    pub pending_outbox: BTreeMap<&'static str, u64>,
}

/// GET /health: reports whether every outbox is readable and its backlog.
pub async fn check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let mut pending_outbox = BTreeMap::new();
    let mut healthy = true;
    for (service, store) in &state.outboxes {
        match store.pending_count().await {
            Ok(count) => {
                pending_outbox.insert(*service, count);
            }
            Err(e) => {
                tracing::warn!(service, error = %e, "outbox unreadable");
                healthy = false;
            }
        }
    }

    let (code, status) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status,
            pending_outbox,
        }),
    )
}
