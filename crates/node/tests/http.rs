//! Router tests for `/health` and `/metrics`.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use node::InMemoryNode;
use node::routes::health::HealthState;
use outbox::{OutboxError, OutboxId, OutboxRecord, OutboxStore};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// An outbox whose database is gone.
struct Unreachable;

#[async_trait]
impl OutboxStore for Unreachable {
    async fn claim_pending(&self, _: usize, _: Duration) -> outbox::Result<Vec<OutboxRecord>> {
        Err(OutboxError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn mark_published(&self, _: OutboxId) -> outbox::Result<bool> {
        Err(OutboxError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn release_claim(&self, _: OutboxId) -> outbox::Result<()> {
        Err(OutboxError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn purge_published(&self, _: DateTime<Utc>, _: usize) -> outbox::Result<u64> {
        Err(OutboxError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn pending_count(&self) -> outbox::Result<u64> {
        Err(OutboxError::Database(sqlx::Error::PoolTimedOut))
    }
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_reports_outbox_backlog() {
    let node = InMemoryNode::in_memory();
    let order = node
        .saga
        .place_order(
            common::UserId::new(),
            common::StoreId::new(),
            vec![domain::OrderItem::new("P1", 1)],
            common::Address::new("a"),
            common::Address::new("b"),
        )
        .await
        .unwrap();
    node.saga.accept(order.id).await.unwrap();

    let app = node::create_app(node.health_state(), get_metrics_handle());
    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pending_outbox"]["orders"], 1);
    assert_eq!(json["pending_outbox"]["inventory"], 0);
}

#[tokio::test]
async fn test_health_degrades_when_an_outbox_is_unreadable() {
    let state = HealthState {
        outboxes: vec![("orders", Arc::new(Unreachable) as Arc<dyn OutboxStore>)],
    };
    let app = node::create_app(state, get_metrics_handle());
    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn test_metrics_endpoint_renders_text() {
    let node = InMemoryNode::in_memory();
    let app = node::create_app(node.health_state(), get_metrics_handle());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_owned();
    assert!(content_type.starts_with("text/plain"));
}
