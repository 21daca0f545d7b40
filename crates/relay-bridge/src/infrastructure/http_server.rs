//! HTTP endpoint for the request-response transport.
//!
//! One route, `POST /server/jsonrpc`.  Every request body is one JSON-RPC
//! request; every call gets an ephemeral connection that exists only while
//! the call runs, so it never receives pushes and leaves no interest behind.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::application::hub::{ClientSink, TransportKind};
use crate::application::Broker;
use crate::domain::messages::parse_request;

/// Path of the JSON-RPC endpoint.
pub const JSONRPC_PATH: &str = "/server/jsonrpc";

/// Builds the router; exposed for in-process tests.
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route(JSONRPC_PATH, post(jsonrpc_handler))
        .with_state(broker)
}

/// POST /server/jsonrpc
async fn jsonrpc_handler(State(broker): State<Arc<Broker>>, body: String) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error_response) => return Json(error_response).into_response(),
    };
    let id = broker
        .connect(TransportKind::RequestResponse, ClientSink::Detached)
        .await;
    let response = broker.submit(id, request).await;
    broker.disconnect(id).await;
    match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Serves the endpoint on `addr` until `running` clears.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_http_server(
    addr: SocketAddr,
    broker: Arc<Broker>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!("HTTP transport listening on {addr}");
    axum::serve(listener, router(broker))
        .with_graceful_shutdown(async move {
            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await
        .context("HTTP server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::auth::ConfigAuthorizer;
    use crate::application::hub::TransportHub;
    use crate::application::store::MemoryQueueStore;
    use crate::application::{JobScheduler, SubscriptionService};
    use crate::domain::config::{AuthorizationConfig, JobQueueConfig};
    use crate::infrastructure::link::Link;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    /// A broker whose link is never attached.
    fn detached_broker() -> Arc<Broker> {
        let (link, _events) = Link::new(Duration::from_secs(1));
        let channel = Arc::new(link);
        let hub = Arc::new(TransportHub::new(Arc::new(ConfigAuthorizer::new(
            &AuthorizationConfig::default(),
        ))));
        let subscriptions = Arc::new(SubscriptionService::new(channel.clone()));
        let scheduler = Arc::new(JobScheduler::new(
            channel,
            Arc::clone(&hub),
            Arc::new(MemoryQueueStore::new()),
            JobQueueConfig {
                load_on_startup: false,
                automatic_transition: false,
                job_transition_delay: 0.0,
                job_transition_gcode: String::new(),
                queue_file: None,
            },
        ));
        Arc::new(Broker::new(hub, subscriptions, scheduler))
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(JSONRPC_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_job_queue_status_over_http() {
        let broker = detached_broker();

        let (status, body) = post_json(
            router(Arc::clone(&broker)),
            r#"{"jsonrpc":"2.0","method":"job_queue.status","id":7}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["queue_state"], "paused");
        assert_eq!(broker.hub().connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_json_returns_parse_error() {
        let (status, body) = post_json(router(detached_broker()), "{oops").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_upstream_call_without_link_reports_disconnected() {
        let (_, body) = post_json(
            router(detached_broker()),
            &json!({"jsonrpc": "2.0", "method": "objects.list", "id": 1}).to_string(),
        )
        .await;

        assert_eq!(body["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn test_notification_returns_no_content() {
        let (status, body) = post_json(
            router(detached_broker()),
            r#"{"jsonrpc":"2.0","method":"job_queue.pause"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_get_is_not_allowed() {
        let req = Request::builder()
            .uri(JSONRPC_PATH)
            .body(Body::empty())
            .unwrap();

        let resp = router(detached_broker()).oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
