#![warn(missing_docs)]

//! # pyrun-server
//!
//! HTTP front end for the pyrun sandbox.
//!
//! - `GET /health` reports liveness without touching the sandbox
//! - `POST /execute` takes `{"script": "..."}` and returns the entry
//!   function's result and captured stdout, or `{"error": "..."}` with 400
//! - `GET /metrics` serves Prometheus text (feature `metrics`)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use pyrun_sandbox::SandboxExecutor;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Body of `POST /execute`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    /// Python source defining the entry function.
    pub script: String,
}

/// Error body for every 4xx/5xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

impl ErrorBody {
    fn bad_request(message: impl Into<String>) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: message.into(),
            }),
        )
            .into_response()
    }
}

#[derive(Clone)]
struct AppState {
    executor: Arc<SandboxExecutor>,
    #[cfg(feature = "metrics")]
    registry: Option<Arc<prometheus_client::registry::Registry>>,
}

/// Build the router around a shared executor.
pub fn router(executor: Arc<SandboxExecutor>) -> Router {
    build(AppState {
        executor,
        #[cfg(feature = "metrics")]
        registry: None,
    })
}

/// Build the router with a `GET /metrics` endpoint encoding `registry`.
#[cfg(feature = "metrics")]
pub fn router_with_metrics(
    executor: Arc<SandboxExecutor>,
    registry: Arc<prometheus_client::registry::Registry>,
) -> Router {
    build(AppState {
        executor,
        registry: Some(registry),
    })
}

fn build(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `router` on `addr` until Ctrl-C.
pub async fn serve(addr: SocketAddr, router: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "pyrun server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

/// The body is parsed regardless of `Content-Type`.
async fn execute(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ExecuteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "execute: invalid request body");
            return ErrorBody::bad_request(format!("invalid request body: {e}"));
        }
    };

    let result = state.executor.execute(&request.script).await;
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

#[cfg(feature = "metrics")]
async fn metrics(State(state): State<AppState>) -> Response {
    let Some(registry) = &state.registry else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut buf = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buf, registry) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pyrun_sandbox::{IsolationMode, LauncherConfig, SandboxConfig};
    use tower::ServiceExt;

    fn app() -> Router {
        let config = SandboxConfig {
            launcher: LauncherConfig {
                interpreter: "/nonexistent/pyrun-test-python".into(),
                isolation: IsolationMode::Disabled,
                ..Default::default()
            },
            ..Default::default()
        };
        router(Arc::new(SandboxExecutor::new(config)))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn missing_script_field_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"code": "def main(): return 1"}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_string_script_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .body(Body::from(r#"{"script": 42}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn validation_failure_is_bad_request_with_message() {
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .body(Body::from(r#"{"script": "print('No main function')"}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("must define"));
        assert!(body.get("result").is_none());
    }

    #[tokio::test]
    async fn get_on_execute_is_not_allowed() {
        let request = Request::builder()
            .uri("/execute")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
