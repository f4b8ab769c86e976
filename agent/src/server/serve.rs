//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::SyncError;
use crate::server::handlers::{check_handler, health_handler, status_handler, version_handler};
use crate::server::state::ServerState;

/// Routes of the local control server
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/status", get(status_handler))
        .route("/check", post(check_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), SyncError>>, SyncError> {
    let app = router(state);

    let addr = options.address();
    info!("Starting control server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SyncError::ConfigError(format!("Unable to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| SyncError::Internal(format!("control server failed: {}", e)))
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handlers::CheckResponse;
    use crate::sync::fsm::SchedulerState;
    use crate::sync::syncer::CycleReport;
    use crate::workers::scheduler::{CheckRequest, SchedulerStatus};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tokio::sync::{mpsc, RwLock};
    use tower::ServiceExt;

    fn state(capacity: usize) -> (Arc<ServerState>, mpsc::Receiver<CheckRequest>) {
        let (check_tx, check_rx) = mpsc::channel(capacity);
        let status = Arc::new(RwLock::new(SchedulerStatus::new("rpi-42")));
        let state = ServerState::new("rpi-42", status, check_tx, Duration::from_secs(5));
        (Arc::new(state), check_rx)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_halt() {
        let (state, _rx) = state(1);
        let app = router(state.clone());
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.status.write().await.state = SchedulerState::Halted;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_check_waits_for_scheduler_reply() {
        let (state, mut rx) = state(1);
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.only.as_deref(), Some("a.bin"));
            let report: CycleReport = serde_json::from_value(serde_json::json!({
                "started_at": "2024-01-01T00:00:00Z",
                "finished_at": null,
                "manifest_files": 1,
                "unchanged": 1,
                "applied": [],
                "failed": [],
                "pruned": []
            }))
            .unwrap();
            request.reply.send(Ok(report)).unwrap();
        });

        let response = router(state)
            .oneshot(
                Request::post("/check")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"file":"a.bin"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: CheckResponse = body_json(response).await;
        assert_eq!(body.report.unwrap().manifest_files, 1);
    }

    #[tokio::test]
    async fn test_check_without_scheduler() {
        let (state, rx) = state(1);
        drop(rx);
        let response = router(state)
            .oneshot(Request::post("/check").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
