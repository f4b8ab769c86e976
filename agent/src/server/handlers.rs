//! HTTP request handlers

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::ErrorKind;
use crate::server::state::ServerState;
use crate::sync::fsm::SchedulerState;
use crate::sync::syncer::CycleReport;
use crate::utils::version_info;
use crate::workers::scheduler::{CheckError, CheckRequest};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub device_id: String,
}

/// Health check handler; unhealthy once the scheduler halted
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let halted = state.status.read().await.state == SchedulerState::Halted;
    let (code, status) = if halted {
        (StatusCode::SERVICE_UNAVAILABLE, "halted")
    } else {
        (StatusCode::OK, "healthy")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            service: "pisync".to_string(),
            version: version_info().version,
            device_id: state.device_id.clone(),
        }),
    )
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Scheduler status handler
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.status.read().await.clone())
}

/// Optional body of `POST /check`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CheckBody {
    /// Restrict the check to one manifest entry
    #[serde(default)]
    pub file: Option<String>,
}

/// Outcome of `POST /check`
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    #[serde(default)]
    pub report: Option<CycleReport>,
    #[serde(default)]
    pub error: Option<CheckError>,
}

/// Check-now handler: queues behind any running cycle and waits for the result
pub async fn check_handler(State(state): State<Arc<ServerState>>, body: Bytes) -> impl IntoResponse {
    let body: CheckBody = if body.is_empty() {
        CheckBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return failure(
                    StatusCode::BAD_REQUEST,
                    CheckError::new(ErrorKind::Client, format!("invalid body: {}", e)),
                )
            }
        }
    };

    let (request, reply_rx) = CheckRequest::new(body.file);
    if state.check_tx.send(request).await.is_err() {
        warn!("Check requested but the scheduler is not running");
        return failure(
            StatusCode::SERVICE_UNAVAILABLE,
            CheckError::new(ErrorKind::Internal, "scheduler is not running"),
        );
    }
    debug!("Check request queued");

    match tokio::time::timeout(state.check_timeout, reply_rx).await {
        Ok(Ok(Ok(report))) => (
            StatusCode::OK,
            Json(CheckResponse {
                report: Some(report),
                error: None,
            }),
        ),
        Ok(Ok(Err(error))) => failure(StatusCode::BAD_GATEWAY, error),
        Ok(Err(_)) => failure(
            StatusCode::SERVICE_UNAVAILABLE,
            CheckError::new(ErrorKind::Internal, "scheduler stopped before the check ran"),
        ),
        Err(_) => failure(
            StatusCode::GATEWAY_TIMEOUT,
            CheckError::new(
                ErrorKind::TransientNetwork,
                format!("check did not finish within {}s", state.check_timeout.as_secs()),
            ),
        ),
    }
}

fn failure(code: StatusCode, error: CheckError) -> (StatusCode, Json<CheckResponse>) {
    (
        code,
        Json(CheckResponse {
            report: None,
            error: Some(error),
        }),
    )
}
