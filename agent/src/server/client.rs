//! Client side of the control server, used by `--check-now`

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::app::options::ServerOptions;
use crate::errors::{ErrorKind, SyncError};
use crate::server::handlers::{CheckBody, CheckResponse};
use crate::workers::scheduler::{CheckError, CheckReply};

/// Ask a running daemon to check now.
///
/// `Ok(None)` means no daemon is listening and the caller may check in-process.
pub async fn request_check(
    options: &ServerOptions,
    only: Option<&str>,
    timeout: Duration,
) -> Result<Option<CheckReply>, SyncError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::ConfigError(format!("Unable to build HTTP client: {}", e)))?;

    let url = format!("http://{}/check", options.address());
    let body = CheckBody {
        file: only.map(str::to_string),
    };

    let response = match client.post(&url).json(&body).send().await {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            debug!("No daemon listening on {}", options.address());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let status = response.status();
    let body: CheckResponse = response.json().await.map_err(|e| {
        SyncError::Internal(format!("unexpected control server reply ({}): {}", status, e))
    })?;

    let reply = match (body.report, body.error) {
        (Some(report), _) => Ok(report),
        (None, Some(error)) => Err(error),
        (None, None) => Err(CheckError::new(
            ErrorKind::Internal,
            format!("empty control server reply ({})", status),
        )),
    };
    Ok(Some(reply))
}
