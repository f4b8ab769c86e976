//! Error types for the sync agent

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the sync agent
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Missing or unusable identity, credential or settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The server rejected the credential. Halts scheduling.
    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Transient network error: {0}")]
    TransientNetworkError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`SyncError`], used for retry and exit decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Auth,
    TransientNetwork,
    Server,
    Client,
    IntegrityMismatch,
    Storage,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Auth => "auth",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::Storage => "storage",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit codes understood by the service supervisor
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const AUTH: i32 = 3;
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ConfigError(_) => ErrorKind::Configuration,
            SyncError::AuthError(_) => ErrorKind::Auth,
            SyncError::TransientNetworkError(_) => ErrorKind::TransientNetwork,
            SyncError::ServerError(_) | SyncError::JsonError(_) => ErrorKind::Server,
            SyncError::ClientError(_) | SyncError::ValidationError(_) => ErrorKind::Client,
            SyncError::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            SyncError::IoError(_) | SyncError::StorageError(_) => ErrorKind::Storage,
            SyncError::ShutdownError(_) | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a whole check cycle failing with this error should back off and retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::Server | ErrorKind::Storage
        )
    }

    /// Only configuration and authentication errors may stop the scheduler
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration | ErrorKind::Auth)
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => exit_code::CONFIGURATION,
            ErrorKind::Auth => exit_code::AUTH,
            _ => exit_code::FAILURE,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest embeds the URL in its messages; drop it so query strings stay out of logs
        let err = err.without_url();

        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), &err.to_string());
        }
        if err.is_builder() {
            SyncError::ConfigError(format!("invalid request: {err}"))
        } else if err.is_decode() {
            SyncError::ServerError(format!("malformed response: {err}"))
        } else {
            // timeouts, refused/reset connections and truncated bodies
            SyncError::TransientNetworkError(err.to_string())
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy
pub fn classify_status(status: u16, message: &str) -> SyncError {
    match status {
        401 | 403 => SyncError::AuthError(format!("{status}: {message}")),
        408 | 429 => SyncError::TransientNetworkError(format!("{status}: {message}")),
        400..=499 => SyncError::ClientError(format!("{status}: {message}")),
        _ => SyncError::ServerError(format!("{status}: {message}")),
    }
}
