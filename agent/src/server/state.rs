//! Server state

use std::time::Duration;

use tokio::sync::mpsc;

use crate::workers::scheduler::{CheckRequest, StatusHandle};

/// Server state shared across handlers
pub struct ServerState {
    pub device_id: String,
    pub status: StatusHandle,
    pub check_tx: mpsc::Sender<CheckRequest>,

    /// Longest a `POST /check` waits for its cycle
    pub check_timeout: Duration,
}

impl ServerState {
    pub fn new(
        device_id: impl Into<String>,
        status: StatusHandle,
        check_tx: mpsc::Sender<CheckRequest>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            check_tx,
            check_timeout,
        }
    }
}
