//! Application state management

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::authn::credential::CredentialStore;
use crate::authn::identity::{DeviceIdentity, IdentityResolver};
use crate::errors::SyncError;
use crate::filesys::dir::Dir;
use crate::http::client::HttpClient;
use crate::storage::lock::{InstanceLock, LockAttempt};
use crate::sync::fsm::SchedulerFsm;
use crate::sync::state::JsonStateStore;
use crate::sync::syncer::Syncer;
use crate::workers::scheduler::{SchedulerStatus, StatusHandle};

/// Main application state
pub struct AppState {
    /// Resolved once at startup, never regenerated during a run
    pub identity: DeviceIdentity,

    /// Signed client for the update server
    pub http_client: Arc<HttpClient>,

    /// Persisted sync state
    pub state_store: Arc<JsonStateStore>,

    /// Scheduler status shared with the control server
    pub status: StatusHandle,

    _lock: InstanceLock,
}

impl AppState {
    /// Take the instance lock, resolve identity and credential, and clean up
    /// after a previous crash
    pub async fn init(options: &AppOptions) -> Result<Self, SyncError> {
        info!("Initializing application state...");
        options.layout.setup().await?;

        let lock_file = options.layout.lock_file();
        let lock = match InstanceLock::try_acquire(lock_file.path())? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::HeldBy(pid) => {
                let owner = pid.map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {}", pid));
                return Err(SyncError::ConfigError(format!(
                    "another pisync instance ({}) is using {:?}",
                    owner, options.layout.base_dir
                )));
            }
        };

        let http_client = Arc::new(connect(options).await?);
        let identity = http_client.identity().clone();

        let download_dir = Dir::new(&options.sync.download_dir);
        download_dir.create().await?;
        match download_dir.sweep_partial_downloads().await {
            Ok(0) => {}
            Ok(swept) => info!("Removed {} interrupted download(s)", swept),
            Err(e) => warn!("Unable to sweep interrupted downloads: {}", e),
        }

        let state_store = Arc::new(JsonStateStore::new(options.layout.state_file()));
        let status = Arc::new(RwLock::new(SchedulerStatus::new(identity.as_str())));

        Ok(Self {
            identity,
            http_client,
            state_store,
            status,
            _lock: lock,
        })
    }

    pub fn syncer(&self, options: &AppOptions) -> Syncer {
        Syncer::new(
            self.identity.clone(),
            self.http_client.clone(),
            self.state_store.clone(),
            options.sync.clone(),
        )
    }

    pub fn fsm(&self, options: &AppOptions) -> SchedulerFsm {
        SchedulerFsm::new(options.cooldown.clone())
    }
}

/// Resolve the identity, load the credential and build the signed client
pub async fn connect(options: &AppOptions) -> Result<HttpClient, SyncError> {
    let identity = IdentityResolver::for_host(
        options.device_id.clone(),
        options.layout.device_id_file(),
    )
    .resolve()
    .await?;
    let credential = CredentialStore::new(options.layout.credential_file())
        .load()
        .await?;
    HttpClient::new(&options.server_url, identity, credential, options.http.clone())
}
