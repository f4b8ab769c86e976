//! One-shot operations: check now and list the manifest

use tracing::info;

use crate::app::options::AppOptions;
use crate::app::state::{connect, AppState};
use crate::errors::SyncError;
use crate::http::manifest::ManifestSource;
use crate::models::manifest::Manifest;
use crate::server::client::request_check;
use crate::sync::fsm::SchedulerEvent;
use crate::sync::state::SyncStateStore;
use crate::sync::syncer::CycleReport;

/// Check for updates once.
///
/// A running daemon is asked to do it so the two never download concurrently;
/// otherwise the check runs in this process under the instance lock.
pub async fn check_now(options: &AppOptions, only: Option<&str>) -> Result<CycleReport, SyncError> {
    if options.enable_control_server {
        if let Some(reply) = request_check(&options.server, only, options.check_timeout()).await? {
            info!("Check served by the running daemon");
            return reply.map_err(|e| e.into_error());
        }
    }

    let app_state = AppState::init(options).await?;
    let mut syncer = app_state.syncer(options);
    let mut fsm = app_state.fsm(options);
    let mut state = app_state.state_store.load().await?;

    syncer
        .run_cycle(&mut fsm, SchedulerEvent::CheckRequested, &mut state, only)
        .await
}

/// Fetch the manifest without downloading anything
pub async fn list_manifest(options: &AppOptions) -> Result<Manifest, SyncError> {
    let client = connect(options).await?;
    let identity = client.identity().clone();
    client.fetch_manifest(&identity).await
}
