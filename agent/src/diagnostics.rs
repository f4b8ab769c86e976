//! Host diagnostics and disk space lookup

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::authn::identity::IdentityResolver;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::sync::state::LocalSyncState;
use crate::utils::{version_info, VersionInfo};

/// Snapshot printed by `--diagnostic`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub version: VersionInfo,
    pub hostname: String,
    pub os: String,
    pub uptime_secs: u64,

    /// Resolved device identity, or why it could not be resolved
    pub device_id: Result<String, String>,

    pub base_dir: PathBuf,
    pub download_dir: PathBuf,
    pub server_url: String,
    pub check_interval_secs: u64,
    pub credential_present: bool,

    /// Entries in the persisted sync state, `None` if unreadable
    pub tracked_files: Option<usize>,

    /// Free bytes on the filesystem holding the download directory
    pub download_dir_free_bytes: Option<u64>,
}

/// Free bytes on the filesystem that holds `path`.
///
/// `path` does not have to exist yet; its nearest existing ancestor is used.
pub fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    let resolved = existing.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Gather everything an operator needs to debug a device
pub async fn collect_diagnostics(layout: &StorageLayout, settings: &Settings) -> DiagnosticReport {
    // no pinning here: diagnostics must not write anything
    let resolver = IdentityResolver::for_host(settings.device_id.clone(), layout.device_id_file())
        .without_pin();
    let device_id = resolver
        .resolve()
        .await
        .map(|id| id.to_string())
        .map_err(|e| e.to_string());

    let download_dir = settings.download_dir(layout);
    let state_file = layout.state_file();
    let tracked_files = if state_file.exists().await {
        state_file
            .read_json::<LocalSyncState>()
            .await
            .ok()
            .map(|state| state.len())
    } else {
        Some(0)
    };

    DiagnosticReport {
        version: version_info(),
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        os: System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
        uptime_secs: System::uptime(),
        device_id,
        base_dir: layout.base_dir.clone(),
        download_dir_free_bytes: available_space(&download_dir),
        download_dir,
        server_url: settings.server_url.clone(),
        check_interval_secs: settings.check_interval_secs,
        credential_present: layout.credential_file().exists().await,
        tracked_files,
    }
}
