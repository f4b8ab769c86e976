//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::SyncError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Environment variable overriding the base directory
pub const HOME_ENV_VAR: &str = "PISYNC_HOME";

/// Storage layout for the agent
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the credential file path (mode 0600)
    pub fn credential_file(&self) -> File {
        File::new(self.base_dir.join("credential"))
    }

    /// Get the persisted sync state path
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Get the pinned device identity path
    pub fn device_id_file(&self) -> File {
        File::new(self.base_dir.join("device_id"))
    }

    /// Get the instance lock path
    pub fn lock_file(&self) -> File {
        File::new(self.base_dir.join("pisync.lock"))
    }

    /// Default directory that synced files land in
    pub fn default_download_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("files"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), SyncError> {
        Dir::new(&self.base_dir).create().await?;
        self.default_download_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
            return Self::new(home);
        }

        // Use /etc/pisync on Linux, or user home directory on other platforms
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/etc/pisync");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pisync");

        Self::new(base_dir)
    }
}
