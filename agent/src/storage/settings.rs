//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;
use crate::utils::CooldownOptions;

/// Environment variable overriding `server_url`
pub const SERVER_URL_ENV_VAR: &str = "PISYNC_SERVER_URL";

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for daily-rotated log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// Base URL of the update server
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Explicit device identifier, overriding hardware detection
    #[serde(default)]
    pub device_id: Option<String>,

    /// Interval between scheduled checks in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Delay before the first scheduled check in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Where synced files are written; `<base_dir>/files` when unset
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    /// Upper bound on concurrent downloads within one check
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,

    /// Timeout for manifest requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for establishing a connection in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for a whole file download in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Backoff applied after a failed check
    #[serde(default)]
    pub backoff: BackoffSettings,

    /// Delete local files the server no longer lists
    #[serde(default)]
    pub prune_removed: bool,

    /// Execute a freshly applied `install.sh` / `setup.sh`
    #[serde(default)]
    pub run_install_scripts: bool,

    /// Timeout for install scripts in seconds
    #[serde(default = "default_install_script_timeout")]
    pub install_script_timeout_secs: u64,

    /// Local control server
    #[serde(default)]
    pub control_server: ControlServerSettings,
}

fn default_true() -> bool {
    true
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_check_interval() -> u64 {
    3600
}

fn default_initial_delay() -> u64 {
    5
}

fn default_max_parallel_downloads() -> usize {
    2
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    600
}

fn default_install_script_timeout() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json_logs: false,
            server_url: default_server_url(),
            device_id: None,
            check_interval_secs: default_check_interval(),
            initial_delay_secs: default_initial_delay(),
            download_dir: None,
            max_parallel_downloads: default_max_parallel_downloads(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            download_timeout_secs: default_download_timeout(),
            backoff: BackoffSettings::default(),
            prune_removed: false,
            run_install_scripts: false,
            install_script_timeout_secs: default_install_script_timeout(),
            control_server: ControlServerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist yet
    pub async fn load(file: &File) -> Result<Self, SyncError> {
        let mut settings = if file.exists().await {
            file.read_json::<Settings>().await.map_err(|e| {
                SyncError::ConfigError(format!(
                    "Unable to read settings file {:?}: {}",
                    file.path(),
                    e
                ))
            })?
        } else {
            Settings::default()
        };

        if let Ok(url) = std::env::var(SERVER_URL_ENV_VAR) {
            if !url.trim().is_empty() {
                settings.server_url = url.trim().to_string();
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Persist settings
    pub async fn save(&self, file: &File) -> Result<(), SyncError> {
        file.write_json(self).await
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        let url = url::Url::parse(&self.server_url).map_err(|e| {
            SyncError::ConfigError(format!("Invalid server_url {:?}: {}", self.server_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::ConfigError(format!(
                "server_url must use http or https, got {}",
                url.scheme()
            )));
        }
        if self.check_interval_secs == 0 {
            return Err(SyncError::ConfigError(
                "check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_parallel_downloads == 0 {
            return Err(SyncError::ConfigError(
                "max_parallel_downloads must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_secs == 0
            || self.connect_timeout_secs == 0
            || self.download_timeout_secs == 0
        {
            return Err(SyncError::ConfigError(
                "network timeouts must be greater than zero".to_string(),
            ));
        }
        if self.backoff.base_delay_secs == 0
            || self.backoff.max_delay_secs < self.backoff.base_delay_secs
            || self.backoff.multiplier < 1.0
        {
            return Err(SyncError::ConfigError(
                "backoff requires 0 < base_delay_secs <= max_delay_secs and multiplier >= 1"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn download_dir(&self, layout: &StorageLayout) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| layout.default_download_dir().path().to_path_buf())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cooldown_options(&self) -> CooldownOptions {
        CooldownOptions {
            base_delay: Duration::from_secs(self.backoff.base_delay_secs),
            max_delay: Duration::from_secs(self.backoff.max_delay_secs),
            multiplier: self.backoff.multiplier,
        }
    }
}

/// Backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_base")]
    pub base_delay_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub max_delay_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    900
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_secs: default_backoff_base(),
            max_delay_secs: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// Local control server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_control_host")]
    pub host: String,

    #[serde(default = "default_control_port")]
    pub port: u16,
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    8731
}

impl Default for ControlServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_control_host(),
            port: default_control_port(),
        }
    }
}
