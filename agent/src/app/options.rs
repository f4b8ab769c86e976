//! Application configuration options

use std::time::Duration;

use crate::http::client::HttpOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::sync::hooks::HookOptions;
use crate::sync::syncer::SyncOptions;
use crate::utils::CooldownOptions;
use crate::workers::scheduler;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Where everything is persisted
    pub layout: StorageLayout,

    /// Base URL of the update server
    pub server_url: String,

    /// Device id override
    pub device_id: Option<String>,

    /// Timeouts for server requests
    pub http: HttpOptions,

    /// Download and pruning behavior
    pub sync: SyncOptions,

    /// Scheduler worker options
    pub scheduler: scheduler::Options,

    /// Backoff after failed checks
    pub cooldown: CooldownOptions,

    /// Enable the local control server
    pub enable_control_server: bool,

    /// Control server configuration
    pub server: ServerOptions,
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let download_dir = settings.download_dir(&layout);
        Self {
            lifecycle: LifecycleOptions::default(),
            server_url: settings.server_url.clone(),
            device_id: settings.device_id.clone(),
            http: HttpOptions {
                connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
                request_timeout: Duration::from_secs(settings.request_timeout_secs),
                download_timeout: Duration::from_secs(settings.download_timeout_secs),
            },
            sync: SyncOptions {
                download_dir,
                max_parallel_downloads: settings.max_parallel_downloads,
                prune_removed: settings.prune_removed,
                hooks: HookOptions {
                    run_install_scripts: settings.run_install_scripts,
                    script_timeout: Duration::from_secs(settings.install_script_timeout_secs),
                },
            },
            scheduler: scheduler::Options {
                interval: settings.check_interval(),
                initial_delay: Duration::from_secs(settings.initial_delay_secs),
            },
            cooldown: settings.cooldown_options(),
            enable_control_server: settings.control_server.enabled,
            server: ServerOptions {
                host: settings.control_server.host.clone(),
                port: settings.control_server.port,
            },
            layout,
        }
    }

    /// Upper bound for one manual check: every download may run back to back
    pub fn check_timeout(&self) -> Duration {
        self.http.request_timeout + self.http.download_timeout * 4 + self.sync.hooks.script_timeout
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl ServerOptions {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8731,
        }
    }
}
