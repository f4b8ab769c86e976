//! Post-apply hooks

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::SyncError;

/// Scripts that may be executed right after they are applied
pub const INSTALL_SCRIPTS: &[&str] = &["install.sh", "setup.sh"];

#[derive(Debug, Clone)]
pub struct HookOptions {
    /// Execute a freshly applied install script
    pub run_install_scripts: bool,

    pub script_timeout: Duration,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            run_install_scripts: false,
            script_timeout: Duration::from_secs(300),
        }
    }
}

impl HookOptions {
    pub fn wants(&self, file_name: &str) -> bool {
        self.run_install_scripts && INSTALL_SCRIPTS.contains(&file_name)
    }
}

/// Run `script` with bash from its own directory, killing it on timeout
pub async fn run_install_script(script: &Path, timeout: Duration) -> Result<(), SyncError> {
    let dir = script.parent().unwrap_or_else(|| Path::new("."));
    info!("Running install script {:?}", script);

    let child = Command::new("bash")
        .arg(script)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| {
            SyncError::Internal(format!(
                "install script {:?} timed out after {}s",
                script,
                timeout.as_secs()
            ))
        })?
        .map_err(|e| SyncError::Internal(format!("Failed to run install script: {}", e)))?;

    debug!(
        "Install script output: {}",
        String::from_utf8_lossy(&output.stdout).trim()
    );
    if !output.status.success() {
        return Err(SyncError::Internal(format!(
            "install script {:?} exited with {}: {}",
            script,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    info!("Install script {:?} completed", script);
    Ok(())
}
