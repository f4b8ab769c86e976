//! Device setup: stores the credential and settings

use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::app::cli::CliArgs;
use crate::authn::credential::{Credential, CredentialStore, KEY_ENV_VAR};
use crate::authn::identity::IdentityResolver;
use crate::errors::SyncError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::version_info;

/// Run the setup process
pub async fn setup(layout: &StorageLayout, args: &CliArgs) -> Result<(), SyncError> {
    println!("{}", "pisync setup".bold());
    println!("============");
    println!();

    println!("Setting up storage at: {:?}", layout.base_dir);
    layout.setup().await?;

    // Settings: existing file plus command line overrides
    let settings_file = layout.settings_file();
    let mut settings = Settings::load(&settings_file).await?;
    args.apply_overrides(&mut settings)?;
    settings.save(&settings_file).await?;
    println!("Server URL: {}", settings.server_url);
    println!("Check interval: {}s", settings.check_interval_secs);
    println!(
        "Download directory: {:?}",
        settings.download_dir(layout)
    );
    println!("Settings saved to: {:?}", settings_file.path());
    println!();

    // Credential
    let key = match &args.key {
        Some(key) => key.clone(),
        None => match std::env::var(KEY_ENV_VAR) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => prompt_for_key().await?,
        },
    };
    let credential = Credential::new(key)?;
    let credential_file = layout.credential_file();
    CredentialStore::new(credential_file.clone())
        .save(&credential)
        .await?;
    println!("Credential saved to: {:?} (mode 600)", credential_file.path());

    // Identity, pinned for later runs
    let resolver = IdentityResolver::for_host(settings.device_id.clone(), layout.device_id_file());
    match resolver.resolve().await {
        Ok(identity) => println!("Device ID: {}", identity),
        Err(e) => {
            warn!("Device identity unavailable: {}", e);
            println!(
                "{} No device identity found; set `device_id` in the settings file",
                "[WARNING]".yellow().bold()
            );
        }
    }

    let version = version_info();
    println!();
    println!("pisync version: {} ({})", version.version, version.git_hash);
    println!();
    println!("{} pisync is set up", "[SUCCESS]".green().bold());
    println!("Start the service with: pisync --serve");
    info!("Setup complete");
    Ok(())
}

async fn prompt_for_key() -> Result<String, SyncError> {
    println!("Enter the device key (input is not stored anywhere else):");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    let key = line.trim().to_string();
    if key.is_empty() {
        return Err(SyncError::ConfigError(format!(
            "No key given. Pass --key=<key> or set {}",
            KEY_ENV_VAR
        )));
    }
    Ok(key)
}
