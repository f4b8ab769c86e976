//! Shared-secret credential and request signing

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::errors::SyncError;
use crate::filesys::file::File;

/// Environment variable supplying the key when no credential file exists
pub const KEY_ENV_VAR: &str = "PISYNC_KEY";

/// Permission bits of the stored credential
pub const CREDENTIAL_FILE_MODE: u32 = 0o600;

type HmacSha256 = Hmac<Sha256>;

/// The device's shared secret.
///
/// Passed explicitly to the HTTP client. The key is never printed: `Debug`
/// is redacted and there is no `Display`.
#[derive(Clone)]
pub struct Credential {
    key: Arc<SecretString>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl Credential {
    pub fn new(key: impl Into<String>) -> Result<Self, SyncError> {
        let key: String = key.into();
        let key = key.trim();
        if key.is_empty() {
            return Err(SyncError::ConfigError("secret key is empty".to_string()));
        }
        Ok(Self {
            key: Arc::new(SecretString::from(key.to_string())),
        })
    }

    /// Signature for one request: hex HMAC-SHA256 over `"<device_id>:<timestamp>"`
    pub fn sign(&self, device_id: &str, timestamp: u64) -> Result<String, SyncError> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|e| SyncError::Internal(format!("invalid signing key: {e}")))?;
        mac.update(signing_message(device_id, timestamp).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a signature produced by [`Credential::sign`]
    pub fn verify(&self, device_id: &str, timestamp: u64, signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Some(expected) = self
            .sign(device_id, timestamp)
            .ok()
            .and_then(|s| hex::decode(s).ok())
        else {
            return false;
        };
        provided.len() == expected.len() && bool::from(provided.ct_eq(&expected))
    }

    fn expose(&self) -> &str {
        self.key.expose_secret()
    }
}

fn signing_message(device_id: &str, timestamp: u64) -> String {
    format!("{}:{}", device_id, timestamp)
}

/// Loads and stores the credential in its restricted file
pub struct CredentialStore {
    file: File,
}

impl CredentialStore {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Load the stored credential, falling back to `PISYNC_KEY`
    pub async fn load(&self) -> Result<Credential, SyncError> {
        if self.file.exists().await {
            warn_if_readable_by_others(&self.file).await;
            let key = self.file.read_string().await.map_err(|e| {
                SyncError::ConfigError(format!(
                    "Unable to read credential file {:?}: {}",
                    self.file.path(),
                    e
                ))
            })?;
            debug!("Loaded credential from {:?}", self.file.path());
            return Credential::new(key);
        }

        match std::env::var(KEY_ENV_VAR) {
            Ok(key) if !key.trim().is_empty() => {
                debug!("Loaded credential from {}", KEY_ENV_VAR);
                Credential::new(key)
            }
            _ => Err(SyncError::ConfigError(format!(
                "No credential configured. Run `pisync --setup --key=<key>` or set {}",
                KEY_ENV_VAR
            ))),
        }
    }

    /// Persist the credential with owner-only permissions
    pub async fn save(&self, credential: &Credential) -> Result<(), SyncError> {
        let mut contents = credential.expose().as_bytes().to_vec();
        contents.push(b'\n');
        self.file
            .write_atomic_with_mode(&contents, Some(CREDENTIAL_FILE_MODE))
            .await?;
        info!("Credential saved to {:?}", self.file.path());
        Ok(())
    }
}

#[cfg(unix)]
async fn warn_if_readable_by_others(file: &File) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = tokio::fs::metadata(file.path()).await {
        if meta.permissions().mode() & 0o077 != 0 {
            tracing::warn!(
                "Credential file {:?} is accessible by other users; expected mode 600",
                file.path()
            );
        }
    }
}

#[cfg(not(unix))]
async fn warn_if_readable_by_others(_file: &File) {}
