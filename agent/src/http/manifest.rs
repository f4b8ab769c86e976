//! Manifest API client

use async_trait::async_trait;
use tracing::{debug, info};

use crate::authn::identity::DeviceIdentity;
use crate::errors::SyncError;
use crate::http::client::{DownloadBody, HttpClient};
use crate::models::manifest::{Manifest, ManifestEntry};

pub const MANIFEST_PATH: &str = "/manifest";

/// Where manifests and file bodies come from
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// One manifest request per check cycle
    async fn fetch_manifest(&self, identity: &DeviceIdentity) -> Result<Manifest, SyncError>;

    /// Start streaming the body behind a manifest entry
    async fn download(&self, entry: &ManifestEntry) -> Result<DownloadBody, SyncError>;
}

#[async_trait]
impl ManifestSource for HttpClient {
    async fn fetch_manifest(&self, identity: &DeviceIdentity) -> Result<Manifest, SyncError> {
        debug!("Fetching manifest for {}", identity);
        let raw: Vec<ManifestEntry> = self
            .get(MANIFEST_PATH, &[("device_id", identity.as_str())])
            .await?;
        let listed = raw.len();
        let manifest = Manifest::from_entries(raw)?;
        info!(
            "Manifest lists {} file(s), {} usable",
            listed,
            manifest.len()
        );
        Ok(manifest)
    }

    async fn download(&self, entry: &ManifestEntry) -> Result<DownloadBody, SyncError> {
        self.download_uri(&entry.uri).await
    }
}
