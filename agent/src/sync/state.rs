//! Persisted record of which file versions have been applied

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::SyncError;
use crate::filesys::file::File;
use crate::models::manifest::ManifestEntry;
use crate::utils::unix_now;

/// `file_name -> version` of every fully verified and promoted file.
///
/// Ordered so the persisted form is byte-stable for an unchanged state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalSyncState {
    files: BTreeMap<String, String>,
}

impl LocalSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, file_name: &str) -> Option<&str> {
        self.files.get(file_name).map(String::as_str)
    }

    /// Whether `entry` is already applied at its current version
    pub fn is_current(&self, entry: &ManifestEntry) -> bool {
        self.version(&entry.file_name) == Some(entry.hash.as_str())
    }

    /// Record an applied version. Only call after promotion.
    pub fn record(&mut self, file_name: impl Into<String>, version: impl Into<String>) {
        self.files.insert(file_name.into(), version.into());
    }

    pub fn forget(&mut self, file_name: &str) -> Option<String> {
        self.files.remove(file_name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Durable storage for [`LocalSyncState`]
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load(&self) -> Result<LocalSyncState, SyncError>;

    async fn save(&self, state: &LocalSyncState) -> Result<(), SyncError>;
}

/// JSON file store, written atomically
pub struct JsonStateStore {
    file: File,
}

impl JsonStateStore {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

#[async_trait]
impl SyncStateStore for JsonStateStore {
    async fn load(&self) -> Result<LocalSyncState, SyncError> {
        if !self.file.exists().await {
            return Ok(LocalSyncState::new());
        }

        match self.file.read_json::<LocalSyncState>().await {
            Ok(state) => Ok(state),
            Err(SyncError::JsonError(e)) => {
                // an unreadable record only costs re-downloads; keep it for inspection
                let aside = self
                    .file
                    .path()
                    .with_extension(format!("json.corrupt-{}", unix_now()));
                error!(
                    "Sync state {:?} is corrupt ({}), moving it to {:?} and starting empty",
                    self.file.path(),
                    e,
                    aside
                );
                if let Err(e) = tokio::fs::rename(self.file.path(), &aside).await {
                    warn!("Unable to move corrupt sync state aside: {}", e);
                }
                Ok(LocalSyncState::new())
            }
            Err(e) => Err(SyncError::StorageError(format!(
                "Unable to read sync state {:?}: {}",
                self.file.path(),
                e
            ))),
        }
    }

    async fn save(&self, state: &LocalSyncState) -> Result<(), SyncError> {
        self.file.write_json(state).await.map_err(|e| {
            SyncError::StorageError(format!(
                "Unable to persist sync state {:?}: {}",
                self.file.path(),
                e
            ))
        })
    }
}
