//! Download & integrity verification with atomic promotion

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::diagnostics::available_space;
use crate::errors::{ErrorKind, SyncError};
use crate::filesys::dir::PART_SUFFIX;
use crate::filesys::file::{sync_dir, File};
use crate::http::manifest::ManifestSource;
use crate::models::manifest::ManifestEntry;

/// Mode given to promoted scripts
pub const EXECUTABLE_MODE: u32 = 0o755;

/// One file to bring up to date in this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub entry: ManifestEntry,
    pub destination: PathBuf,
}

impl DownloadJob {
    pub fn new(entry: ManifestEntry, download_dir: &Path) -> Self {
        let destination = download_dir.join(&entry.file_name);
        Self { entry, destination }
    }

    pub fn file_name(&self) -> &str {
        &self.entry.file_name
    }
}

/// A verified file now visible at its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub file_name: String,
    pub version: String,
    pub bytes: u64,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
#[error("{file_name}: {source}")]
pub struct DownloadFailed {
    pub file_name: String,
    #[source]
    pub source: SyncError,
}

impl DownloadFailed {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Whether a promoted file gets the executable bit
pub fn is_executable_name(file_name: &str) -> bool {
    file_name.ends_with(".sh") || file_name.ends_with(".py")
}

/// A fully written and verified temporary file awaiting promotion.
///
/// Dropping it without calling [`StagedFile::promote`] removes the temporary file.
#[derive(Debug)]
pub struct StagedFile {
    temp_path: PathBuf,
    destination: PathBuf,
    file_name: String,
    version: String,
    bytes: u64,
    promoted: bool,
}

impl StagedFile {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Atomically rename into place
    pub async fn promote(mut self) -> Result<Applied, SyncError> {
        if is_executable_name(&self.file_name) {
            File::new(&self.temp_path).set_mode(EXECUTABLE_MODE).await?;
        }

        tokio::fs::rename(&self.temp_path, &self.destination).await?;
        self.promoted = true;

        if let Some(parent) = self.destination.parent() {
            if let Err(e) = sync_dir(parent).await {
                warn!("Unable to sync directory {:?}: {}", parent, e);
            }
        }

        Ok(Applied {
            file_name: self.file_name.clone(),
            version: self.version.clone(),
            bytes: self.bytes,
            path: self.destination.clone(),
        })
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Discarded {:?}", self.temp_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Unable to remove temporary file {:?}: {}", self.temp_path, e),
        }
    }
}

/// Streams manifest entries to disk and promotes them once verified
pub struct Downloader {
    source: Arc<dyn ManifestSource>,
    file_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    check_free_space: bool,
}

impl Downloader {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self {
            source,
            file_locks: Mutex::new(HashMap::new()),
            check_free_space: true,
        }
    }

    pub fn with_free_space_check(mut self, enabled: bool) -> Self {
        self.check_free_space = enabled;
        self
    }

    /// Download, verify and promote one file.
    ///
    /// At most one job per `file_name` runs at a time.
    pub async fn apply(&self, job: DownloadJob) -> Result<Applied, DownloadFailed> {
        let lock = self.file_lock(job.file_name()).await;
        let _guard = lock.lock().await;

        let result = match self.stage(&job).await {
            Ok(staged) => staged.promote().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(applied) => {
                info!(
                    "Applied {} ({} bytes, version {})",
                    applied.file_name,
                    applied.bytes,
                    short_version(&applied.version)
                );
                Ok(applied)
            }
            Err(source) => Err(DownloadFailed {
                file_name: job.entry.file_name,
                source,
            }),
        }
    }

    /// Stream the body into a temporary file beside the destination and verify it
    pub async fn stage(&self, job: &DownloadJob) -> Result<StagedFile, SyncError> {
        let entry = &job.entry;
        let dir = job.destination.parent().ok_or_else(|| {
            SyncError::StorageError(format!("{:?} has no parent directory", job.destination))
        })?;
        tokio::fs::create_dir_all(dir).await?;

        if self.check_free_space {
            self.ensure_free_space(dir, entry).await?;
        }

        let mut body = self.source.download(entry).await?;
        if let Some(announced) = body.content_length {
            if announced != entry.size {
                return Err(SyncError::IntegrityMismatch(format!(
                    "server announced {} bytes but the manifest declares {}",
                    announced, entry.size
                )));
            }
        }

        let mut staged = StagedFile {
            temp_path: dir.join(format!(
                ".{}.{}{}",
                entry.file_name,
                uuid::Uuid::new_v4().simple(),
                PART_SUFFIX
            )),
            destination: job.destination.clone(),
            file_name: entry.file_name.clone(),
            version: entry.hash.clone(),
            bytes: 0,
            promoted: false,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.temp_path)
            .await?;
        debug!("Streaming {} to {:?}", entry.file_name, staged.temp_path);

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        while let Some(chunk) = body.next_chunk().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > entry.size {
                return Err(SyncError::IntegrityMismatch(format!(
                    "body exceeds the declared {} bytes",
                    entry.size
                )));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written != entry.size {
            return Err(SyncError::IntegrityMismatch(format!(
                "received {} bytes, expected {}",
                written, entry.size
            )));
        }
        let digest = hex::encode(hasher.finalize());
        if digest != entry.hash {
            return Err(SyncError::IntegrityMismatch(format!(
                "sha256 {} does not match declared {}",
                digest, entry.hash
            )));
        }

        staged.bytes = written;
        Ok(staged)
    }

    async fn ensure_free_space(&self, dir: &Path, entry: &ManifestEntry) -> Result<(), SyncError> {
        let dir = dir.to_path_buf();
        let free = tokio::task::spawn_blocking(move || available_space(&dir))
            .await
            .map_err(|e| SyncError::Internal(format!("disk space lookup failed: {}", e)))?;

        match free {
            Some(free) if free < entry.size => Err(SyncError::StorageError(format!(
                "{} needs {} bytes but only {} are free",
                entry.file_name, entry.size, free
            ))),
            Some(_) => Ok(()),
            None => {
                debug!("Free space unknown for {}, downloading anyway", entry.file_name);
                Ok(())
            }
        }
    }

    async fn file_lock(&self, file_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        locks.entry(file_name.to_string()).or_default().clone()
    }
}

fn short_version(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}
