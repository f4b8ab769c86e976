//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::errors::SyncError;
use crate::filesys::file::File;

/// Suffix of in-flight downloads
pub const PART_SUFFIX: &str = ".part";

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), SyncError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// List regular files in the directory
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, SyncError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Remove leftover `.part` files from downloads interrupted by a crash.
    ///
    /// Returns the number of files removed. A missing directory is not an error.
    pub async fn sweep_partial_downloads(&self) -> Result<usize, SyncError> {
        if !self.exists().await {
            return Ok(0);
        }

        let mut removed = 0;
        for path in self.list_files().await? {
            let is_partial = path
                .file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with('.') && n.ends_with(PART_SUFFIX)
                })
                .unwrap_or(false);
            if !is_partial {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed stale partial download {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Unable to remove stale partial download {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }
}
