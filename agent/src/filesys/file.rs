//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::SyncError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, SyncError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file contents as bytes
    pub async fn read_bytes(&self) -> Result<Vec<u8>, SyncError> {
        Ok(fs::read(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write JSON to file, atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), SyncError> {
        let mut contents = serde_json::to_vec_pretty(value)?;
        contents.push(b'\n');
        self.write_atomic(&contents).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), SyncError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Set Unix permission bits. A no-op on non-Unix platforms.
    pub async fn set_mode(&self, mode: u32) -> Result<(), SyncError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    /// Atomic write using a temporary sibling file.
    ///
    /// Readers observe either the previous contents or the new contents, never a
    /// partial write. `mode` is applied to the temporary file before the rename so
    /// the destination never exists with looser permissions.
    pub async fn write_atomic_with_mode(
        &self,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), SyncError> {
        let parent = self.parent_dir();
        fs::create_dir_all(&parent).await?;

        let temp = File::new(parent.join(format!(
            ".{}.{}.tmp",
            self.file_name(),
            uuid::Uuid::new_v4().simple()
        )));

        let result = async {
            let mut file = fs::File::create(temp.path()).await?;
            if let Some(mode) = mode {
                temp.set_mode(mode).await?;
            }
            file.write_all(contents).await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(temp.path(), &self.path).await?;
            sync_dir(&parent).await
        }
        .await;

        if result.is_err() {
            let _ = temp.delete().await;
        }
        result
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), SyncError> {
        self.write_atomic_with_mode(contents, None).await
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }
}

/// Flush a directory entry so a completed rename survives power loss
pub async fn sync_dir(dir: &Path) -> Result<(), SyncError> {
    #[cfg(unix)]
    {
        let dir = fs::File::open(dir).await?;
        dir.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
