//! Manifest model: the files the server wants present on this device

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::SyncError;

/// One file the server currently assigns to the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Destination name inside the download directory
    pub file_name: String,

    /// SHA-256 of the body, lowercase hex; doubles as the version
    pub hash: String,

    /// Body size in bytes
    pub size: u64,

    /// Absolute URL or path relative to the server URL
    pub uri: String,
}

/// Validated manifest snapshot, in server order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Validate raw server entries.
    ///
    /// Entries with unsafe names or malformed hashes are dropped with a warning.
    /// A repeated `file_name` means the snapshot is inconsistent and the whole
    /// manifest is rejected.
    pub fn from_entries(raw: Vec<ManifestEntry>) -> Result<Self, SyncError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(raw.len());

        for mut entry in raw {
            if let Err(reason) = validate_file_name(&entry.file_name) {
                warn!(
                    file_name = %entry.file_name.escape_debug(),
                    "Skipping manifest entry: {}", reason
                );
                continue;
            }
            match normalize_hash(&entry.hash) {
                Some(hash) => entry.hash = hash,
                None => {
                    warn!(
                        file_name = %entry.file_name,
                        "Skipping manifest entry: hash is not SHA-256 hex"
                    );
                    continue;
                }
            }
            if entry.uri.trim().is_empty() {
                warn!(file_name = %entry.file_name, "Skipping manifest entry: empty uri");
                continue;
            }
            if !seen.insert(entry.file_name.clone()) {
                return Err(SyncError::ServerError(format!(
                    "manifest lists {} more than once",
                    entry.file_name
                )));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    /// Keep only the named entry
    pub fn retain_file(&mut self, file_name: &str) {
        self.entries.retain(|e| e.file_name == file_name);
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.get(file_name).is_some()
    }
}

/// A file name must be a single, visible path component
pub fn validate_file_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty file name");
    }
    if name.len() > 255 {
        return Err("file name too long");
    }
    if name.starts_with('.') {
        return Err("hidden or relative file name");
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("file name contains a path separator or NUL");
    }
    if name.chars().any(char::is_control) {
        return Err("file name contains control characters");
    }
    Ok(())
}

/// Lowercase SHA-256 hex, accepting an optional `sha256:` prefix
pub fn normalize_hash(hash: &str) -> Option<String> {
    let hash = hash.trim();
    let hash = hash
        .strip_prefix("sha256:")
        .or_else(|| hash.strip_prefix("SHA256:"))
        .unwrap_or(hash);
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_ascii_lowercase())
    } else {
        None
    }
}
