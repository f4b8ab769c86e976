//! Device identity resolution
//!
//! The identity scopes every manifest request, so it must be stable across
//! restarts. Sources are tried in order; there is deliberately no random
//! fallback.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::filesys::file::File;

const MAX_IDENTITY_LEN: usize = 128;

/// Immutable per-device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self, SyncError> {
        let id: String = id.into();
        let id = id.trim();
        if id.is_empty() {
            return Err(SyncError::ConfigError("device id is empty".to_string()));
        }
        if id.len() > MAX_IDENTITY_LEN {
            return Err(SyncError::ConfigError(format!(
                "device id exceeds {} characters",
                MAX_IDENTITY_LEN
            )));
        }
        if !id.chars().all(|c| c.is_ascii_graphic()) {
            return Err(SyncError::ConfigError(format!(
                "device id {:?} contains whitespace or non-printable characters",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One place an identity may come from
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &'static str;

    /// `Ok(None)` when this source has nothing to offer on this host
    async fn read(&self) -> Result<Option<String>, SyncError>;

    /// Hardware-derived identities are pinned after resolution
    fn is_hardware(&self) -> bool {
        false
    }
}

/// Explicit `device_id` from settings
pub struct ConfiguredId(pub Option<String>);

#[async_trait]
impl IdentitySource for ConfiguredId {
    fn name(&self) -> &'static str {
        "settings"
    }

    async fn read(&self) -> Result<Option<String>, SyncError> {
        Ok(self.0.clone())
    }
}

/// Identifier pinned on a previous run
pub struct PinnedId(pub File);

#[async_trait]
impl IdentitySource for PinnedId {
    fn name(&self) -> &'static str {
        "device_id file"
    }

    async fn read(&self) -> Result<Option<String>, SyncError> {
        if !self.0.exists().await {
            return Ok(None);
        }
        let id = self.0.read_string().await?;
        Ok(Some(id.trim().to_string()).filter(|id| !id.is_empty()))
    }
}

/// Raspberry Pi SoC serial from `/proc/cpuinfo`
pub struct CpuInfoSerial {
    pub path: PathBuf,
}

impl Default for CpuInfoSerial {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/cpuinfo"),
        }
    }
}

#[async_trait]
impl IdentitySource for CpuInfoSerial {
    fn name(&self) -> &'static str {
        "cpuinfo serial"
    }

    fn is_hardware(&self) -> bool {
        true
    }

    async fn read(&self) -> Result<Option<String>, SyncError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_cpuinfo_serial(&contents))
    }
}

fn parse_cpuinfo_serial(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter(|line| line.starts_with("Serial"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        // some boards report an all-zero serial
        .find(|serial| !serial.is_empty() && !serial.chars().all(|c| c == '0'))
}

/// Primary NIC hardware address, as `mac-<hex>`
pub struct MacAddress {
    pub path: PathBuf,
}

impl Default for MacAddress {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/sys/class/net/eth0/address"),
        }
    }
}

#[async_trait]
impl IdentitySource for MacAddress {
    fn name(&self) -> &'static str {
        "mac address"
    }

    fn is_hardware(&self) -> bool {
        true
    }

    async fn read(&self) -> Result<Option<String>, SyncError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mac: String = contents
            .trim()
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_lowercase();
        if mac.is_empty() || mac.chars().all(|c| c == '0') {
            return Ok(None);
        }
        Ok(Some(format!("mac-{}", mac)))
    }
}

/// Resolves the identity once at startup
pub struct IdentityResolver {
    sources: Vec<Box<dyn IdentitySource>>,
    pin: Option<File>,
}

impl IdentityResolver {
    pub fn new(sources: Vec<Box<dyn IdentitySource>>) -> Self {
        Self { sources, pin: None }
    }

    /// Resolver for this host: settings override, pinned id, cpuinfo serial, MAC.
    /// A hardware-derived id is pinned to `pin_file` so later runs stay stable.
    pub fn for_host(configured: Option<String>, pin_file: File) -> Self {
        Self {
            sources: vec![
                Box::new(ConfiguredId(configured)),
                Box::new(PinnedId(pin_file.clone())),
                Box::new(CpuInfoSerial::default()),
                Box::new(MacAddress::default()),
            ],
            pin: Some(pin_file),
        }
    }

    /// Resolve without writing the pin file
    pub fn without_pin(mut self) -> Self {
        self.pin = None;
        self
    }

    pub async fn resolve(&self) -> Result<DeviceIdentity, SyncError> {
        for source in &self.sources {
            let raw = match source.read().await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!("Identity source '{}' unavailable", source.name());
                    continue;
                }
                Err(e) => {
                    warn!("Identity source '{}' failed: {}", source.name(), e);
                    continue;
                }
            };

            let identity = DeviceIdentity::new(raw).map_err(|e| {
                SyncError::ConfigError(format!("identity from {}: {}", source.name(), e))
            })?;
            info!("Device identity {} resolved from {}", identity, source.name());

            if source.is_hardware() {
                self.pin_identity(&identity).await;
            }
            return Ok(identity);
        }

        Err(SyncError::ConfigError(
            "Unable to determine device identity: no serial number, MAC address or configured device_id"
                .to_string(),
        ))
    }

    async fn pin_identity(&self, identity: &DeviceIdentity) {
        let Some(pin) = &self.pin else {
            return;
        };
        if let Err(e) = pin.write_atomic(identity.as_str().as_bytes()).await {
            warn!("Unable to pin device identity to {:?}: {}", pin.path(), e);
        }
    }
}
