use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::DeviceRegistry;
use crate::result::DEFAULT_REPLY_DELAY_TICKS;

/// Title id of the IOS version booted when nothing else is configured (IOS58).
pub const DEFAULT_TITLE_ID: u64 = 0x0000_0001_0000_003a;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid kernel config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("device name {0:?} must be an absolute path")]
    RelativeDeviceName(String),

    #[error("device {0:?} is listed twice")]
    DuplicateDevice(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub title_id: u64,
    /// Names installed as [`crate::StubDevice`]s at boot.
    pub static_devices: Vec<String>,
    /// Reply delay for OPEN when the device does not choose one.
    pub open_reply_delay_ticks: u64,
    pub want_determinism: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            title_id: DEFAULT_TITLE_ID,
            static_devices: vec!["/dev/sdio/slot1".to_string(), "/dev/usb/oh1".to_string()],
            open_reply_delay_ticks: DEFAULT_REPLY_DELAY_TICKS,
            want_determinism: false,
        }
    }
}

impl KernelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for name in &self.static_devices {
            if !name.starts_with('/') {
                return Err(ConfigError::RelativeDeviceName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateDevice(name.clone()));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> DeviceRegistry {
        DeviceRegistry::with_stubs(self.static_devices.iter().cloned())
    }
}
