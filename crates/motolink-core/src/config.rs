//! Engine configuration
//!
//! All settings live in one JSON document with a section per component.
//! Missing fields take their defaults, so `{}` is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::flash::{FlashConfig, BLOCK_HEADER_SIZE};
use crate::protocol::{LinkConfig, LinkError};
use crate::telemetry::TelemetryConfig;

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transport and framing settings
    pub link: LinkConfig,
    /// Parameter read settings
    pub telemetry: TelemetryConfig,
    /// Flash session settings
    pub flash: FlashConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, LinkError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LinkError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String, LinkError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::Config(format!("cannot serialize configuration: {e}")))
    }

    /// Write the config as JSON to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LinkError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)
            .map_err(|e| LinkError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Check every section, and that a flash block fits in one frame
    pub fn validate(&self) -> Result<(), LinkError> {
        self.link.validate()?;
        self.telemetry.validate()?;
        self.flash.validate()?;

        // seq + block index + data + block CRC
        let request = 2 + BLOCK_HEADER_SIZE + self.flash.block_size;
        if request > self.link.max_payload {
            return Err(LinkError::Config(format!(
                "flash block of {} bytes needs a {request}-byte payload, link allows {}",
                self.flash.block_size, self.link.max_payload
            )));
        }
        Ok(())
    }
}
