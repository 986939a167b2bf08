//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the settings that identify a run: the
    /// snapshot and where rows land. Tuning knobs, credentials and the kind
    /// selection are excluded; a resume keeps the kinds the run started with.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.snapshot_root.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.target.host.as_bytes());
        hasher.update(self.target.port.to_be_bytes());
        hasher.update(self.target.database.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.target.schema.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
