//! Host-declared update policy.
//!
//! Loaded once at startup from host configuration; the external caller
//! may merge partial overrides at runtime.

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Static update policy declared by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Fetch updates automatically after startup/bootstrap.
    #[serde(default = "default_true")]
    pub auto_download: bool,
    /// Install staged updates automatically according to the manifest's
    /// update timing.
    #[serde(default = "default_true")]
    pub auto_install: bool,
    /// URL of the remote release manifest.
    pub config_url: String,
}

fn default_true() -> bool {
    true
}

impl PolicyConfig {
    /// Parse policy config from a JSON document supplied by the host.
    pub fn from_json(raw: &str) -> Result<Self, UpdateError> {
        let config: PolicyConfig =
            serde_json::from_str(raw).map_err(|e| UpdateError::ConfigInvalid {
                reason: e.to_string(),
            })?;
        if config.config_url.trim().is_empty() {
            return Err(UpdateError::ConfigInvalid {
                reason: "config_url must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    /// Merge runtime overrides supplied by the external caller.
    /// Unset fields keep their current value.
    pub fn merge(&mut self, overrides: &PolicyOverrides) {
        if let Some(auto_download) = overrides.auto_download {
            self.auto_download = auto_download;
        }
        if let Some(auto_install) = overrides.auto_install {
            self.auto_install = auto_install;
        }
        if let Some(config_url) = &overrides.config_url {
            self.config_url = config_url.clone();
        }
    }
}

/// Partial policy overrides, merged field-wise into [`PolicyConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub auto_download: Option<bool>,
    #[serde(default)]
    pub auto_install: Option<bool>,
    #[serde(default)]
    pub config_url: Option<String>,
}
