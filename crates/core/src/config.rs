//! Lifecycle configuration
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Main configuration for the lifecycle binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Secret manager client configuration
    #[serde(default)]
    pub credhub: CredHubConfig,

    /// Process launch configuration
    #[serde(default)]
    pub launch: LaunchSettings,

    /// Staging output configuration
    #[serde(default)]
    pub staging: StagingSettings,
}

/// Secret manager client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredHubConfig {
    /// Request timeout in seconds for the interpolation call
    #[serde(default = "default_credhub_timeout")]
    pub timeout_seconds: u64,

    /// Path of the interpolation endpoint, relative to the CredHub URI
    #[serde(default = "default_interpolate_path")]
    pub interpolate_path: String,
}

fn default_credhub_timeout() -> u64 {
    30
}

fn default_interpolate_path() -> String {
    "/api/v1/interpolate".to_string()
}

impl Default for CredHubConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_credhub_timeout(),
            interpolate_path: default_interpolate_path(),
        }
    }
}

/// Process launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSettings {
    /// Shell used to run the bootstrap script and the start command
    #[serde(default = "default_shell")]
    pub shell: PathBuf,

    /// Source `profile.d` scripts and `.profile` before the start command
    #[serde(default = "default_source_profiles")]
    pub source_profiles: bool,
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

fn default_source_profiles() -> bool {
    true
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            source_profiles: default_source_profiles(),
        }
    }
}

/// Staging output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSettings {
    /// Value of `lifecycle_type` in the staging result
    #[serde(default = "default_lifecycle_type")]
    pub lifecycle_type: String,
}

fn default_lifecycle_type() -> String {
    "buildpack".to_string()
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            lifecycle_type: default_lifecycle_type(),
        }
    }
}

impl LifecycleConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "{}: {}",
                path.as_ref().display(),
                e.message()
            ))
        })
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        // Overrides are UTF-8; anything else is not ours to read
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Apply `LIFECYCLE_*` overrides from the given variables over defaults
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = LifecycleConfig::default();

        for (key, value) in vars {
            let value = value.into();
            match key.as_ref() {
                "LIFECYCLE_CREDHUB_TIMEOUT" => {
                    if let Ok(t) = value.parse() {
                        config.credhub.timeout_seconds = t;
                    }
                }
                "LIFECYCLE_SHELL" if !value.is_empty() => {
                    config.launch.shell = PathBuf::from(value);
                }
                "LIFECYCLE_SOURCE_PROFILES" => {
                    if let Ok(b) = value.parse() {
                        config.launch.source_profiles = b;
                    }
                }
                _ => {}
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
            tracing::debug!(path = %p.as_ref().display(), "config file not found, using environment");
        }
        Ok(Self::from_env())
    }
}
