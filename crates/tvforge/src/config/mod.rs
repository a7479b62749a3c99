//! Application configuration.
//!
//! Settings load from an optional `tvforge.toml` with `TVFORGE_*` environment
//! variable overrides layered on top; every field has a default so the file
//! may be absent entirely.

pub mod duration_serde;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub ingestion_guard: IngestionGuardSettings,
    /// Base URL this deployment serves logo assets from.
    pub base_url: String,
}

/// Filesystem layout for pipeline runs and cached assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Sandbox root for per-run temp directories.
    pub temp_dir: PathBuf,
    /// Stable output directory published artifacts land in.
    pub output_dir: PathBuf,
    /// Sandbox root holding `logos/{cached,uploaded}/`.
    pub logo_dir: PathBuf,
}

/// Tuning for the pre-pipeline ingestion guard stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionGuardSettings {
    pub enabled: bool,
    #[serde(with = "duration_serde::duration")]
    pub poll_interval: Duration,
    #[serde(with = "duration_serde::duration")]
    pub max_wait_time: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            ingestion_guard: IngestionGuardSettings::default(),
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/var/lib/tvforge/pipeline"),
            output_dir: PathBuf::from("/var/lib/tvforge/output"),
            logo_dir: PathBuf::from("/var/lib/tvforge/assets"),
        }
    }
}

impl Default for IngestionGuardSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(1),
            max_wait_time: Duration::from_secs(5 * 60),
        }
    }
}

impl Settings {
    /// Load settings from `tvforge.toml` (if present) and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("tvforge.toml")
    }

    /// Load settings from an explicit TOML path plus environment overrides.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TVFORGE_").split("__"))
            .extract()
    }
}
