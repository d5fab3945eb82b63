use anyhow::{Context, Result};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::validate_enum;

/// texfx configuration: general settings plus the engine's own sections
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(flatten)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Texture size used by `bench` when none is given
    #[serde(default = "default_bench_size")]
    pub bench_size: u32,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bench_size: default_bench_size(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bench_size() -> u32 {
    512
}

impl Config {
    /// Load configuration from a specific path. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.expand_paths(path.parent());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("texfx");

        Ok(config_dir.join("config.toml"))
    }

    /// Expand `~` in shader paths; relative paths are taken from the config's directory
    fn expand_paths(&mut self, base: Option<&Path>) {
        for path in self.engine.shaders.values_mut() {
            let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
            *path = match base {
                Some(base) if expanded.is_relative() => base.join(expanded),
                _ => expanded,
            };
        }
    }

    fn validate(&self) -> Result<()> {
        self.validate_log_level(&self.general.log_level)?;

        if self.general.bench_size == 0 {
            anyhow::bail!("Invalid bench size: must be positive");
        }

        self.engine.validate().context("Invalid engine configuration")?;

        Ok(())
    }

    fn validate_log_level(&self, level: &str) -> Result<()> {
        validate_enum!(level, "trace", "debug", "info", "warn", "error", "off")
    }
}
