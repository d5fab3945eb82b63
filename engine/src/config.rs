use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::{EffectKind, PixelFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::DriverKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Unknown effect in shader overrides: {0}")]
    UnknownEffect(String),

    #[error("Failed to read shader override {path}: {source}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shader engine configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub governor: GovernorSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    /// Effect name -> WGSL file replacing the built-in program
    #[serde(default)]
    pub shaders: BTreeMap<String, PathBuf>,
}

/// Load governor tuning
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GovernorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Frames to let timing settle before the first measurement
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u64,

    /// Frames between two measurements (and between throttled samples)
    #[serde(default = "default_measure_interval")]
    pub measure_interval: u64,

    /// Frames to wait before reading a timestamp pair back
    #[serde(default = "default_readback_delay")]
    pub readback_delay: u64,

    #[serde(default = "default_cost_threshold_ms")]
    pub cost_threshold_ms: f64,

    /// Percentage points below the peak at which the throttle releases
    #[serde(default = "default_recovery_drop")]
    pub recovery_drop: f64,

    /// Lowest recovery threshold, in percent
    #[serde(default = "default_recovery_floor")]
    pub recovery_floor: f64,

    /// Spacing of the two counter priming samples
    #[serde(default = "default_prime_interval_ms")]
    pub prime_interval_ms: u64,

    /// Consecutive expensive measurements needed to throttle
    #[serde(default = "default_excess_observations")]
    pub excess_observations: u32,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_frames: default_warmup_frames(),
            measure_interval: default_measure_interval(),
            readback_delay: default_readback_delay(),
            cost_threshold_ms: default_cost_threshold_ms(),
            recovery_drop: default_recovery_drop(),
            recovery_floor: default_recovery_floor(),
            prime_interval_ms: default_prime_interval_ms(),
            excess_observations: default_excess_observations(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_warmup_frames() -> u64 {
    60
}
fn default_measure_interval() -> u64 {
    120
}
fn default_readback_delay() -> u64 {
    8
}
fn default_cost_threshold_ms() -> f64 {
    4.0
}
fn default_recovery_drop() -> f64 {
    20.0
}
fn default_recovery_floor() -> f64 {
    50.0
}
fn default_prime_interval_ms() -> u64 {
    100
}
fn default_excess_observations() -> u32 {
    2
}

/// Cross-API bridge settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BridgeSettings {
    /// The only layout the consuming API accepts
    #[serde(default = "default_target_format")]
    pub target_format: PixelFormat,

    /// Convert even when the source is already in the target layout
    #[serde(default)]
    pub force_convert: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            target_format: default_target_format(),
            force_convert: false,
        }
    }
}

fn default_target_format() -> PixelFormat {
    PixelFormat::Bgra8Unorm
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DeviceSettings {
    /// Only try this driver instead of the full probe order
    #[serde(default)]
    pub driver: Option<DriverKind>,
}

impl DeviceSettings {
    /// Drivers to try, in order
    pub fn probe_order(&self) -> Vec<DriverKind> {
        match self.driver {
            Some(driver) => vec![driver],
            None => DriverKind::PROBE_ORDER.to_vec(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let governor = &self.governor;
        if governor.measure_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "governor.measure_interval",
                reason: "must be positive".to_string(),
            });
        }
        if governor.excess_observations == 0 {
            return Err(ConfigError::Invalid {
                field: "governor.excess_observations",
                reason: "must be positive".to_string(),
            });
        }
        if governor.cost_threshold_ms.is_nan() || governor.cost_threshold_ms <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "governor.cost_threshold_ms",
                reason: format!("{} is not a positive duration", governor.cost_threshold_ms),
            });
        }
        if !(0.0..=100.0).contains(&governor.recovery_floor) {
            return Err(ConfigError::Invalid {
                field: "governor.recovery_floor",
                reason: format!("{} is not a percentage", governor.recovery_floor),
            });
        }
        if governor.recovery_drop < 0.0 {
            return Err(ConfigError::Invalid {
                field: "governor.recovery_drop",
                reason: "must not be negative".to_string(),
            });
        }
        if self.bridge.target_format.is_unknown() {
            return Err(ConfigError::Invalid {
                field: "bridge.target_format",
                reason: "must name a pixel format".to_string(),
            });
        }
        for name in self.shaders.keys() {
            EffectKind::from_str(name).ok_or_else(|| ConfigError::UnknownEffect(name.clone()))?;
        }
        Ok(())
    }

    /// Read every configured shader override
    pub fn shader_overrides(&self) -> Result<Vec<(EffectKind, String)>, ConfigError> {
        self.shaders
            .iter()
            .map(|(name, path)| {
                let kind =
                    EffectKind::from_str(name).ok_or_else(|| ConfigError::UnknownEffect(name.clone()))?;
                Ok((kind, read_shader(path)?))
            })
            .collect()
    }
}

fn read_shader(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ShaderRead {
        path: path.to_path_buf(),
        source,
    })
}
