//! Common types for texfx.
//!
//! This crate defines the plain data shared by the shader engine
//! (`engine`) and the command-line front end (`texfx`): pixel formats,
//! effect kinds and their typed parameters.
//!
//! Nothing in here touches a GPU. The engine turns an [`Effect`] into a
//! four-float parameter payload with [`Effect::values`] and selects the
//! compute program with [`Effect::kind`].
//!
//! # Examples
//!
//! ```
//! use common::{Effect, EffectKind, PixelFormat};
//!
//! let blur = Effect::Blur { amount: 2.0 };
//! assert_eq!(blur.kind(), EffectKind::Blur);
//! assert_eq!(blur.values(), [2.0, 0.0, 0.0, 0.0]);
//! assert!(blur.kind().reads_source());
//!
//! // Senders usually declare their texture format as a DXGI code
//! assert_eq!(PixelFormat::from_dxgi(28), PixelFormat::Rgba8Unorm);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing formats and effect parameters from text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unknown pixel format: {0}")]
    UnknownFormat(String),

    #[error("Unknown effect: {0}")]
    UnknownEffect(String),

    #[error("Unknown parameter '{param}' for effect {effect}")]
    UnknownParam { effect: &'static str, param: String },

    #[error("Invalid value '{value}' for parameter '{param}'")]
    InvalidValue { param: String, value: String },

    #[error("Expected key=value, got '{0}'")]
    MalformedPair(String),
}

/// Texture pixel layouts understood by the engine.
///
/// Every format is four-channel; effects operate on normalized or float
/// RGBA values regardless of the memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Not declared. For a read view this means "the texture's own format".
    #[default]
    Unknown,
    Rgba8Unorm,
    /// The only layout a DirectX 9 consumer can open.
    Bgra8Unorm,
    Rgb10a2Unorm,
    Rgba16Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl PixelFormat {
    /// All concrete formats, excluding [`PixelFormat::Unknown`].
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Rgba8Unorm,
        PixelFormat::Bgra8Unorm,
        PixelFormat::Rgb10a2Unorm,
        PixelFormat::Rgba16Unorm,
        PixelFormat::Rgba16Float,
        PixelFormat::Rgba32Float,
    ];

    /// Parse format name from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "rgba8unorm" | "rgba8" | "rgba" => Some(PixelFormat::Rgba8Unorm),
            "bgra8unorm" | "bgra8" | "bgra" => Some(PixelFormat::Bgra8Unorm),
            "rgb10a2unorm" | "rgb10a2" => Some(PixelFormat::Rgb10a2Unorm),
            "rgba16unorm" | "rgba16" => Some(PixelFormat::Rgba16Unorm),
            "rgba16float" | "rgba16f" => Some(PixelFormat::Rgba16Float),
            "rgba32float" | "rgba32f" => Some(PixelFormat::Rgba32Float),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Unknown => "unknown",
            PixelFormat::Rgba8Unorm => "rgba8unorm",
            PixelFormat::Bgra8Unorm => "bgra8unorm",
            PixelFormat::Rgb10a2Unorm => "rgb10a2unorm",
            PixelFormat::Rgba16Unorm => "rgba16unorm",
            PixelFormat::Rgba16Float => "rgba16float",
            PixelFormat::Rgba32Float => "rgba32float",
        }
    }

    /// Map a DXGI format code, as declared by a texture sender.
    ///
    /// Zero and the DirectX 9 codes `D3DFMT_A8R8G8B8` (21) and
    /// `D3DFMT_X8R8G8B8` (22) map to [`PixelFormat::Bgra8Unorm`].
    /// Codes without a counterpart map to [`PixelFormat::Unknown`].
    pub fn from_dxgi(code: u32) -> Self {
        match code {
            0 | 21 | 22 | 87 => PixelFormat::Bgra8Unorm,
            2 => PixelFormat::Rgba32Float,
            10 => PixelFormat::Rgba16Float,
            11 => PixelFormat::Rgba16Unorm,
            24 => PixelFormat::Rgb10a2Unorm,
            28 => PixelFormat::Rgba8Unorm,
            _ => PixelFormat::Unknown,
        }
    }

    /// DXGI format code for this layout (0 for unknown)
    pub fn dxgi_code(&self) -> u32 {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Rgba32Float => 2,
            PixelFormat::Rgba16Float => 10,
            PixelFormat::Rgba16Unorm => 11,
            PixelFormat::Rgb10a2Unorm => 24,
            PixelFormat::Rgba8Unorm => 28,
            PixelFormat::Bgra8Unorm => 87,
        }
    }

    /// Bytes per texel in memory
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm | PixelFormat::Rgb10a2Unorm => 4,
            PixelFormat::Rgba16Unorm | PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, PixelFormat::Unknown)
    }

    /// Quantize a channel value the way a store to this format would.
    pub fn quantize(&self, value: f32) -> f32 {
        match self {
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => unorm(value, 255.0),
            PixelFormat::Rgba16Unorm => unorm(value, 65535.0),
            PixelFormat::Rgb10a2Unorm => unorm(value, 1023.0),
            PixelFormat::Rgba16Float | PixelFormat::Rgba32Float | PixelFormat::Unknown => value,
        }
    }
}

fn unorm(value: f32, max: f32) -> f32 {
    (value.clamp(0.0, 1.0) * max).round() / max
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a compute effect, used to select its cached program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectKind {
    /// Source to destination copy, converting between formats
    Copy,
    /// Vertical flip in place
    Flip,
    /// Horizontal mirror in place
    Mirror,
    /// Red/blue exchange in place
    Swap,
    /// Single pass gaussian blur
    Blur,
    /// Unsharp mask
    Sharpen,
    /// Contrast adaptive sharpen
    AdaptiveSharpen,
    /// Brightness, contrast, saturation and gamma in place
    Adjust,
    /// Colour temperature in place
    Temperature,
}

impl EffectKind {
    pub const COUNT: usize = 9;

    pub const ALL: [EffectKind; EffectKind::COUNT] = [
        EffectKind::Copy,
        EffectKind::Flip,
        EffectKind::Mirror,
        EffectKind::Swap,
        EffectKind::Blur,
        EffectKind::Sharpen,
        EffectKind::AdaptiveSharpen,
        EffectKind::Adjust,
        EffectKind::Temperature,
    ];

    /// Parse effect name from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "copy" => Some(EffectKind::Copy),
            "flip" => Some(EffectKind::Flip),
            "mirror" => Some(EffectKind::Mirror),
            "swap" => Some(EffectKind::Swap),
            "blur" => Some(EffectKind::Blur),
            "sharpen" => Some(EffectKind::Sharpen),
            "adaptive-sharpen" | "adaptive_sharpen" | "cas" => Some(EffectKind::AdaptiveSharpen),
            "adjust" => Some(EffectKind::Adjust),
            "temperature" | "temp" => Some(EffectKind::Temperature),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EffectKind::Copy => "copy",
            EffectKind::Flip => "flip",
            EffectKind::Mirror => "mirror",
            EffectKind::Swap => "swap",
            EffectKind::Blur => "blur",
            EffectKind::Sharpen => "sharpen",
            EffectKind::AdaptiveSharpen => "adaptive-sharpen",
            EffectKind::Adjust => "adjust",
            EffectKind::Temperature => "temperature",
        }
    }

    /// Stable slot index, `0..COUNT`
    pub fn index(&self) -> usize {
        match self {
            EffectKind::Copy => 0,
            EffectKind::Flip => 1,
            EffectKind::Mirror => 2,
            EffectKind::Swap => 3,
            EffectKind::Blur => 4,
            EffectKind::Sharpen => 5,
            EffectKind::AdaptiveSharpen => 6,
            EffectKind::Adjust => 7,
            EffectKind::Temperature => 8,
        }
    }

    /// Whether the effect samples a separate source texture.
    ///
    /// Effects that do not read a source work in place on the destination.
    pub fn reads_source(&self) -> bool {
        matches!(
            self,
            EffectKind::Copy | EffectKind::Blur | EffectKind::Sharpen | EffectKind::AdaptiveSharpen
        )
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A compute effect together with its parameters.
///
/// # Examples
///
/// ```
/// use common::{Effect, EffectKind};
///
/// let effect = Effect::from_args(EffectKind::Sharpen, &["width=2", "strength=1.5"]).unwrap();
/// assert_eq!(effect, Effect::Sharpen { width: 2.0, strength: 1.5 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "kebab-case")]
pub enum Effect {
    Copy,
    Flip {
        #[serde(default)]
        swap_channels: bool,
    },
    Mirror {
        #[serde(default)]
        swap_channels: bool,
    },
    Swap,
    Blur {
        /// Blur radius in texels
        amount: f32,
    },
    Sharpen {
        /// 1 (3x3), 2 (5x5), 3 (7x7)
        width: f32,
        /// 1 - 3 typical
        strength: f32,
    },
    AdaptiveSharpen {
        /// Pixel offset (1.0, 2.0, 3.0)
        width: f32,
        /// Sharpening level (0.0 to 1.0)
        level: f32,
    },
    Adjust {
        /// -1 to 1, default 0
        brightness: f32,
        /// 0 to 2, default 1
        contrast: f32,
        /// 0 to 4, default 1
        saturation: f32,
        /// 0 to 1, default 1
        gamma: f32,
    },
    Temperature {
        /// 3500 - 9500, default 6500 (daylight)
        kelvin: f32,
    },
}

impl Effect {
    /// Default parameters for an effect kind
    pub fn default_for(kind: EffectKind) -> Self {
        match kind {
            EffectKind::Copy => Effect::Copy,
            EffectKind::Flip => Effect::Flip {
                swap_channels: false,
            },
            EffectKind::Mirror => Effect::Mirror {
                swap_channels: false,
            },
            EffectKind::Swap => Effect::Swap,
            EffectKind::Blur => Effect::Blur { amount: 1.0 },
            EffectKind::Sharpen => Effect::Sharpen {
                width: 1.0,
                strength: 1.0,
            },
            EffectKind::AdaptiveSharpen => Effect::AdaptiveSharpen {
                width: 1.0,
                level: 0.5,
            },
            EffectKind::Adjust => Effect::Adjust {
                brightness: 0.0,
                contrast: 1.0,
                saturation: 1.0,
                gamma: 1.0,
            },
            EffectKind::Temperature => Effect::Temperature { kelvin: 6500.0 },
        }
    }

    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Copy => EffectKind::Copy,
            Effect::Flip { .. } => EffectKind::Flip,
            Effect::Mirror { .. } => EffectKind::Mirror,
            Effect::Swap => EffectKind::Swap,
            Effect::Blur { .. } => EffectKind::Blur,
            Effect::Sharpen { .. } => EffectKind::Sharpen,
            Effect::AdaptiveSharpen { .. } => EffectKind::AdaptiveSharpen,
            Effect::Adjust { .. } => EffectKind::Adjust,
            Effect::Temperature { .. } => EffectKind::Temperature,
        }
    }

    /// The four scalar parameters in upload order (`value1..value4`).
    pub fn values(&self) -> [f32; 4] {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match *self {
            Effect::Copy | Effect::Swap => [0.0; 4],
            Effect::Flip { swap_channels } | Effect::Mirror { swap_channels } => {
                [flag(swap_channels), 0.0, 0.0, 0.0]
            }
            Effect::Blur { amount } => [amount, 0.0, 0.0, 0.0],
            Effect::Sharpen { width, strength } => [width, strength, 0.0, 0.0],
            Effect::AdaptiveSharpen { width, level } => [width, level, 0.0, 0.0],
            Effect::Adjust {
                brightness,
                contrast,
                saturation,
                gamma,
            } => [brightness, contrast, saturation, gamma],
            Effect::Temperature { kelvin } => [kelvin, 0.0, 0.0, 0.0],
        }
    }

    /// Clamp every parameter to its documented range.
    pub fn clamped(&self) -> Self {
        match *self {
            Effect::Blur { amount } => Effect::Blur {
                amount: amount.max(0.0),
            },
            Effect::Sharpen { width, strength } => Effect::Sharpen {
                width: width.clamp(1.0, 3.0),
                strength: strength.max(0.0),
            },
            Effect::AdaptiveSharpen { width, level } => Effect::AdaptiveSharpen {
                width: width.clamp(1.0, 3.0),
                level: level.clamp(0.0, 1.0),
            },
            Effect::Adjust {
                brightness,
                contrast,
                saturation,
                gamma,
            } => Effect::Adjust {
                brightness: brightness.clamp(-1.0, 1.0),
                contrast: contrast.clamp(0.0, 2.0),
                saturation: saturation.clamp(0.0, 4.0),
                // Zero gamma divides by zero in the kernel
                gamma: gamma.clamp(0.01, 1.0),
            },
            Effect::Temperature { kelvin } => Effect::Temperature {
                kelvin: kelvin.clamp(3500.0, 9500.0),
            },
            other => other,
        }
    }

    /// Build an effect from `key=value` pairs on top of its defaults.
    pub fn from_args<S: AsRef<str>>(kind: EffectKind, args: &[S]) -> Result<Self, ParseError> {
        let mut effect = Effect::default_for(kind);
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedPair(arg.to_string()))?;
            effect.set(key.trim(), value.trim())?;
        }
        Ok(effect)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        let float = || {
            value.parse::<f32>().map_err(|_| ParseError::InvalidValue {
                param: key.to_string(),
                value: value.to_string(),
            })
        };
        let boolean = || match value {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ParseError::InvalidValue {
                param: key.to_string(),
                value: value.to_string(),
            }),
        };

        let kind = self.kind();
        match (self, key) {
            (Effect::Flip { swap_channels } | Effect::Mirror { swap_channels }, "swap") => {
                *swap_channels = boolean()?
            }
            (Effect::Blur { amount }, "amount") => *amount = float()?,
            (Effect::Sharpen { width, .. }, "width") => *width = float()?,
            (Effect::Sharpen { strength, .. }, "strength") => *strength = float()?,
            (Effect::AdaptiveSharpen { width, .. }, "width") => *width = float()?,
            (Effect::AdaptiveSharpen { level, .. }, "level") => *level = float()?,
            (Effect::Adjust { brightness, .. }, "brightness") => *brightness = float()?,
            (Effect::Adjust { contrast, .. }, "contrast") => *contrast = float()?,
            (Effect::Adjust { saturation, .. }, "saturation") => *saturation = float()?,
            (Effect::Adjust { gamma, .. }, "gamma") => *gamma = float()?,
            (Effect::Temperature { kelvin }, "kelvin") => *kelvin = float()?,
            _ => {
                return Err(ParseError::UnknownParam {
                    effect: kind.name(),
                    param: key.to_string(),
                });
            }
        }
        Ok(())
    }
}
