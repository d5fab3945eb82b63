/// GPU device abstraction
///
/// The shader engine never talks to a graphics API directly. Everything
/// goes through [`GpuDevice`], an immediate-context style interface: bind
/// views and buffers, bind a program, dispatch, unbind.
///
/// Architecture:
/// - `share`: process-level namespace of shareable texture handles
/// - `reference`: CPU device that runs every kernel invocation in software
/// - `gpu`: wgpu device (feature `gpu`)
pub mod reference;
pub mod share;

#[cfg(feature = "gpu")]
pub mod gpu;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{EffectKind, PixelFormat};
use thiserror::Error;

pub use reference::{ReferenceDevice, ReferenceProvider};
pub use share::ShareRegistry;

#[cfg(feature = "gpu")]
pub use gpu::{SystemDeviceProvider, WgpuDevice};

/// A device shared between the engine and, for adopted devices, its owner.
pub type SharedDevice = Arc<Mutex<dyn GpuDevice>>;

macro_rules! handle_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

handle_type!(
    /// Texture owned by a device (or opened from a shared handle)
    TextureHandle,
    /// Read-only or read-write descriptor on a texture
    ViewHandle,
    /// Small uniform buffer
    BufferHandle,
    /// Compiled compute program
    ProgramHandle,
    /// Completion query
    FenceHandle,
    /// Cross-device texture handle, valid on every device of one adapter
    SharedHandle,
    /// Identity of the physical adapter a device runs on
    AdapterId,
);

impl std::fmt::Display for SharedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureUsage(u8);

impl TextureUsage {
    pub const SAMPLED: TextureUsage = TextureUsage(1);
    pub const STORAGE: TextureUsage = TextureUsage(1 << 1);
    pub const SHAREABLE: TextureUsage = TextureUsage(1 << 2);

    pub const fn empty() -> Self {
        TextureUsage(0)
    }

    pub const fn all() -> Self {
        TextureUsage(0b111)
    }

    pub const fn contains(&self, other: TextureUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = TextureUsage;

    fn bitor(self, rhs: Self) -> Self::Output {
        TextureUsage(self.0 | rhs.0)
    }
}

/// Texture creation parameters and reported attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new(format: PixelFormat, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            format,
            width,
            height,
            usage,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Driver backends in probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Hardware accelerated adapter
    Hardware,
    /// Software rasterizer provided by the platform
    Software,
    /// Minimal in-process reference implementation
    Reference,
}

impl DriverKind {
    /// The fixed order in which device creation is attempted
    pub const PROBE_ORDER: [DriverKind; 3] =
        [DriverKind::Hardware, DriverKind::Software, DriverKind::Reference];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hardware" | "hw" => Some(DriverKind::Hardware),
            "software" | "sw" | "warp" => Some(DriverKind::Software),
            "reference" | "ref" => Some(DriverKind::Reference),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Hardware => "hardware",
            DriverKind::Software => "software",
            DriverKind::Reference => "reference",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Device capability levels, lowest first so that `Ord` ranks them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityLevel {
    Minimal,
    Downlevel,
    Full,
}

impl CapabilityLevel {
    /// Levels requested from every driver, highest first
    pub const DESCENDING: [CapabilityLevel; 3] = [
        CapabilityLevel::Full,
        CapabilityLevel::Downlevel,
        CapabilityLevel::Minimal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CapabilityLevel::Full => "full",
            CapabilityLevel::Downlevel => "downlevel",
            CapabilityLevel::Minimal => "minimal",
        }
    }
}

impl std::fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of reading back a timestamp pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingReadback {
    /// Results are not available yet; ask again on a later frame
    NotReady,
    /// The timestamps cannot be trusted
    Disjoint,
    Elapsed(Duration),
}

/// Errors reported by a device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    #[error("Invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("View format {view} does not match texture format {texture}")]
    FormatMismatch {
        view: PixelFormat,
        texture: PixelFormat,
    },

    #[error("Format {0} is not supported for this operation")]
    UnsupportedFormat(PixelFormat),

    #[error("Texture usage does not allow {0}")]
    MissingUsage(&'static str),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Shader compilation failed: {0}")]
    Compile(String),

    #[error("Nothing bound at {0}")]
    Unbound(&'static str),

    #[error("Pixel transfer failed: {0}")]
    Transfer(String),

    #[error("Device lost")]
    DeviceLost,
}

/// Why a shared handle could not be opened
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenSharedError {
    #[error("Unknown shared handle {0}")]
    UnknownHandle(SharedHandle),

    #[error("Shared handle {0} belongs to an incompatible adapter")]
    IncompatibleAdapter(SharedHandle),

    #[error("Device lost while opening a shared handle")]
    DeviceLost,
}

/// Identity and capabilities of a created device
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeviceInfo {
    pub adapter_name: String,
    pub backend: String,
    pub driver: DriverKind,
    #[serde(serialize_with = "serialize_level")]
    pub level: CapabilityLevel,
    #[serde(skip)]
    pub adapter: AdapterId,
    pub max_texture_size: u32,
    pub timestamp_queries: bool,
}

fn serialize_level<S: serde::Serializer>(level: &CapabilityLevel, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(level.name())
}

impl DeviceInfo {
    pub fn log_info(&self) {
        log::info!("GPU Device:");
        log::info!("  Adapter: {}", self.adapter_name);
        log::info!("  Backend: {}", self.backend);
        log::info!("  Driver: {} ({} capability)", self.driver, self.level);
        log::info!(
            "  Max Texture Size: {}x{}",
            self.max_texture_size,
            self.max_texture_size
        );
        log::info!(
            "  Timestamp Queries: {}",
            if self.timestamp_queries { "Yes" } else { "No" }
        );
    }
}

/// An immediate-context compute device.
///
/// Binding calls take effect for the next [`GpuDevice::dispatch`] and stay
/// in place until replaced; passing `None` unbinds the slot. Handles are
/// only meaningful on the device that issued them.
pub trait GpuDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, BackendError>;
    fn release_texture(&mut self, texture: TextureHandle);
    /// Reported attributes, `None` for an unknown or released texture
    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc>;

    /// `PixelFormat::Unknown` reads the texture in its own format.
    fn create_read_view(
        &mut self,
        texture: TextureHandle,
        format: PixelFormat,
    ) -> Result<ViewHandle, BackendError>;
    /// The format must be explicit and equal to the texture's format.
    fn create_write_view(
        &mut self,
        texture: TextureHandle,
        format: PixelFormat,
    ) -> Result<ViewHandle, BackendError>;
    fn release_view(&mut self, view: ViewHandle);

    fn create_param_buffer(&mut self, size: usize) -> Result<BufferHandle, BackendError>;
    fn write_param_buffer(&mut self, buffer: BufferHandle, bytes: &[u8])
    -> Result<(), BackendError>;
    fn release_buffer(&mut self, buffer: BufferHandle);

    fn compile_program(
        &mut self,
        kind: EffectKind,
        source: &str,
    ) -> Result<ProgramHandle, BackendError>;
    fn release_program(&mut self, program: ProgramHandle);

    fn bind_params(&mut self, buffer: Option<BufferHandle>);
    fn bind_read_view(&mut self, view: Option<ViewHandle>);
    fn bind_write_view(&mut self, view: Option<ViewHandle>);
    fn bind_program(&mut self, program: Option<ProgramHandle>);
    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32)
    -> Result<(), BackendError>;

    /// Hand recorded work to the queue; the driver runs it when it gets to it
    fn submit(&mut self) -> Result<(), BackendError>;
    /// Submit pending work and push it to the GPU without waiting for it
    fn flush(&mut self) -> Result<(), BackendError>;
    fn insert_fence(&mut self) -> Result<FenceHandle, BackendError>;
    fn fence_signaled(&mut self, fence: FenceHandle) -> bool;

    /// Write the start timestamp; the next dispatch is measured
    fn begin_timing(&mut self) -> Result<(), BackendError>;
    fn end_timing(&mut self) -> Result<(), BackendError>;
    fn read_timing(&mut self) -> TimingReadback;

    fn open_shared(&mut self, handle: SharedHandle) -> Result<TextureHandle, OpenSharedError>;
    fn shared_handle(&mut self, texture: TextureHandle) -> Result<SharedHandle, BackendError>;

    /// Whether compute programs can store typed values into `format`
    fn supports_storage_write(&self, format: PixelFormat) -> bool;

    /// Upload tightly packed RGBA8 pixels
    fn write_rgba8(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), BackendError>;
    /// Read back tightly packed RGBA8 pixels, waiting for pending work
    fn read_rgba8(&mut self, texture: TextureHandle) -> Result<Vec<u8>, BackendError>;

    fn shutdown(&mut self);
}

/// Creates devices for a driver kind at the first capability level it accepts.
pub trait DeviceProvider: Send {
    fn create_device(
        &self,
        driver: DriverKind,
        levels: &[CapabilityLevel],
    ) -> Result<SharedDevice, BackendError>;
}
