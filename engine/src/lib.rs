//! texfx shader engine.
//!
//! Runs image effects as compute programs on a GPU device, converts shared
//! textures to the layout another graphics API expects, and backs off when
//! the GPU is overloaded.
//!
//! Architecture:
//! - `backend`: the [`GpuDevice`] abstraction, a CPU reference device and
//!   the wgpu device (feature `gpu`)
//! - `device`: owns or borrows the device
//! - `programs`: one compiled program per [`EffectKind`]
//! - `binder`: views and parameter buffer for the current texture pair
//! - `dispatch`: binds, dispatches, unbinds
//! - `bridge`: cross-API format conversion through shared handles
//! - `governor`: dispatch timing, GPU utilization and throttling
//!
//! # Examples
//!
//! ```
//! use engine::backend::{ReferenceProvider, ShareRegistry, TextureDesc, TextureUsage};
//! use engine::{Dispatch, EffectTarget, EngineConfig, ShaderEngine};
//! use common::PixelFormat;
//!
//! let provider = ReferenceProvider::new(ShareRegistry::new());
//! let mut engine = ShaderEngine::with_provider(EngineConfig::default(), Box::new(provider)).unwrap();
//!
//! let desc = TextureDesc::new(PixelFormat::Rgba8Unorm, 64, 64, TextureUsage::all());
//! let texture = engine.device().unwrap().create_texture(&desc).unwrap();
//!
//! let target = EffectTarget::in_place(texture, PixelFormat::Rgba8Unorm, 64, 64);
//! assert_eq!(engine.swap(&target).unwrap(), Dispatch::Applied);
//! ```

pub mod backend;
pub mod binder;
pub mod bridge;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod programs;

use std::path::Path;
use std::sync::MutexGuard;
use std::time::Duration;

use common::{Effect, EffectKind, PixelFormat};

use backend::{DeviceInfo, DeviceProvider, GpuDevice, ShareRegistry, SharedDevice, SharedHandle, TextureHandle};
use binder::{BindRequest, ResourceBinder};
use device::DeviceContext;
use governor::{GovernorStats, LoadGovernor, UtilizationSampler};
use programs::ProgramCache;

pub use bridge::{BridgeOutcome, CrossApiBridge};
pub use config::{BridgeSettings, ConfigError, DeviceSettings, EngineConfig, GovernorSettings};
pub use dispatch::{Completion, Dispatch, EffectDispatcher};
pub use error::EngineError;

/// Destination and optional source of an effect
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectTarget {
    /// `None` stands for a null destination and always fails
    pub dest: Option<TextureHandle>,
    pub source: Option<TextureHandle>,
    pub dest_format: PixelFormat,
    /// `Unknown` reads the source in its own format
    pub source_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl EffectTarget {
    pub fn new(
        dest: TextureHandle,
        source: TextureHandle,
        dest_format: PixelFormat,
        source_format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            dest: Some(dest),
            source: Some(source),
            dest_format,
            source_format,
            width,
            height,
        }
    }

    /// Target for effects that read and write the destination only
    pub fn in_place(dest: TextureHandle, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            dest: Some(dest),
            source: None,
            dest_format: format,
            source_format: PixelFormat::Unknown,
            width,
            height,
        }
    }
}

pub struct ShaderEngine {
    config: EngineConfig,
    context: DeviceContext,
    programs: ProgramCache,
    binder: ResourceBinder,
    bridge: CrossApiBridge,
    governor: LoadGovernor,
}

impl ShaderEngine {
    /// Engine over the system's devices
    #[cfg(feature = "gpu")]
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let provider = backend::SystemDeviceProvider::new(ShareRegistry::new());
        Self::with_provider(config, Box::new(provider))
    }

    /// Engine over the CPU reference device
    #[cfg(not(feature = "gpu"))]
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let provider = backend::ReferenceProvider::new(ShareRegistry::new());
        Self::with_provider(config, Box::new(provider))
    }

    pub fn with_provider(config: EngineConfig, provider: Box<dyn DeviceProvider>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut programs = ProgramCache::new();
        for (kind, source) in config.shader_overrides()? {
            log::info!("Using custom {} program", kind);
            programs.set_override(kind, source);
        }

        Ok(Self {
            context: DeviceContext::new(provider, config.device.probe_order()),
            programs,
            binder: ResourceBinder::new(),
            bridge: CrossApiBridge::new(config.bridge.target_format),
            governor: LoadGovernor::with_system_counter(config.governor.clone()),
            config,
        })
    }

    /// Engine running on a caller-owned device, which is never shut down
    pub fn adopt(config: EngineConfig, provider: Box<dyn DeviceProvider>, device: SharedDevice) -> Result<Self, ConfigError> {
        let mut engine = Self::with_provider(config, provider)?;
        engine.adopt_device(device);
        Ok(engine)
    }

    /// Switch to a caller-owned device. Resources on the previous device are released.
    pub fn adopt_device(&mut self, device: SharedDevice) {
        self.release_resources();
        self.context.acquire(Some(device));
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the GPU utilization source
    pub fn set_utilization_sampler(&mut self, sampler: UtilizationSampler) {
        self.governor.set_sampler(sampler);
    }

    /// Replace the program source of an effect. An empty source disables it.
    pub fn set_shader_source(&mut self, kind: EffectKind, source: String) {
        if let Some(program) = self.programs.get(kind)
            && let Some(mut device) = self.context.lock()
        {
            device.release_program(program);
        }
        self.programs.forget_kind(kind);
        self.programs.set_override(kind, source);
    }

    /// Create or adopt a device now rather than on first use
    pub fn acquire(&mut self) -> bool {
        self.context.acquire(None)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.context.info()
    }

    /// Exclusive access to the device, creating it if needed
    pub fn device(&mut self) -> Result<MutexGuard<'_, dyn GpuDevice + 'static>, EngineError> {
        if !self.context.acquire(None) {
            return Err(EngineError::NoDevice);
        }
        self.context.lock().ok_or(EngineError::NoDevice)
    }

    /// Run an effect. The single entry point of every effect.
    pub fn apply(&mut self, effect: &Effect, target: &EffectTarget, completion: Completion) -> Result<Dispatch, EngineError> {
        let kind = effect.kind();
        if self.programs.source(kind).trim().is_empty() {
            return Err(EngineError::EmptySource(kind));
        }
        let dest = target.dest.ok_or(EngineError::MissingDestination)?;
        if !self.context.acquire(None) {
            return Err(EngineError::NoDevice);
        }
        let mut device = self.context.lock().ok_or(EngineError::NoDevice)?;

        let request = BindRequest {
            dest,
            source: target.source,
            dest_format: target.dest_format,
            source_format: target.source_format,
            width: target.width,
            height: target.height,
            values: effect.values(),
        };
        let mut dispatcher = EffectDispatcher::new(&mut *device, &mut self.programs, &mut self.binder, &mut self.governor);
        dispatcher.apply(kind, &request, completion)
    }

    pub fn copy(&mut self, target: &EffectTarget) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Copy, target, Completion::Async)
    }

    pub fn flip(&mut self, target: &EffectTarget, swap_channels: bool) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Flip { swap_channels }, target, Completion::Async)
    }

    pub fn mirror(&mut self, target: &EffectTarget, swap_channels: bool) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Mirror { swap_channels }, target, Completion::Async)
    }

    pub fn swap(&mut self, target: &EffectTarget) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Swap, target, Completion::Async)
    }

    pub fn blur(&mut self, target: &EffectTarget, amount: f32) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Blur { amount }, target, Completion::Async)
    }

    pub fn sharpen(&mut self, target: &EffectTarget, width: f32, strength: f32) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Sharpen { width, strength }, target, Completion::Async)
    }

    pub fn adaptive_sharpen(&mut self, target: &EffectTarget, width: f32, level: f32) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::AdaptiveSharpen { width, level }, target, Completion::Async)
    }

    pub fn adjust(
        &mut self,
        target: &EffectTarget,
        brightness: f32,
        contrast: f32,
        saturation: f32,
        gamma: f32,
    ) -> Result<Dispatch, EngineError> {
        let effect = Effect::Adjust {
            brightness,
            contrast,
            saturation,
            gamma,
        };
        self.apply(&effect, target, Completion::Async)
    }

    pub fn temperature(&mut self, target: &EffectTarget, kelvin: f32) -> Result<Dispatch, EngineError> {
        self.apply(&Effect::Temperature { kelvin }, target, Completion::Async)
    }

    /// Re-read the texture attributes and rebind with zeroed parameters
    pub fn update_resources(&mut self, dest: Option<TextureHandle>, source: Option<TextureHandle>) -> Result<(), EngineError> {
        let dest = dest.ok_or(EngineError::MissingDestination)?;
        if !self.context.acquire(None) {
            return Err(EngineError::NoDevice);
        }
        let mut device = self.context.lock().ok_or(EngineError::NoDevice)?;

        self.binder.release(&mut *device);
        let dest_desc = device.texture_desc(dest).ok_or(EngineError::MissingDestination)?;
        let source_format = source
            .and_then(|source| device.texture_desc(source))
            .map(|desc| desc.format)
            .unwrap_or_default();

        let request = BindRequest {
            dest,
            source,
            dest_format: dest_desc.format,
            source_format,
            width: dest_desc.width,
            height: dest_desc.height,
            values: [0.0; 4],
        };
        self.binder.bind(&mut *device, &request)?;
        Ok(())
    }

    /// Present `handle` in the bridge's target layout, converting if the
    /// configuration forces it.
    pub fn bridge(&mut self, handle: SharedHandle, width: u32, height: u32) -> Result<BridgeOutcome, EngineError> {
        let force = self.config.bridge.force_convert;
        self.bridge_with(handle, width, height, force)
    }

    pub fn bridge_with(
        &mut self,
        handle: SharedHandle,
        width: u32,
        height: u32,
        force_convert: bool,
    ) -> Result<BridgeOutcome, EngineError> {
        if self.programs.source(EffectKind::Copy).trim().is_empty() {
            return Err(EngineError::EmptySource(EffectKind::Copy));
        }
        if !self.context.acquire(None) {
            return Err(EngineError::NoDevice);
        }
        let mut device = self.context.lock().ok_or(EngineError::NoDevice)?;
        let mut dispatcher = EffectDispatcher::new(&mut *device, &mut self.programs, &mut self.binder, &mut self.governor);
        self.bridge.bridge(&mut dispatcher, handle, width, height, force_convert)
    }

    /// Write a texture to an image file (format from the extension)
    pub fn save_texture(&mut self, texture: TextureHandle, path: &Path) -> Result<(), EngineError> {
        let mut device = self.device()?;
        let desc = device.texture_desc(texture).ok_or(EngineError::MissingDestination)?;
        let pixels = device.read_rgba8(texture)?;
        drop(device);

        let image = image::RgbaImage::from_raw(desc.width, desc.height, pixels)
            .ok_or_else(|| EngineError::Save("pixel buffer does not match texture size".to_string()))?;
        image
            .save(path)
            .map_err(|e| EngineError::Save(format!("{}: {}", path.display(), e)))?;
        log::info!("Saved {}x{} texture to {}", desc.width, desc.height, path.display());
        Ok(())
    }

    pub fn last_cost(&self) -> Duration {
        self.governor.last_cost()
    }

    pub fn latest_utilization(&self) -> Option<f64> {
        self.governor.latest_utilization()
    }

    pub fn peak_utilization(&self) -> f64 {
        self.governor.peak_utilization()
    }

    pub fn recovery_threshold(&self) -> f64 {
        self.governor.recovery_threshold()
    }

    pub fn is_throttled(&self) -> bool {
        self.governor.is_throttled()
    }

    pub fn governor(&self) -> &LoadGovernor {
        &self.governor
    }

    pub fn governor_stats(&self) -> GovernorStats {
        self.governor.stats()
    }

    pub fn binder(&self) -> &ResourceBinder {
        &self.binder
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    pub fn bridge_state(&self) -> &CrossApiBridge {
        &self.bridge
    }

    /// Release everything the engine allocated, then the device if owned.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        self.release_resources();
        self.context.release();
    }

    fn release_resources(&mut self) {
        match self.context.lock() {
            Some(mut device) => {
                self.bridge.release(&mut *device);
                self.binder.release(&mut *device);
                self.programs.release(&mut *device);
            }
            None => {
                self.bridge.forget();
                self.binder.forget();
                self.programs.forget();
            }
        }
    }
}

impl Drop for ShaderEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ShaderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderEngine")
            .field("context", &self.context)
            .field("governor", &self.governor)
            .finish()
    }
}
