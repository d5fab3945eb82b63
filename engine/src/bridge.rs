/// Cross-API bridge - presents a shared texture in the one layout the
/// consuming API accepts
///
/// A source already in the target layout is handed back untouched. Any
/// other source is copied by the `copy` effect into an intermediate
/// shareable texture, whose handle is returned instead.
///
/// The opened source texture is kept until the handle or its attributes
/// change, so the read view bound to it survives repeated conversions.
use common::{EffectKind, PixelFormat};

use crate::backend::{GpuDevice, SharedHandle, TextureDesc, TextureHandle, TextureUsage};
use crate::binder::BindRequest;
use crate::dispatch::{Completion, Dispatch, EffectDispatcher};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The source handle already satisfies the consumer
    Passthrough(SharedHandle),
    /// Handle of the intermediate texture holding the converted copy
    Converted(SharedHandle),
    /// Skipped this frame by the load governor
    Throttled,
}

impl BridgeOutcome {
    pub fn handle(&self) -> Option<SharedHandle> {
        match self {
            BridgeOutcome::Passthrough(handle) | BridgeOutcome::Converted(handle) => Some(*handle),
            BridgeOutcome::Throttled => None,
        }
    }
}

/// Attributes of the last source that was opened successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceEntry {
    handle: SharedHandle,
    /// The handle opened on our device
    opened: TextureHandle,
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Size requested by the caller for that source
    requested: (u32, u32),
}

#[derive(Debug, Clone, Copy)]
struct Intermediate {
    texture: TextureHandle,
    desc: TextureDesc,
}

#[derive(Debug)]
pub struct CrossApiBridge {
    target_format: PixelFormat,
    entry: Option<SourceEntry>,
    intermediate: Option<Intermediate>,
    conversions: usize,
    intermediates_created: usize,
}

impl CrossApiBridge {
    pub fn new(target_format: PixelFormat) -> Self {
        Self {
            target_format,
            entry: None,
            intermediate: None,
            conversions: 0,
            intermediates_created: 0,
        }
    }

    pub fn target_format(&self) -> PixelFormat {
        self.target_format
    }

    pub fn conversions(&self) -> usize {
        self.conversions
    }

    pub fn intermediates_created(&self) -> usize {
        self.intermediates_created
    }

    pub fn intermediate(&self) -> Option<TextureHandle> {
        self.intermediate.map(|i| i.texture)
    }

    /// The source texture currently held open, if any
    pub fn source(&self) -> Option<TextureHandle> {
        self.entry.map(|entry| entry.opened)
    }

    pub fn bridge(
        &mut self,
        dispatcher: &mut EffectDispatcher<'_>,
        handle: SharedHandle,
        width: u32,
        height: u32,
        force_convert: bool,
    ) -> Result<BridgeOutcome, EngineError> {
        if !force_convert
            && let Some(entry) = self.entry
            && entry.handle == handle
            && entry.format == self.target_format
            && entry.requested == (width, height)
        {
            return Ok(BridgeOutcome::Passthrough(handle));
        }

        let opened = match dispatcher.device().open_shared(handle) {
            Ok(texture) => texture,
            Err(e) => {
                log::warn!("Cannot open shared handle {}: {}", handle, e);
                return Err(EngineError::OpenShared(e));
            }
        };

        let Some(desc) = dispatcher.device().texture_desc(opened) else {
            dispatcher.device().release_texture(opened);
            return Err(EngineError::MissingDestination);
        };

        let changed = self.entry.is_none_or(|entry| {
            entry.format != desc.format || entry.width != desc.width || entry.height != desc.height
        });
        let source = match self.entry {
            Some(entry) if !changed && entry.handle == handle => {
                // Same texture as last time: keep the one already open
                dispatcher.device().release_texture(opened);
                entry.opened
            }
            previous => {
                if changed {
                    log::debug!(
                        "Bridge source {} is {}x{} {}",
                        handle,
                        desc.width,
                        desc.height,
                        desc.format
                    );
                    // Views and parameters bound to the old source are stale
                    self.release_intermediate(dispatcher.device());
                    dispatcher.release_bindings();
                }
                if let Some(previous) = previous {
                    dispatcher.device().release_texture(previous.opened);
                }
                opened
            }
        };
        self.entry = Some(SourceEntry {
            handle,
            opened: source,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            requested: (width, height),
        });

        if !force_convert && desc.format == self.target_format {
            return Ok(BridgeOutcome::Passthrough(handle));
        }

        if !dispatcher.device().supports_storage_write(self.target_format) {
            return Err(EngineError::UnsupportedFormat(self.target_format));
        }

        let intermediate = self.ensure_intermediate(dispatcher.device(), width, height)?;
        let request = BindRequest {
            dest: intermediate,
            source: Some(source),
            dest_format: self.target_format,
            source_format: PixelFormat::Unknown,
            width,
            height,
            values: [0.0; 4],
        };
        match dispatcher.apply(EffectKind::Copy, &request, Completion::Flush)? {
            Dispatch::Throttled => return Ok(BridgeOutcome::Throttled),
            Dispatch::Applied => {}
        }

        let shared = dispatcher.device().shared_handle(intermediate)?;
        self.conversions += 1;
        Ok(BridgeOutcome::Converted(shared))
    }

    /// (Re)create the intermediate when missing or of another size
    fn ensure_intermediate(
        &mut self,
        device: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, EngineError> {
        if let Some(existing) = self.intermediate
            && existing.desc.width == width
            && existing.desc.height == height
            && existing.desc.format == self.target_format
        {
            return Ok(existing.texture);
        }
        self.release_intermediate(device);

        let desc = TextureDesc::new(self.target_format, width, height, TextureUsage::all());
        let texture = device.create_texture(&desc)?;
        log::debug!("Created {}x{} {} bridge texture", width, height, self.target_format);
        self.intermediate = Some(Intermediate { texture, desc });
        self.intermediates_created += 1;
        Ok(texture)
    }

    fn release_intermediate(&mut self, device: &mut dyn GpuDevice) {
        if let Some(intermediate) = self.intermediate.take() {
            device.release_texture(intermediate.texture);
        }
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        self.release_intermediate(device);
        if let Some(entry) = self.entry.take() {
            device.release_texture(entry.opened);
        }
    }

    /// Drop every handle without touching the device (the device is gone)
    pub fn forget(&mut self) {
        self.intermediate = None;
        self.entry = None;
    }
}
