/// Resource binder - keeps views and the parameter buffer current for the
/// (destination, source) texture pair
///
/// Views are rebuilt only when a texture's identity (handle, format, size)
/// changes, and parameters are uploaded only when their bytes change.
use bytemuck::{Pod, Zeroable};
use common::PixelFormat;

use crate::backend::{BufferHandle, GpuDevice, TextureHandle, ViewHandle};
use crate::error::EngineError;

/// Two textures are the same iff all four fields are unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureIdentity {
    pub handle: TextureHandle,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Parameter block as the programs see it
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ShaderParams {
    pub value1: f32,
    pub value2: f32,
    pub value3: f32,
    pub value4: f32,
    pub width: u32,
    pub height: u32,
    pub padding1: u32,
    pub padding2: u32,
}

impl ShaderParams {
    pub const SIZE: usize = std::mem::size_of::<ShaderParams>();

    pub fn new(values: [f32; 4], width: u32, height: u32) -> Self {
        let [value1, value2, value3, value4] = values;
        Self {
            value1,
            value2,
            value3,
            value4,
            width,
            height,
            padding1: 0,
            padding2: 0,
        }
    }
}

/// Everything an effect needs bound
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BindRequest {
    pub dest: TextureHandle,
    pub source: Option<TextureHandle>,
    pub dest_format: PixelFormat,
    pub source_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub values: [f32; 4],
}

/// Resources ready for a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTarget {
    pub read_view: Option<ViewHandle>,
    pub write_view: ViewHandle,
    pub params: BufferHandle,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default)]
pub struct ResourceBinder {
    write: Option<(TextureIdentity, ViewHandle)>,
    read: Option<(TextureIdentity, ViewHandle)>,
    params: Option<BufferHandle>,
    last_params: Option<ShaderParams>,
    views_created: usize,
    param_uploads: usize,
}

impl ResourceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Views created so far, read and write
    pub fn views_created(&self) -> usize {
        self.views_created
    }

    pub fn param_uploads(&self) -> usize {
        self.param_uploads
    }

    pub fn last_params(&self) -> Option<ShaderParams> {
        self.last_params
    }

    pub fn dest_identity(&self) -> Option<TextureIdentity> {
        self.write.map(|(identity, _)| identity)
    }

    pub fn source_identity(&self) -> Option<TextureIdentity> {
        self.read.map(|(identity, _)| identity)
    }

    pub fn bind(&mut self, device: &mut dyn GpuDevice, request: &BindRequest) -> Result<DispatchTarget, EngineError> {
        let dest = TextureIdentity {
            handle: request.dest,
            format: request.dest_format,
            width: request.width,
            height: request.height,
        };
        let write_view = match self.write {
            Some((identity, view)) if identity == dest => view,
            stale => {
                if let Some((_, view)) = stale {
                    device.release_view(view);
                }
                self.write = None;
                let view = device
                    .create_write_view(request.dest, request.dest_format)
                    .map_err(|source| EngineError::ViewCreation {
                        view: "write",
                        source,
                    })?;
                log::debug!(
                    "Created write view on {:?} ({}x{} {})",
                    request.dest,
                    request.width,
                    request.height,
                    request.dest_format
                );
                self.views_created += 1;
                self.write = Some((dest, view));
                view
            }
        };

        let source = request.source.map(|handle| TextureIdentity {
            handle,
            format: request.source_format,
            width: request.width,
            height: request.height,
        });
        let read_view = match (self.read, source) {
            (Some((identity, view)), Some(source)) if identity == source => Some(view),
            (stale, source) => {
                if let Some((_, view)) = stale {
                    device.release_view(view);
                }
                self.read = None;
                match source {
                    Some(source) => {
                        let view = device
                            .create_read_view(source.handle, source.format)
                            .map_err(|e| EngineError::ViewCreation {
                                view: "read",
                                source: e,
                            })?;
                        log::debug!("Created read view on {:?} ({})", source.handle, source.format);
                        self.views_created += 1;
                        self.read = Some((source, view));
                        Some(view)
                    }
                    None => None,
                }
            }
        };

        let params = match self.params {
            Some(buffer) => buffer,
            None => {
                let buffer = device
                    .create_param_buffer(ShaderParams::SIZE)
                    .map_err(EngineError::BufferAllocation)?;
                self.params = Some(buffer);
                self.last_params = None;
                buffer
            }
        };

        let payload = ShaderParams::new(request.values, request.width, request.height);
        let changed = self
            .last_params
            .is_none_or(|last| bytemuck::bytes_of(&last) != bytemuck::bytes_of(&payload));
        if changed {
            device.write_param_buffer(params, bytemuck::bytes_of(&payload))?;
            self.last_params = Some(payload);
            self.param_uploads += 1;
        }

        Ok(DispatchTarget {
            read_view,
            write_view,
            params,
            width: request.width,
            height: request.height,
        })
    }

    /// Release both views; the next bind recreates them
    pub fn release_views(&mut self, device: &mut dyn GpuDevice) {
        if let Some((_, view)) = self.write.take() {
            device.release_view(view);
        }
        if let Some((_, view)) = self.read.take() {
            device.release_view(view);
        }
    }

    /// Release views, the parameter buffer and the parameter cache
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        self.release_views(device);
        if let Some(buffer) = self.params.take() {
            device.release_buffer(buffer);
        }
        self.last_params = None;
    }

    /// Drop every handle without touching the device (the device is gone)
    pub fn forget(&mut self) {
        self.write = None;
        self.read = None;
        self.params = None;
        self.last_params = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ReferenceDevice, ShareRegistry, TextureDesc, TextureUsage};

    fn texture(device: &mut ReferenceDevice, format: PixelFormat, w: u32, h: u32) -> TextureHandle {
        device
            .create_texture(&TextureDesc::new(format, w, h, TextureUsage::all()))
            .unwrap()
    }

    fn request(dest: TextureHandle, source: Option<TextureHandle>, values: [f32; 4]) -> BindRequest {
        BindRequest {
            dest,
            source,
            dest_format: PixelFormat::Rgba8Unorm,
            source_format: PixelFormat::Rgba8Unorm,
            width: 64,
            height: 32,
            values,
        }
    }

    #[test]
    fn test_params_block_layout() {
        assert_eq!(ShaderParams::SIZE, 32);
        let params = ShaderParams::new([1.0, 2.0, 3.0, 4.0], 7, 9);
        let bytes = bytemuck::bytes_of(&params);
        assert_eq!(&bytes[16..20], &7u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &9u32.to_ne_bytes());
    }

    #[test]
    fn test_same_identity_reuses_views() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let source = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let mut binder = ResourceBinder::new();

        let first = binder.bind(&mut device, &request(dest, Some(source), [0.0; 4])).unwrap();
        let second = binder.bind(&mut device, &request(dest, Some(source), [0.0; 4])).unwrap();
        assert_eq!(first, second);
        assert_eq!(binder.views_created(), 2);
        assert_eq!(device.counters().read_views_created, 1);
        assert_eq!(device.counters().write_views_created, 1);
    }

    #[test]
    fn test_changed_geometry_rebuilds_views() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let mut binder = ResourceBinder::new();

        binder.bind(&mut device, &request(dest, None, [0.0; 4])).unwrap();
        let mut resized = request(dest, None, [0.0; 4]);
        resized.width = 32;
        binder.bind(&mut device, &resized).unwrap();

        assert_eq!(device.counters().write_views_created, 2);
        assert_eq!(device.live_views(), 1);
    }

    #[test]
    fn test_dropping_source_releases_read_view() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let source = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let mut binder = ResourceBinder::new();

        let with_source = binder.bind(&mut device, &request(dest, Some(source), [0.0; 4])).unwrap();
        assert!(with_source.read_view.is_some());
        let without = binder.bind(&mut device, &request(dest, None, [0.0; 4])).unwrap();
        assert!(without.read_view.is_none());
        assert_eq!(device.live_views(), 1);
    }

    #[test]
    fn test_params_upload_only_on_change() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        let mut binder = ResourceBinder::new();

        binder.bind(&mut device, &request(dest, None, [1.0, 0.0, 0.0, 0.0])).unwrap();
        binder.bind(&mut device, &request(dest, None, [1.0, 0.0, 0.0, 0.0])).unwrap();
        assert_eq!(binder.param_uploads(), 1);

        binder.bind(&mut device, &request(dest, None, [1.5, 0.0, 0.0, 0.0])).unwrap();
        assert_eq!(binder.param_uploads(), 2);
        assert_eq!(device.counters().buffer_writes, 2);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn test_buffer_failure_is_reported() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Rgba8Unorm, 64, 32);
        device.faults_mut().fail_buffers = true;
        let mut binder = ResourceBinder::new();
        assert!(matches!(
            binder.bind(&mut device, &request(dest, None, [0.0; 4])),
            Err(EngineError::BufferAllocation(_))
        ));
    }

    #[test]
    fn test_write_view_format_must_match() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let dest = texture(&mut device, PixelFormat::Bgra8Unorm, 64, 32);
        let mut binder = ResourceBinder::new();
        assert!(matches!(
            binder.bind(&mut device, &request(dest, None, [0.0; 4])),
            Err(EngineError::ViewCreation { view: "write", .. })
        ));
        assert!(binder.dest_identity().is_none());
    }
}
