/// wgpu device - runs the effect programs as WGSL compute pipelines
///
/// wgpu has no immediate context, so bindings are collected on the device
/// and each dispatch records one compute pass into a pending encoder.
/// Pending work is submitted by `submit` after every dispatch, by fences, by
/// timing readback and before any parameter upload (queued buffer writes
/// land ahead of every command in the next submission).
///
/// Storage textures are write-only in WGSL. Effects that work in place read
/// from a scratch copy of the destination taken just before the pass; one
/// scratch texture is kept per destination.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{EffectKind, PixelFormat};

use super::reference::{GROUP_SIZE, ReferenceDevice};
use super::share::{SharedPayload, ShareRegistry};
use super::{
    BackendError, BufferHandle, CapabilityLevel, DeviceInfo, DeviceProvider, DriverKind,
    FenceHandle, GpuDevice, OpenSharedError, ProgramHandle, SharedDevice, SharedHandle, TextureDesc,
    TextureHandle, TextureUsage, TimingReadback, ViewHandle,
};

/// Token in the WGSL sources replaced by the storage format of the target
pub const FORMAT_TOKEN: &str = "{{DST_FORMAT}}";

const OPTIONAL_FEATURES: wgpu::Features = wgpu::Features::TIMESTAMP_QUERY
    .union(wgpu::Features::BGRA8UNORM_STORAGE)
    .union(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM)
    .union(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES);

pub fn texture_format(format: PixelFormat) -> Option<wgpu::TextureFormat> {
    match format {
        PixelFormat::Unknown => None,
        PixelFormat::Rgba8Unorm => Some(wgpu::TextureFormat::Rgba8Unorm),
        PixelFormat::Bgra8Unorm => Some(wgpu::TextureFormat::Bgra8Unorm),
        PixelFormat::Rgb10a2Unorm => Some(wgpu::TextureFormat::Rgb10a2Unorm),
        PixelFormat::Rgba16Unorm => Some(wgpu::TextureFormat::Rgba16Unorm),
        PixelFormat::Rgba16Float => Some(wgpu::TextureFormat::Rgba16Float),
        PixelFormat::Rgba32Float => Some(wgpu::TextureFormat::Rgba32Float),
    }
}

/// WGSL storage texel format name
fn wgsl_format(format: PixelFormat) -> Option<&'static str> {
    match format {
        PixelFormat::Unknown => None,
        other => Some(other.name()),
    }
}

fn level_limits(level: CapabilityLevel) -> wgpu::Limits {
    match level {
        CapabilityLevel::Full => wgpu::Limits::default(),
        CapabilityLevel::Downlevel => wgpu::Limits::downlevel_defaults(),
        CapabilityLevel::Minimal => wgpu::Limits::downlevel_webgl2_defaults(),
    }
}

/// Bind group layout entries shared by every effect program
mod bind_group_entries {
    pub fn uniform_buffer(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }

    pub fn texture(binding: u32) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                // Loads only, so 32-bit float sources need no filtering feature
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }
    }

    pub fn storage_texture(binding: u32, format: wgpu::TextureFormat) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        }
    }
}

struct WgpuTexture {
    texture: Arc<wgpu::Texture>,
    desc: TextureDesc,
}

struct WgpuView {
    texture: TextureHandle,
    view: wgpu::TextureView,
}

struct WgpuProgram {
    kind: EffectKind,
    source: String,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::ComputePipeline>,
}

#[derive(Default)]
struct Bindings {
    params: Option<BufferHandle>,
    read: Option<ViewHandle>,
    write: Option<ViewHandle>,
    program: Option<ProgramHandle>,
}

enum TimerState {
    Idle,
    Armed,
    Written,
    /// Begin and end with no measured pass in between
    Unwritten,
    Mapping(Receiver<Result<(), wgpu::BufferAsyncError>>),
}

struct GpuTimer {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    /// Nanoseconds per tick
    period: f32,
    state: TimerState,
}

impl GpuTimer {
    fn new(device: &wgpu::Device, queue: &wgpu::Queue) -> Self {
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("texfx Timing Query Set"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        // Two u64 timestamps
        let size = 2 * std::mem::size_of::<u64>() as wgpu::BufferAddress;
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texfx Timing Resolve Buffer"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texfx Timing Readback Buffer"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            query_set,
            resolve,
            readback,
            period: queue.get_timestamp_period(),
            state: TimerState::Idle,
        }
    }
}

/// Scratch copies of in-place destinations, keyed by destination texture
struct ScratchCache<T> {
    entries: HashMap<TextureHandle, T>,
}

impl<T: Clone> ScratchCache<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Texture descriptions never change behind a handle, so the handle is the key
    fn get_or_create(&mut self, dest: TextureHandle, create: impl FnOnce() -> T) -> T {
        self.entries.entry(dest).or_insert_with(create).clone()
    }

    fn remove(&mut self, dest: TextureHandle) {
        self.entries.remove(&dest);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    info: DeviceInfo,
    registry: ShareRegistry,
    next_id: u64,
    textures: HashMap<TextureHandle, WgpuTexture>,
    views: HashMap<ViewHandle, WgpuView>,
    buffers: HashMap<BufferHandle, wgpu::Buffer>,
    programs: HashMap<ProgramHandle, WgpuProgram>,
    layouts: HashMap<wgpu::TextureFormat, (wgpu::BindGroupLayout, wgpu::PipelineLayout)>,
    bindings: Bindings,
    pending: Option<wgpu::CommandEncoder>,
    scratch: ScratchCache<wgpu::Texture>,
    fences: HashMap<FenceHandle, Arc<AtomicBool>>,
    timer: Option<GpuTimer>,
    /// Set when timing is requested on a device without timestamp queries
    timing_unsupported: bool,
    lost: bool,
}

impl WgpuDevice {
    /// Create a device for `driver` at the first of `levels` the adapter can meet.
    pub async fn new(
        driver: DriverKind,
        levels: &[CapabilityLevel],
        registry: ShareRegistry,
    ) -> Result<Self, BackendError> {
        let force_fallback_adapter = match driver {
            DriverKind::Hardware => false,
            DriverKind::Software => true,
            DriverKind::Reference => {
                return Err(BackendError::DeviceCreation(
                    "wgpu has no reference driver".to_string(),
                ));
            }
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter,
            })
            .await
            .map_err(|e| BackendError::DeviceCreation(format!("no {} adapter: {}", driver, e)))?;

        let adapter_info = adapter.get_info();
        if driver == DriverKind::Hardware && adapter_info.device_type == wgpu::DeviceType::Cpu {
            return Err(BackendError::DeviceCreation(format!(
                "{} is a software adapter",
                adapter_info.name
            )));
        }

        let supported = adapter.limits();
        let level = levels
            .iter()
            .copied()
            .find(|level| level_limits(*level).check_limits(&supported))
            .ok_or_else(|| {
                BackendError::DeviceCreation(format!(
                    "{} meets none of the requested capability levels",
                    adapter_info.name
                ))
            })?;

        let required_features = adapter.features() & OPTIONAL_FEATURES;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("texfx Shader Engine Device"),
                required_features,
                required_limits: level_limits(level),
                ..Default::default()
            })
            .await
            .map_err(|e| BackendError::DeviceCreation(e.to_string()))?;

        let timestamp_queries = device.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let timer = timestamp_queries.then(|| GpuTimer::new(&device, &queue));

        let info = DeviceInfo {
            adapter_name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            driver,
            level,
            adapter: registry.allocate_adapter(),
            max_texture_size: device.limits().max_texture_dimension_2d,
            timestamp_queries,
        };
        log::info!(
            "Selected GPU adapter: {} ({:?}, {} capability)",
            adapter_info.name,
            adapter_info.backend,
            level
        );

        Ok(Self {
            device,
            queue,
            adapter,
            info,
            registry,
            next_id: 1,
            textures: HashMap::new(),
            views: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            layouts: HashMap::new(),
            bindings: Bindings::default(),
            pending: None,
            scratch: ScratchCache::new(),
            fences: HashMap::new(),
            timer,
            timing_unsupported: false,
            lost: false,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.lost {
            return Err(BackendError::DeviceLost);
        }
        Ok(())
    }

    fn texture(&self, texture: TextureHandle) -> Result<&WgpuTexture, BackendError> {
        self.textures.get(&texture).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })
    }

    fn view(&self, view: Option<ViewHandle>, slot: &'static str) -> Result<&WgpuView, BackendError> {
        let view = view.ok_or(BackendError::Unbound(slot))?;
        self.views.get(&view).ok_or(BackendError::InvalidHandle {
            kind: "view",
            id: view.0,
        })
    }

    /// Run `f` inside a validation error scope
    fn scoped<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        let scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(scope.pop()) {
            Some(error) => Err(error.to_string()),
            None => Ok(value),
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        self.pending.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("texfx Effect Encoder"),
                })
        })
    }

    fn submit_pending(&mut self) -> Option<wgpu::SubmissionIndex> {
        let encoder = self.pending.take()?;
        Some(self.queue.submit(Some(encoder.finish())))
    }

    fn layout_for(&mut self, format: wgpu::TextureFormat) -> &(wgpu::BindGroupLayout, wgpu::PipelineLayout) {
        let device = &self.device;
        self.layouts.entry(format).or_insert_with(|| {
            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("texfx Effect Bind Group Layout"),
                entries: &[
                    bind_group_entries::uniform_buffer(0),
                    bind_group_entries::texture(1),
                    bind_group_entries::storage_texture(2, format),
                ],
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("texfx Effect Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                immediate_size: 0,
            });
            (bind_group_layout, pipeline_layout)
        })
    }

    /// Build (once) the pipeline of `program` for a storage format
    fn pipeline(&mut self, program: ProgramHandle, format: PixelFormat) -> Result<wgpu::ComputePipeline, BackendError> {
        let wgpu_format = texture_format(format).ok_or(BackendError::UnsupportedFormat(format))?;
        let wgsl = wgsl_format(format).ok_or(BackendError::UnsupportedFormat(format))?;

        let entry = self.programs.get(&program).ok_or(BackendError::InvalidHandle {
            kind: "program",
            id: program.0,
        })?;
        if let Some(pipeline) = entry.pipelines.get(&wgpu_format) {
            return Ok(pipeline.clone());
        }
        let kind = entry.kind;
        let source = entry.source.replace(FORMAT_TOKEN, wgsl);

        let pipeline_layout = self.layout_for(wgpu_format).1.clone();
        let label = format!("texfx {} Pipeline ({})", kind, format);
        let pipeline = self
            .scoped(|device| {
                let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                });
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&label),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
            })
            .map_err(BackendError::Compile)?;

        log::debug!("Built {} pipeline for {}", kind, format);
        if let Some(entry) = self.programs.get_mut(&program) {
            entry.pipelines.insert(wgpu_format, pipeline.clone());
        }
        Ok(pipeline)
    }

    fn extent(desc: &TextureDesc) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        }
    }

    fn storage_allowed(&self, format: wgpu::TextureFormat) -> bool {
        let features = if self
            .device
            .features()
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        {
            self.adapter.get_texture_format_features(format)
        } else {
            format.guaranteed_format_features(self.device.features())
        };
        features
            .allowed_usages
            .contains(wgpu::TextureUsages::STORAGE_BINDING)
    }
}

impl GpuDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, BackendError> {
        self.check_alive()?;
        let format = texture_format(desc.format).ok_or(BackendError::UnsupportedFormat(desc.format))?;
        if desc.usage.contains(TextureUsage::STORAGE) && !self.storage_allowed(format) {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }

        let mut usage = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        if desc.usage.contains(TextureUsage::SAMPLED) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.contains(TextureUsage::STORAGE) {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        let texture = self
            .scoped(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("texfx Texture"),
                    size: Self::extent(desc),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage,
                    view_formats: &[],
                })
            })
            .map_err(|e| {
                log::warn!("Texture creation failed: {}", e);
                BackendError::OutOfMemory
            })?;

        let handle = TextureHandle(self.allocate_id());
        self.textures.insert(
            handle,
            WgpuTexture {
                texture: Arc::new(texture),
                desc: *desc,
            },
        );
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        let Some(released) = self.textures.remove(&texture) else {
            return;
        };
        self.scratch.remove(texture);
        // Only the creating reference owns the handle
        if Arc::strong_count(&released.texture) == 2 {
            let payload: SharedPayload = released.texture.clone();
            if let Some(handle) = self.registry.handle_of(&payload) {
                self.registry.unregister(handle);
            }
        }
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.textures.get(&texture).map(|t| t.desc)
    }

    fn create_read_view(&mut self, texture: TextureHandle, format: PixelFormat) -> Result<ViewHandle, BackendError> {
        self.check_alive()?;
        let tex = self.texture(texture)?;
        if !tex.desc.usage.contains(TextureUsage::SAMPLED) {
            return Err(BackendError::MissingUsage("sampling"));
        }
        if !format.is_unknown() && format != tex.desc.format {
            return Err(BackendError::FormatMismatch {
                view: format,
                texture: tex.desc.format,
            });
        }
        let view = tex.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = ViewHandle(self.allocate_id());
        self.views.insert(handle, WgpuView { texture, view });
        Ok(handle)
    }

    fn create_write_view(&mut self, texture: TextureHandle, format: PixelFormat) -> Result<ViewHandle, BackendError> {
        self.check_alive()?;
        let tex = self.texture(texture)?;
        if !tex.desc.usage.contains(TextureUsage::STORAGE) {
            return Err(BackendError::MissingUsage("storage"));
        }
        if format != tex.desc.format {
            return Err(BackendError::FormatMismatch {
                view: format,
                texture: tex.desc.format,
            });
        }
        let view = tex.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = ViewHandle(self.allocate_id());
        self.views.insert(handle, WgpuView { texture, view });
        Ok(handle)
    }

    fn release_view(&mut self, view: ViewHandle) {
        self.views.remove(&view);
        if self.bindings.read == Some(view) {
            self.bindings.read = None;
        }
        if self.bindings.write == Some(view) {
            self.bindings.write = None;
        }
    }

    fn create_param_buffer(&mut self, size: usize) -> Result<BufferHandle, BackendError> {
        self.check_alive()?;
        let buffer = self
            .scoped(|device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("texfx Params Buffer"),
                    size: size as wgpu::BufferAddress,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .map_err(|_| BackendError::OutOfMemory)?;
        let handle = BufferHandle(self.allocate_id());
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn write_param_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        if !self.buffers.contains_key(&buffer) {
            return Err(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            });
        }
        // Dispatches already recorded must keep the parameters they were issued with
        self.submit_pending();
        if let Some(target) = self.buffers.get(&buffer) {
            self.queue.write_buffer(target, 0, bytes);
        }
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer);
        if self.bindings.params == Some(buffer) {
            self.bindings.params = None;
        }
    }

    fn compile_program(&mut self, kind: EffectKind, source: &str) -> Result<ProgramHandle, BackendError> {
        self.check_alive()?;
        // Validate once against a format every adapter can store to
        let probe = source.replace(FORMAT_TOKEN, "rgba8unorm");
        let label = format!("texfx {} Shader", kind);
        self.scoped(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(probe.into()),
            })
        })
        .map_err(BackendError::Compile)?;

        let handle = ProgramHandle(self.allocate_id());
        self.programs.insert(
            handle,
            WgpuProgram {
                kind,
                source: source.to_string(),
                pipelines: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn release_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
        if self.bindings.program == Some(program) {
            self.bindings.program = None;
        }
    }

    fn bind_params(&mut self, buffer: Option<BufferHandle>) {
        self.bindings.params = buffer;
    }

    fn bind_read_view(&mut self, view: Option<ViewHandle>) {
        self.bindings.read = view;
    }

    fn bind_write_view(&mut self, view: Option<ViewHandle>) {
        self.bindings.write = view;
    }

    fn bind_program(&mut self, program: Option<ProgramHandle>) {
        self.bindings.program = program;
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<(), BackendError> {
        self.check_alive()?;
        let program = self.bindings.program.ok_or(BackendError::Unbound("program"))?;
        let params = self.bindings.params.ok_or(BackendError::Unbound("params"))?;
        let params = self
            .buffers
            .get(&params)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: params.0,
            })?
            .clone();

        let write = self.view(self.bindings.write, "write view")?;
        let write_view = write.view.clone();
        let dest = write.texture;
        let target = self.texture(dest)?;
        let target_desc = target.desc;
        let target_texture = target.texture.clone();

        let read_view = match self.bindings.read {
            Some(_) => Some(self.view(self.bindings.read, "read view")?.view.clone()),
            None => None,
        };

        let pipeline = self.pipeline(program, target_desc.format)?;
        let wgpu_format = texture_format(target_desc.format).ok_or(BackendError::UnsupportedFormat(target_desc.format))?;

        // In-place effects read the destination through a scratch copy
        let (source_view, scratch) = match read_view {
            Some(view) => (view, None),
            None => {
                let device = &self.device;
                let scratch = self.scratch.get_or_create(dest, || {
                    device.create_texture(&wgpu::TextureDescriptor {
                        label: Some("texfx Scratch Texture"),
                        size: Self::extent(&target_desc),
                        mip_level_count: 1,
                        sample_count: 1,
                        dimension: wgpu::TextureDimension::D2,
                        format: wgpu_format,
                        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                        view_formats: &[],
                    })
                });
                let view = scratch.create_view(&wgpu::TextureViewDescriptor::default());
                (view, Some(scratch))
            }
        };

        let bind_group_layout = self.layout_for(wgpu_format).0.clone();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texfx Effect Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&write_view),
                },
            ],
        });

        let measure = matches!(self.timer.as_ref().map(|t| &t.state), Some(TimerState::Armed));
        let query_set = self.timer.as_ref().map(|t| t.query_set.clone());

        let encoder = self.encoder();
        if let Some(scratch) = &scratch {
            encoder.copy_texture_to_texture(
                target_texture.as_image_copy(),
                scratch.as_image_copy(),
                Self::extent(&target_desc),
            );
        }
        {
            let timestamp_writes = match (&query_set, measure) {
                (Some(query_set), true) => Some(wgpu::ComputePassTimestampWrites {
                    query_set,
                    beginning_of_pass_write_index: Some(0),
                    end_of_pass_write_index: Some(1),
                }),
                _ => None,
            };
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("texfx Effect Pass"),
                timestamp_writes,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, groups_z);
        }

        if measure && let Some(timer) = self.timer.as_mut() {
            timer.state = TimerState::Written;
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        self.submit_pending();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.submit()?;
        // Kick the queue without blocking on it
        let _ = self.device.poll(wgpu::PollType::Poll);
        Ok(())
    }

    fn insert_fence(&mut self) -> Result<FenceHandle, BackendError> {
        self.check_alive()?;
        self.submit_pending();
        let signaled = Arc::new(AtomicBool::new(false));
        let flag = signaled.clone();
        self.queue.on_submitted_work_done(move || {
            flag.store(true, Ordering::Release);
        });
        let fence = FenceHandle(self.allocate_id());
        self.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn fence_signaled(&mut self, fence: FenceHandle) -> bool {
        let _ = self.device.poll(wgpu::PollType::Poll);
        let signaled = self
            .fences
            .get(&fence)
            .map(|flag| flag.load(Ordering::Acquire));
        match signaled {
            Some(true) => {
                self.fences.remove(&fence);
                true
            }
            Some(false) => false,
            // Unknown fences were already observed
            None => true,
        }
    }

    fn begin_timing(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        match self.timer.as_mut() {
            Some(timer) => timer.state = TimerState::Armed,
            None => self.timing_unsupported = true,
        }
        Ok(())
    }

    fn end_timing(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        let Some(timer) = self.timer.as_ref() else {
            return Ok(());
        };
        match timer.state {
            TimerState::Written => {}
            TimerState::Armed => {
                if let Some(timer) = self.timer.as_mut() {
                    timer.state = TimerState::Unwritten;
                }
                return Ok(());
            }
            _ => return Ok(()),
        }

        let query_set = timer.query_set.clone();
        let resolve = timer.resolve.clone();
        let readback = timer.readback.clone();
        let size = resolve.size();

        let encoder = self.encoder();
        encoder.resolve_query_set(&query_set, 0..2, &resolve, 0);
        encoder.copy_buffer_to_buffer(&resolve, 0, &readback, 0, size);
        self.submit_pending();

        let (tx, rx) = mpsc::channel();
        readback.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        if let Some(timer) = self.timer.as_mut() {
            timer.state = TimerState::Mapping(rx);
        }
        Ok(())
    }

    fn read_timing(&mut self) -> TimingReadback {
        if std::mem::take(&mut self.timing_unsupported) {
            return TimingReadback::Disjoint;
        }
        let Some(timer) = self.timer.as_mut() else {
            return TimingReadback::NotReady;
        };
        let rx = match &timer.state {
            TimerState::Mapping(rx) => rx,
            TimerState::Unwritten => {
                timer.state = TimerState::Idle;
                return TimingReadback::Disjoint;
            }
            _ => return TimingReadback::NotReady,
        };

        let _ = self.device.poll(wgpu::PollType::Poll);
        let result = match rx.try_recv() {
            Err(TryRecvError::Empty) => return TimingReadback::NotReady,
            Err(TryRecvError::Disconnected) | Ok(Err(_)) => TimingReadback::Disjoint,
            Ok(Ok(())) => {
                let timestamps: [u64; 2] = {
                    let data = timer.readback.slice(..).get_mapped_range();
                    let ticks: &[u64] = bytemuck::cast_slice(&data[..]);
                    [ticks[0], ticks[1]]
                };
                timer.readback.unmap();
                elapsed(timestamps, timer.period)
            }
        };
        timer.state = TimerState::Idle;
        result
    }

    fn open_shared(&mut self, handle: SharedHandle) -> Result<TextureHandle, OpenSharedError> {
        if self.lost {
            return Err(OpenSharedError::DeviceLost);
        }
        let entry = self.registry.open(handle, self.info.adapter)?;
        let texture = entry
            .payload
            .downcast::<wgpu::Texture>()
            .map_err(|_| OpenSharedError::IncompatibleAdapter(handle))?;
        let opened = TextureHandle(self.allocate_id());
        self.textures.insert(
            opened,
            WgpuTexture {
                texture,
                desc: entry.desc,
            },
        );
        Ok(opened)
    }

    fn shared_handle(&mut self, texture: TextureHandle) -> Result<SharedHandle, BackendError> {
        let tex = self.texture(texture)?;
        if !tex.desc.usage.contains(TextureUsage::SHAREABLE) {
            return Err(BackendError::MissingUsage("sharing"));
        }
        let payload: SharedPayload = tex.texture.clone();
        if let Some(handle) = self.registry.handle_of(&payload) {
            return Ok(handle);
        }
        Ok(self.registry.register(self.info.adapter, tex.desc, payload))
    }

    fn supports_storage_write(&self, format: PixelFormat) -> bool {
        texture_format(format).is_some_and(|f| self.storage_allowed(f))
    }

    fn write_rgba8(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let tex = self.texture(texture)?;
        let desc = tex.desc;
        if data.len() != desc.texel_count() * 4 {
            return Err(BackendError::Transfer(format!(
                "expected {} bytes, got {}",
                desc.texel_count() * 4,
                data.len()
            )));
        }
        let bytes = encode_rgba8(desc.format, data).ok_or(BackendError::UnsupportedFormat(desc.format))?;
        let target = tex.texture.clone();
        // Keep upload order relative to recorded dispatches
        self.submit_pending();
        self.queue.write_texture(
            target.as_image_copy(),
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * desc.format.bytes_per_pixel()),
                rows_per_image: Some(desc.height),
            },
            Self::extent(&desc),
        );
        Ok(())
    }

    fn read_rgba8(&mut self, texture: TextureHandle) -> Result<Vec<u8>, BackendError> {
        self.check_alive()?;
        let tex = self.texture(texture)?;
        let desc = tex.desc;
        let source = tex.texture.clone();
        let bpp = desc.format.bytes_per_pixel();
        if decode_to_rgba8(desc.format, &[]).is_none() {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }

        // Calculate aligned bytes per row (must be multiple of 256)
        let unpadded_bytes_per_row = desc.width * bpp;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;
        let buffer_size = (padded_bytes_per_row * desc.height) as wgpu::BufferAddress;

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texfx Texture Read Buffer"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let encoder = self.encoder();
        encoder.copy_texture_to_buffer(
            source.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(desc.height),
                },
            },
            Self::extent(&desc),
        );
        self.submit_pending();

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        });

        rx.recv()
            .map_err(|_| BackendError::Transfer("buffer mapping result lost".to_string()))?
            .map_err(|e| BackendError::Transfer(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        // Remove row padding
        let mut packed = Vec::with_capacity((unpadded_bytes_per_row * desc.height) as usize);
        for row in 0..desc.height {
            let start = (row * padded_bytes_per_row) as usize;
            packed.extend_from_slice(&data[start..start + unpadded_bytes_per_row as usize]);
        }
        drop(data);
        staging_buffer.unmap();

        decode_to_rgba8(desc.format, &packed).ok_or(BackendError::UnsupportedFormat(desc.format))
    }

    fn shutdown(&mut self) {
        self.submit_pending();
        let _ = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(Duration::from_secs(1)),
        });
        let textures: Vec<TextureHandle> = self.textures.keys().copied().collect();
        for texture in textures {
            self.release_texture(texture);
        }
        self.views.clear();
        self.buffers.clear();
        self.programs.clear();
        self.layouts.clear();
        self.scratch.clear();
        self.fences.clear();
        self.bindings = Bindings::default();
        self.timer = None;
        self.device.destroy();
        self.lost = true;
        log::info!("GPU device {} released", self.info.adapter_name);
    }
}

fn elapsed(timestamps: [u64; 2], period: f32) -> TimingReadback {
    let [start, end] = timestamps;
    // Zeroed queries were never written
    if period <= 0.0 || end < start || (start == 0 && end == 0) {
        return TimingReadback::Disjoint;
    }
    let nanos = (end - start) as f64 * period as f64;
    TimingReadback::Elapsed(Duration::from_nanos(nanos as u64))
}

/// Convert tightly packed RGBA8 into the memory layout of `format`
pub fn encode_rgba8(format: PixelFormat, rgba: &[u8]) -> Option<Vec<u8>> {
    let pixels = rgba.chunks_exact(4);
    match format {
        PixelFormat::Rgba8Unorm => Some(rgba.to_vec()),
        PixelFormat::Bgra8Unorm => Some(pixels.flat_map(|p| [p[2], p[1], p[0], p[3]]).collect()),
        PixelFormat::Rgba16Unorm => Some(
            pixels
                .flat_map(|p| [p[0], p[1], p[2], p[3]])
                .flat_map(|c| (c as u16 * 257).to_le_bytes())
                .collect(),
        ),
        PixelFormat::Rgb10a2Unorm => Some(
            pixels
                .flat_map(|p| {
                    let ten = |c: u8| ((c as u32 * 1023 + 127) / 255) & 0x3ff;
                    let alpha = ((p[3] as u32 * 3 + 127) / 255) & 0x3;
                    (ten(p[0]) | (ten(p[1]) << 10) | (ten(p[2]) << 20) | (alpha << 30)).to_le_bytes()
                })
                .collect(),
        ),
        PixelFormat::Rgba32Float => Some(
            rgba.iter()
                .flat_map(|&c| (c as f32 / 255.0).to_le_bytes())
                .collect(),
        ),
        // No half-float encoder; callers upload RGBA8 and convert with the copy effect
        PixelFormat::Rgba16Float | PixelFormat::Unknown => None,
    }
}

/// Convert texels in the memory layout of `format` to tightly packed RGBA8
pub fn decode_to_rgba8(format: PixelFormat, data: &[u8]) -> Option<Vec<u8>> {
    let unit = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        PixelFormat::Rgba8Unorm => Some(data.to_vec()),
        PixelFormat::Bgra8Unorm => Some(
            data.chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0], p[3]])
                .collect(),
        ),
        PixelFormat::Rgba16Unorm => Some(
            data.chunks_exact(2)
                .map(|c| unit(u16::from_le_bytes([c[0], c[1]]) as f32 / 65535.0))
                .collect(),
        ),
        PixelFormat::Rgb10a2Unorm => Some(
            data.chunks_exact(4)
                .flat_map(|c| {
                    let v = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    let ten = |shift: u32| unit(((v >> shift) & 0x3ff) as f32 / 1023.0);
                    [ten(0), ten(10), ten(20), unit((v >> 30) as f32 / 3.0)]
                })
                .collect(),
        ),
        PixelFormat::Rgba32Float => Some(
            data.chunks_exact(4)
                .map(|c| unit(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        ),
        PixelFormat::Rgba16Float | PixelFormat::Unknown => None,
    }
}

/// Probes wgpu for hardware and software drivers, and falls back to the
/// CPU reference device for the reference driver.
#[derive(Clone)]
pub struct SystemDeviceProvider {
    registry: ShareRegistry,
}

impl SystemDeviceProvider {
    pub fn new(registry: ShareRegistry) -> Self {
        Self { registry }
    }
}

impl DeviceProvider for SystemDeviceProvider {
    fn create_device(&self, driver: DriverKind, levels: &[CapabilityLevel]) -> Result<SharedDevice, BackendError> {
        match driver {
            DriverKind::Hardware | DriverKind::Software => {
                let device = pollster::block_on(WgpuDevice::new(driver, levels, self.registry.clone()))?;
                Ok(Arc::new(Mutex::new(device)))
            }
            DriverKind::Reference => {
                let level = levels.first().copied().unwrap_or(CapabilityLevel::Minimal);
                let device = ReferenceDevice::on_adapter(
                    self.registry.clone(),
                    super::reference::REFERENCE_ADAPTER,
                    level,
                );
                Ok(Arc::new(Mutex::new(device)))
            }
        }
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("adapter", &self.info.adapter_name)
            .field("backend", &self.info.backend)
            .field("adapter_id", &self.info.adapter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_layouts() {
        let rgba = [255u8, 128, 0, 255, 10, 20, 30, 40];

        let bgra = encode_rgba8(PixelFormat::Bgra8Unorm, &rgba).unwrap();
        assert_eq!(&bgra[..4], &[0, 128, 255, 255]);
        assert_eq!(decode_to_rgba8(PixelFormat::Bgra8Unorm, &bgra).unwrap(), rgba);

        let wide = encode_rgba8(PixelFormat::Rgba16Unorm, &rgba).unwrap();
        assert_eq!(wide.len(), 16);
        assert_eq!(decode_to_rgba8(PixelFormat::Rgba16Unorm, &wide).unwrap(), rgba);

        let float = encode_rgba8(PixelFormat::Rgba32Float, &rgba).unwrap();
        assert_eq!(decode_to_rgba8(PixelFormat::Rgba32Float, &float).unwrap(), rgba);

        assert!(encode_rgba8(PixelFormat::Rgba16Float, &rgba).is_none());
    }

    #[test]
    fn test_rgb10a2_keeps_opaque_alpha() {
        let packed = encode_rgba8(PixelFormat::Rgb10a2Unorm, &[255, 0, 255, 255]).unwrap();
        let value = u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]);
        assert_eq!(value & 0x3ff, 0x3ff);
        assert_eq!(value >> 30, 3);
        assert_eq!(
            decode_to_rgba8(PixelFormat::Rgb10a2Unorm, &packed).unwrap(),
            vec![255, 0, 255, 255]
        );
    }

    #[test]
    fn test_elapsed_rejects_bad_pairs() {
        assert_eq!(elapsed([100, 50], 1.0), TimingReadback::Disjoint);
        assert_eq!(elapsed([0, 0], 1.0), TimingReadback::Disjoint);
        assert_eq!(elapsed([10, 20], 0.0), TimingReadback::Disjoint);
        assert_eq!(
            elapsed([1_000, 4_001_000], 1.0),
            TimingReadback::Elapsed(Duration::from_millis(4))
        );
    }

    #[test]
    fn test_scratch_cache_one_per_destination() {
        let mut cache = ScratchCache::new();
        let mut created = 0;
        let mut make = |id: u32| {
            created += 1;
            id
        };

        assert_eq!(cache.get_or_create(TextureHandle(1), || make(10)), 10);
        assert_eq!(cache.get_or_create(TextureHandle(1), || make(11)), 10);
        assert_eq!(cache.get_or_create(TextureHandle(2), || make(20)), 20);

        // A released destination gets a fresh scratch when its handle comes back
        cache.remove(TextureHandle(1));
        assert_eq!(cache.get_or_create(TextureHandle(1), || make(12)), 12);
        cache.clear();
        assert!(cache.entries.is_empty());
        assert_eq!(created, 3);
    }

    #[test]
    fn test_group_size_matches_shaders() {
        let copy = include_str!("../shaders/copy.wgsl");
        assert!(copy.contains(&format!("@workgroup_size({}, {}, 1)", GROUP_SIZE, GROUP_SIZE)));
        assert!(copy.contains(FORMAT_TOKEN));
    }
}
