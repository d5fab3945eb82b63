/// Reference device - runs compute kernels on the CPU
///
/// Every dispatch walks the full thread-group grid and calls the effect
/// kernel once per invocation, so bounds checks behave exactly like they
/// would on a GPU. The device keeps books on what happened (views created,
/// uploads, per-texel writes, out-of-bounds stores) and can be told to
/// fail, which makes it the workhorse of the engine's test-suite.
pub mod kernels;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use common::{EffectKind, PixelFormat};

use self::kernels::{KernelParams, SourceImage, TargetImage, Texel};
use super::share::{SharedPayload, ShareRegistry};
use super::{
    AdapterId, BackendError, BufferHandle, CapabilityLevel, DeviceInfo, DeviceProvider, DriverKind,
    FenceHandle, GpuDevice, OpenSharedError, ProgramHandle, SharedDevice, SharedHandle, TextureDesc,
    TextureHandle, TextureUsage, TimingReadback, ViewHandle,
};

/// Threads per group in x and y, shared with the WGSL programs
pub const GROUP_SIZE: u32 = 16;

/// The adapter identity of every reference device
pub const REFERENCE_ADAPTER: AdapterId = AdapterId(0);

const MAX_TEXTURE_SIZE: u32 = 16384;

type TexelStore = Mutex<Vec<Texel>>;

/// Parameter block layout read by the kernels (first 24 bytes)
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawParams {
    values: [f32; 4],
    width: u32,
    height: u32,
}

struct RefTexture {
    desc: TextureDesc,
    texels: Arc<TexelStore>,
    /// Opened from a shared handle rather than created here
    opened: bool,
}

#[derive(Clone, Copy)]
struct RefView {
    texture: TextureHandle,
}

/// What the most recent dispatch did
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub kind: EffectKind,
    pub groups: (u32, u32, u32),
    pub width: u32,
    pub height: u32,
    /// Store count per destination texel, row-major
    pub writes: Vec<u32>,
    pub out_of_bounds: u64,
    pub had_source: bool,
}

impl DispatchRecord {
    /// True when every texel of the destination was stored exactly once
    pub fn covers_exactly_once(&self) -> bool {
        self.writes.iter().all(|&n| n == 1)
    }
}

/// Knobs for making the device misbehave
#[derive(Debug, Clone, Default)]
pub struct FaultInjection {
    pub fail_buffers: bool,
    pub fail_textures: bool,
    pub fail_compile: HashSet<EffectKind>,
    pub device_lost: bool,
    /// Fail `dispatch` after every binding checked out
    pub fail_dispatch: bool,
    /// Formats reported as lacking typed storage stores
    pub no_storage: HashSet<PixelFormat>,
}

/// Running totals, for asserting on work done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub textures_created: usize,
    pub read_views_created: usize,
    pub write_views_created: usize,
    pub buffer_writes: usize,
    pub programs_compiled: usize,
    pub dispatches: usize,
    pub submissions: usize,
    pub flushes: usize,
    pub fence_polls: usize,
    pub shared_opens: usize,
}

#[derive(Default)]
struct Bindings {
    params: Option<BufferHandle>,
    read: Option<ViewHandle>,
    write: Option<ViewHandle>,
    program: Option<ProgramHandle>,
}

#[derive(Default)]
struct TimingState {
    started: bool,
    /// Cost recorded at `end_timing`, waiting for readback
    result: Option<TimingReadback>,
    reads_until_ready: u32,
}

pub struct ReferenceDevice {
    info: DeviceInfo,
    registry: ShareRegistry,
    next_id: u64,
    textures: HashMap<TextureHandle, RefTexture>,
    views: HashMap<ViewHandle, RefView>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    programs: HashMap<ProgramHandle, EffectKind>,
    bindings: Bindings,
    timing: TimingState,
    simulated_cost: Duration,
    disjoint: bool,
    timing_latency: u32,
    faults: FaultInjection,
    counters: DeviceCounters,
    last_dispatch: Option<DispatchRecord>,
    /// Dispatched work not yet handed to the queue
    unsubmitted: usize,
    shut_down: bool,
}

impl ReferenceDevice {
    pub fn new(registry: ShareRegistry) -> Self {
        Self::on_adapter(registry, REFERENCE_ADAPTER, CapabilityLevel::Full)
    }

    /// A device on a specific adapter; handles only open between devices
    /// of the same adapter.
    pub fn on_adapter(registry: ShareRegistry, adapter: AdapterId, level: CapabilityLevel) -> Self {
        let info = DeviceInfo {
            adapter_name: format!("Reference Rasterizer #{}", adapter.0),
            backend: "cpu".to_string(),
            driver: DriverKind::Reference,
            level,
            adapter,
            max_texture_size: MAX_TEXTURE_SIZE,
            timestamp_queries: true,
        };
        Self {
            info,
            registry,
            next_id: 1,
            textures: HashMap::new(),
            views: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            bindings: Bindings::default(),
            timing: TimingState::default(),
            simulated_cost: Duration::from_micros(500),
            disjoint: false,
            timing_latency: 0,
            faults: FaultInjection::default(),
            counters: DeviceCounters::default(),
            last_dispatch: None,
            unsubmitted: 0,
            shut_down: false,
        }
    }

    /// GPU time reported for each measured dispatch
    pub fn set_simulated_cost(&mut self, cost: Duration) {
        self.simulated_cost = cost;
    }

    /// Report every timestamp pair as disjoint
    pub fn set_disjoint(&mut self, disjoint: bool) {
        self.disjoint = disjoint;
    }

    /// Number of `read_timing` calls answered with `NotReady` after a pair ends
    pub fn set_timing_latency(&mut self, reads: u32) {
        self.timing_latency = reads;
    }

    pub fn faults_mut(&mut self) -> &mut FaultInjection {
        &mut self.faults
    }

    pub fn counters(&self) -> DeviceCounters {
        self.counters
    }

    pub fn last_dispatch(&self) -> Option<&DispatchRecord> {
        self.last_dispatch.as_ref()
    }

    /// Dispatches recorded since the last submission
    pub fn unsubmitted(&self) -> usize {
        self.unsubmitted
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_views(&self) -> usize {
        self.views.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Copy of the texels of a texture, in RGBA channel order
    pub fn texels(&self, texture: TextureHandle) -> Option<Vec<Texel>> {
        let texture = self.textures.get(&texture)?;
        Some(lock(&texture.texels).clone())
    }

    pub fn write_texels(&mut self, texture: TextureHandle, texels: &[Texel]) -> Result<(), BackendError> {
        let texture = self.texture(texture)?;
        if texels.len() != texture.desc.texel_count() {
            return Err(BackendError::Transfer(format!(
                "expected {} texels, got {}",
                texture.desc.texel_count(),
                texels.len()
            )));
        }
        let format = texture.desc.format;
        let mut store = lock(&texture.texels);
        for (dst, src) in store.iter_mut().zip(texels) {
            *dst = src.map(|c| format.quantize(c));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn texture(&self, texture: TextureHandle) -> Result<&RefTexture, BackendError> {
        self.textures.get(&texture).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })
    }

    fn view_texture(&self, view: Option<ViewHandle>, slot: &'static str) -> Result<&RefTexture, BackendError> {
        let view = view.ok_or(BackendError::Unbound(slot))?;
        let view = self.views.get(&view).ok_or(BackendError::InvalidHandle {
            kind: "view",
            id: view.0,
        })?;
        self.texture(view.texture)
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.faults.device_lost || self.shut_down {
            return Err(BackendError::DeviceLost);
        }
        Ok(())
    }

    fn bound_params(&self) -> Result<KernelParams, BackendError> {
        let buffer = self.bindings.params.ok_or(BackendError::Unbound("params"))?;
        let bytes = self.buffers.get(&buffer).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let size = std::mem::size_of::<RawParams>();
        if bytes.len() < size {
            return Err(BackendError::Unbound("params"));
        }
        let raw: RawParams = bytemuck::pod_read_unaligned(&bytes[..size]);
        Ok(KernelParams {
            values: raw.values,
            width: raw.width,
            height: raw.height,
        })
    }
}

fn lock(store: &TexelStore) -> std::sync::MutexGuard<'_, Vec<Texel>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GpuDevice for ReferenceDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, BackendError> {
        self.check_alive()?;
        if desc.format.is_unknown() {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }
        if desc.width == 0
            || desc.height == 0
            || desc.width > MAX_TEXTURE_SIZE
            || desc.height > MAX_TEXTURE_SIZE
            || self.faults.fail_textures
        {
            return Err(BackendError::OutOfMemory);
        }
        let handle = TextureHandle(self.allocate_id());
        let texture = RefTexture {
            desc: *desc,
            texels: Arc::new(Mutex::new(vec![[0.0; 4]; desc.texel_count()])),
            opened: false,
        };
        self.textures.insert(handle, texture);
        self.counters.textures_created += 1;
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        let Some(released) = self.textures.remove(&texture) else {
            return;
        };
        // The last reference to a shareable texture takes its handle with it
        if !released.opened && released.desc.usage.contains(TextureUsage::SHAREABLE) {
            let payload: SharedPayload = released.texels.clone();
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
        let view = ViewHandle(self.allocate_id());
        self.views.insert(view, RefView { texture });
        self.counters.read_views_created += 1;
        Ok(view)
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
        if self.faults.no_storage.contains(&format) {
            return Err(BackendError::UnsupportedFormat(format));
        }
        let view = ViewHandle(self.allocate_id());
        self.views.insert(view, RefView { texture });
        self.counters.write_views_created += 1;
        Ok(view)
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
        if self.faults.fail_buffers {
            return Err(BackendError::OutOfMemory);
        }
        let buffer = BufferHandle(self.allocate_id());
        self.buffers.insert(buffer, vec![0; size]);
        Ok(buffer)
    }

    fn write_param_buffer(&mut self, buffer: BufferHandle, bytes: &[u8]) -> Result<(), BackendError> {
        self.check_alive()?;
        let data = self.buffers.get_mut(&buffer).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if bytes.len() > data.len() {
            return Err(BackendError::Transfer(format!(
                "{} bytes do not fit a {} byte buffer",
                bytes.len(),
                data.len()
            )));
        }
        data[..bytes.len()].copy_from_slice(bytes);
        self.counters.buffer_writes += 1;
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
        if self.faults.fail_compile.contains(&kind) {
            return Err(BackendError::Compile(format!("{} rejected by fault injection", kind)));
        }
        // The kernel itself is built in; the text only has to look like a compute program
        if !source.contains("@compute") {
            return Err(BackendError::Compile(format!(
                "{}: no @compute entry point",
                kind
            )));
        }
        let program = ProgramHandle(self.allocate_id());
        self.programs.insert(program, kind);
        self.counters.programs_compiled += 1;
        log::debug!("Reference device compiled {} program", kind);
        Ok(program)
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
        let kind = *self.programs.get(&program).ok_or(BackendError::InvalidHandle {
            kind: "program",
            id: program.0,
        })?;
        let params = self.bound_params()?;
        if self.faults.fail_dispatch {
            return Err(BackendError::Transfer(format!("{} dispatch rejected by fault injection", kind)));
        }

        // Snapshot the source before touching the destination; both may
        // share storage when a texture is opened twice
        let source = match self.bindings.read {
            Some(_) => {
                let tex = self.view_texture(self.bindings.read, "read view")?;
                Some(SourceImage {
                    width: tex.desc.width,
                    height: tex.desc.height,
                    texels: lock(&tex.texels).clone(),
                })
            }
            None => None,
        };

        let target = self.view_texture(self.bindings.write, "write view")?;
        let desc = target.desc;
        let store = target.texels.clone();
        let mut texels = lock(&store);
        let mut writes = vec![0u32; desc.texel_count()];
        let mut out_of_bounds = 0u64;
        {
            let mut image = TargetImage {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                texels: &mut texels,
                writes: &mut writes,
                out_of_bounds: &mut out_of_bounds,
            };
            for _z in 0..groups_z {
                for gy in 0..groups_y {
                    for gx in 0..groups_x {
                        for ty in 0..GROUP_SIZE {
                            for tx in 0..GROUP_SIZE {
                                let id = (gx * GROUP_SIZE + tx, gy * GROUP_SIZE + ty);
                                kernels::invoke(kind, id, &params, source.as_ref(), &mut image);
                            }
                        }
                    }
                }
            }
        }
        drop(texels);

        self.counters.dispatches += 1;
        self.unsubmitted += 1;
        self.last_dispatch = Some(DispatchRecord {
            kind,
            groups: (groups_x, groups_y, groups_z),
            width: desc.width,
            height: desc.height,
            writes,
            out_of_bounds,
            had_source: source.is_some(),
        });

        if self.timing.started {
            self.timing.started = false;
            self.timing.result = Some(if self.disjoint {
                TimingReadback::Disjoint
            } else {
                TimingReadback::Elapsed(self.simulated_cost)
            });
        }
        Ok(())
    }

    fn submit(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        if self.unsubmitted > 0 {
            self.unsubmitted = 0;
            self.counters.submissions += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.submit()?;
        self.counters.flushes += 1;
        Ok(())
    }

    fn insert_fence(&mut self) -> Result<FenceHandle, BackendError> {
        self.submit()?;
        Ok(FenceHandle(self.allocate_id()))
    }

    fn fence_signaled(&mut self, _fence: FenceHandle) -> bool {
        // Work runs to completion inside dispatch
        self.counters.fence_polls += 1;
        true
    }

    fn begin_timing(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        self.timing.started = true;
        self.timing.result = None;
        Ok(())
    }

    fn end_timing(&mut self) -> Result<(), BackendError> {
        self.check_alive()?;
        if self.timing.started {
            // Nothing was dispatched between the timestamps
            self.timing.started = false;
            self.timing.result = Some(TimingReadback::Elapsed(Duration::ZERO));
        }
        self.timing.reads_until_ready = self.timing_latency;
        Ok(())
    }

    fn read_timing(&mut self) -> TimingReadback {
        if self.timing.result.is_none() {
            return TimingReadback::NotReady;
        }
        if self.timing.reads_until_ready > 0 {
            self.timing.reads_until_ready -= 1;
            return TimingReadback::NotReady;
        }
        self.timing.result.take().unwrap_or(TimingReadback::NotReady)
    }

    fn open_shared(&mut self, handle: SharedHandle) -> Result<TextureHandle, OpenSharedError> {
        if self.faults.device_lost || self.shut_down {
            return Err(OpenSharedError::DeviceLost);
        }
        let entry = self.registry.open(handle, self.info.adapter)?;
        let texels = entry
            .payload
            .downcast::<TexelStore>()
            .map_err(|_| OpenSharedError::IncompatibleAdapter(handle))?;
        let texture = TextureHandle(self.allocate_id());
        self.textures.insert(
            texture,
            RefTexture {
                desc: entry.desc,
                texels,
                opened: true,
            },
        );
        self.counters.shared_opens += 1;
        Ok(texture)
    }

    fn shared_handle(&mut self, texture: TextureHandle) -> Result<SharedHandle, BackendError> {
        let tex = self.texture(texture)?;
        if !tex.desc.usage.contains(TextureUsage::SHAREABLE) {
            return Err(BackendError::MissingUsage("sharing"));
        }
        let payload: SharedPayload = tex.texels.clone();
        if let Some(handle) = self.registry.handle_of(&payload) {
            return Ok(handle);
        }
        Ok(self.registry.register(self.info.adapter, tex.desc, payload))
    }

    fn supports_storage_write(&self, format: PixelFormat) -> bool {
        !format.is_unknown() && !self.faults.no_storage.contains(&format)
    }

    fn write_rgba8(&mut self, texture: TextureHandle, data: &[u8]) -> Result<(), BackendError> {
        let texels: Vec<Texel> = data
            .chunks_exact(4)
            .map(|p| [p[0], p[1], p[2], p[3]].map(|c| c as f32 / 255.0))
            .collect();
        self.write_texels(texture, &texels)
    }

    fn read_rgba8(&mut self, texture: TextureHandle) -> Result<Vec<u8>, BackendError> {
        let tex = self.texture(texture)?;
        let texels = lock(&tex.texels);
        Ok(texels
            .iter()
            .flat_map(|t| t.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
            .collect())
    }

    fn shutdown(&mut self) {
        let textures: Vec<TextureHandle> = self.textures.keys().copied().collect();
        for texture in textures {
            self.release_texture(texture);
        }
        self.views.clear();
        self.buffers.clear();
        self.programs.clear();
        self.bindings = Bindings::default();
        self.shut_down = true;
        log::info!("Reference device shut down");
    }
}

/// Hands out reference devices and records every creation attempt.
///
/// Clones share their state, so a test can keep one clone and give the
/// other to the engine.
#[derive(Clone)]
pub struct ReferenceProvider {
    registry: ShareRegistry,
    state: Arc<Mutex<ProviderState>>,
}

#[derive(Default)]
struct ProviderState {
    failing: HashSet<DriverKind>,
    max_level: Option<CapabilityLevel>,
    attempts: Vec<DriverKind>,
    devices: Vec<Arc<Mutex<ReferenceDevice>>>,
}

impl ReferenceProvider {
    pub fn new(registry: ShareRegistry) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(ProviderState::default())),
        }
    }

    /// Make device creation fail for `driver`
    pub fn fail(&self, driver: DriverKind) {
        self.lock().failing.insert(driver);
    }

    /// Highest capability level the simulated drivers support
    pub fn limit_level(&self, level: CapabilityLevel) {
        self.lock().max_level = Some(level);
    }

    pub fn attempts(&self) -> Vec<DriverKind> {
        self.lock().attempts.clone()
    }

    /// Every device created so far, oldest first
    pub fn devices(&self) -> Vec<Arc<Mutex<ReferenceDevice>>> {
        self.lock().devices.clone()
    }

    pub fn last_device(&self) -> Option<Arc<Mutex<ReferenceDevice>>> {
        self.lock().devices.last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeviceProvider for ReferenceProvider {
    fn create_device(&self, driver: DriverKind, levels: &[CapabilityLevel]) -> Result<SharedDevice, BackendError> {
        let mut state = self.lock();
        state.attempts.push(driver);
        if state.failing.contains(&driver) {
            return Err(BackendError::DeviceCreation(format!("{} driver unavailable", driver)));
        }
        let max = state.max_level.unwrap_or(CapabilityLevel::Full);
        let level = levels
            .iter()
            .copied()
            .find(|level| *level <= max)
            .ok_or_else(|| BackendError::DeviceCreation("no supported capability level".to_string()))?;

        let mut device = ReferenceDevice::on_adapter(self.registry.clone(), REFERENCE_ADAPTER, level);
        device.info.driver = driver;
        let device = Arc::new(Mutex::new(device));
        state.devices.push(device.clone());
        Ok(device)
    }
}
