use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Effect, PixelFormat};
use engine::backend::{
    AdapterId, CapabilityLevel, DriverKind, GpuDevice, OpenSharedError, ReferenceDevice, ReferenceProvider,
    ShareRegistry, SharedDevice, TextureDesc, TextureHandle, TextureUsage,
};
use engine::governor::{UtilizationCounter, UtilizationSampler};
use engine::{BridgeOutcome, Completion, Dispatch, EffectTarget, EngineConfig, EngineError, ShaderEngine};

/// Utilization counter the test can turn up and down
struct Dial(Arc<AtomicU64>);

impl UtilizationCounter for Dial {
    fn collect(&mut self) -> Option<f64> {
        Some(self.0.load(Ordering::SeqCst) as f64)
    }
}

fn engine() -> (ShaderEngine, ReferenceProvider) {
    let provider = ReferenceProvider::new(ShareRegistry::new());
    let mut engine = ShaderEngine::with_provider(EngineConfig::default(), Box::new(provider.clone())).unwrap();
    engine.set_utilization_sampler(UtilizationSampler::unavailable());
    (engine, provider)
}

fn reference(provider: &ReferenceProvider) -> Arc<Mutex<ReferenceDevice>> {
    provider.last_device().expect("engine created no device")
}

fn texture(engine: &mut ShaderEngine, format: PixelFormat, width: u32, height: u32) -> TextureHandle {
    let desc = TextureDesc::new(format, width, height, TextureUsage::all());
    engine.device().unwrap().create_texture(&desc).unwrap()
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| {
            let (x, y) = (i % width, i / width);
            [(x * 7) as u8, (y * 11) as u8, (x + y) as u8, 255]
        })
        .collect()
}

#[test]
fn test_identity_caching_skips_view_rebuild() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 64, 48);
    let source = texture(&mut engine, PixelFormat::Rgba8Unorm, 64, 48);
    let target = EffectTarget::new(dest, source, PixelFormat::Rgba8Unorm, PixelFormat::Rgba8Unorm, 64, 48);

    engine.copy(&target).unwrap();
    engine.copy(&target).unwrap();
    assert_eq!(engine.binder().views_created(), 2);

    let counters = reference(&provider).lock().unwrap().counters();
    assert_eq!(counters.read_views_created, 1);
    assert_eq!(counters.write_views_created, 1);
    assert_eq!(counters.dispatches, 2);
}

#[test]
fn test_parameter_upload_only_on_change() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 32, 32);
    let source = texture(&mut engine, PixelFormat::Rgba8Unorm, 32, 32);
    let target = EffectTarget::new(dest, source, PixelFormat::Rgba8Unorm, PixelFormat::Unknown, 32, 32);

    engine.blur(&target, 2.0).unwrap();
    engine.blur(&target, 2.0).unwrap();
    assert_eq!(engine.binder().param_uploads(), 1);

    engine.blur(&target, 2.5).unwrap();
    assert_eq!(engine.binder().param_uploads(), 2);
    assert_eq!(reference(&provider).lock().unwrap().counters().buffer_writes, 2);
}

#[test]
fn test_odd_sizes_cover_every_pixel_once() {
    let (mut engine, provider) = engine();
    for (width, height) in [(17, 9), (1, 1), (33, 47), (100, 3)] {
        let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, width, height);
        let source = texture(&mut engine, PixelFormat::Rgba8Unorm, width, height);
        let target = EffectTarget::new(dest, source, PixelFormat::Rgba8Unorm, PixelFormat::Rgba8Unorm, width, height);
        engine.copy(&target).unwrap();

        let device = reference(&provider);
        let device = device.lock().unwrap();
        let record = device.last_dispatch().unwrap();
        assert_eq!(record.groups, (width.div_ceil(16), height.div_ceil(16), 1));
        assert!(record.covers_exactly_once(), "{}x{} not covered exactly once", width, height);
        assert_eq!(record.out_of_bounds, 0);
    }
}

#[test]
fn test_copy_and_swap_move_pixels() {
    let (mut engine, _provider) = engine();
    let pixels = gradient(20, 10);
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 20, 10);
    let source = texture(&mut engine, PixelFormat::Rgba8Unorm, 20, 10);
    engine.device().unwrap().write_rgba8(source, &pixels).unwrap();

    let target = EffectTarget::new(dest, source, PixelFormat::Rgba8Unorm, PixelFormat::Unknown, 20, 10);
    engine.apply(&Effect::Copy, &target, Completion::Wait).unwrap();
    assert_eq!(engine.device().unwrap().read_rgba8(dest).unwrap(), pixels);

    let in_place = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 20, 10);
    engine.swap(&in_place).unwrap();
    let swapped = engine.device().unwrap().read_rgba8(dest).unwrap();
    assert_eq!(&swapped[..4], &[pixels[2], pixels[1], pixels[0], pixels[3]]);
}

#[test]
fn test_flip_twice_restores_image() {
    let (mut engine, _provider) = engine();
    let pixels = gradient(8, 7);
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 8, 7);
    engine.device().unwrap().write_rgba8(dest, &pixels).unwrap();
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 8, 7);

    engine.flip(&target, false).unwrap();
    let flipped = engine.device().unwrap().read_rgba8(dest).unwrap();
    let row = 8 * 4;
    assert_eq!(&flipped[..row], &pixels[6 * row..7 * row]);
    // The middle row of an odd height stays put
    assert_eq!(&flipped[3 * row..4 * row], &pixels[3 * row..4 * row]);

    engine.flip(&target, false).unwrap();
    assert_eq!(engine.device().unwrap().read_rgba8(dest).unwrap(), pixels);
}

#[test]
fn test_completion_modes() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);

    // Async still hands the work to the queue, it just does not push or wait
    engine.apply(&Effect::Swap, &target, Completion::Async).unwrap();
    {
        let device = reference(&provider);
        let device = device.lock().unwrap();
        assert_eq!(device.unsubmitted(), 0);
        let counters = device.counters();
        assert_eq!(counters.submissions, 1);
        assert_eq!(counters.flushes, 0);
        assert_eq!(counters.fence_polls, 0);
    }

    engine.apply(&Effect::Swap, &target, Completion::Flush).unwrap();
    engine.apply(&Effect::Swap, &target, Completion::Wait).unwrap();
    let counters = reference(&provider).lock().unwrap().counters();
    assert_eq!(counters.submissions, 3);
    assert_eq!(counters.flushes, 1);
    assert!(counters.fence_polls >= 1);
}

#[test]
fn test_convenience_effects_reach_the_queue() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);

    engine.swap(&target).unwrap();
    engine.blur(&target, 1.5).unwrap();
    engine.flip(&target, true).unwrap();

    let device = reference(&provider);
    let device = device.lock().unwrap();
    assert_eq!(device.unsubmitted(), 0);
    assert_eq!(device.counters().submissions, 3);
}

#[test]
fn test_call_boundary_failures() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);

    let mut target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);
    target.dest = None;
    assert_eq!(engine.swap(&target), Err(EngineError::MissingDestination));

    // A handle the device does not know is a null destination too
    let unknown = EffectTarget::in_place(TextureHandle(999), PixelFormat::Rgba8Unorm, 16, 16);
    assert_eq!(engine.swap(&unknown), Err(EngineError::MissingDestination));

    engine.set_shader_source(common::EffectKind::Swap, String::new());
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);
    assert_eq!(engine.swap(&target), Err(EngineError::EmptySource(common::EffectKind::Swap)));

    reference(&provider)
        .lock()
        .unwrap()
        .faults_mut()
        .fail_compile
        .insert(common::EffectKind::Flip);
    assert!(matches!(engine.flip(&target, false), Err(EngineError::Compile { .. })));
    reference(&provider).lock().unwrap().faults_mut().fail_compile.clear();
    assert_eq!(engine.flip(&target, false), Ok(Dispatch::Applied));
}

#[test]
fn test_no_device_is_reported_not_fatal() {
    let provider = ReferenceProvider::new(ShareRegistry::new());
    for driver in DriverKind::PROBE_ORDER {
        provider.fail(driver);
    }
    let mut engine = ShaderEngine::with_provider(EngineConfig::default(), Box::new(provider.clone())).unwrap();
    let target = EffectTarget::in_place(TextureHandle(1), PixelFormat::Rgba8Unorm, 4, 4);

    assert_eq!(engine.swap(&target), Err(EngineError::NoDevice));
    assert_eq!(engine.swap(&target), Err(EngineError::NoDevice));
    // Probed once, not on every call
    assert_eq!(provider.attempts().len(), 3);
}

#[test]
fn test_update_resources_rebuilds_views() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba16Float, 24, 12);
    let source = texture(&mut engine, PixelFormat::Rgba8Unorm, 24, 12);

    engine.update_resources(Some(dest), Some(source)).unwrap();
    engine.update_resources(Some(dest), Some(source)).unwrap();

    let counters = reference(&provider).lock().unwrap().counters();
    assert_eq!(counters.write_views_created, 2);
    assert_eq!(counters.read_views_created, 2);
    assert_eq!(
        engine.binder().dest_identity().map(|i| (i.format, i.width, i.height)),
        Some((PixelFormat::Rgba16Float, 24, 12))
    );
    assert_eq!(engine.update_resources(None, None), Err(EngineError::MissingDestination));
}

#[test]
fn test_passthrough_is_idempotent() {
    let (mut engine, provider) = engine();
    let sender = texture(&mut engine, PixelFormat::Bgra8Unorm, 64, 64);
    let handle = engine.device().unwrap().shared_handle(sender).unwrap();

    for _ in 0..3 {
        assert_eq!(engine.bridge_with(handle, 64, 64, false), Ok(BridgeOutcome::Passthrough(handle)));
    }
    assert_eq!(engine.bridge_state().conversions(), 0);

    let counters = reference(&provider).lock().unwrap().counters();
    assert_eq!(counters.dispatches, 0);
    // Only the first call had to look at the texture
    assert_eq!(counters.shared_opens, 1);
}

#[test]
fn test_forced_conversion_returns_new_handle() {
    let (mut engine, provider) = engine();
    let sender = texture(&mut engine, PixelFormat::Bgra8Unorm, 32, 32);
    let handle = engine.device().unwrap().shared_handle(sender).unwrap();

    let outcome = engine.bridge_with(handle, 32, 32, true).unwrap();
    let BridgeOutcome::Converted(converted) = outcome else {
        panic!("expected conversion, got {:?}", outcome);
    };
    assert_ne!(converted, handle);
    assert_eq!(engine.bridge_state().conversions(), 1);
    assert_eq!(reference(&provider).lock().unwrap().counters().dispatches, 1);
}

#[test]
fn test_bridge_scenario_reallocates_on_resize() {
    let (mut engine, provider) = engine();
    let pixels = gradient(1920, 1080);
    let source = texture(&mut engine, PixelFormat::Rgba8Unorm, 1920, 1080);
    let handle = {
        let mut device = engine.device().unwrap();
        device.write_rgba8(source, &pixels).unwrap();
        device.shared_handle(source).unwrap()
    };

    let first = engine.bridge_with(handle, 1920, 1080, false).unwrap();
    let BridgeOutcome::Converted(converted) = first else {
        panic!("expected conversion, got {:?}", first);
    };
    assert_ne!(converted, handle);
    assert_eq!(engine.bridge_state().intermediates_created(), 1);

    // The consumer sees the same pixels in the other layout
    let intermediate = engine.bridge_state().intermediate().unwrap();
    {
        let mut device = engine.device().unwrap();
        assert_eq!(device.texture_desc(intermediate).unwrap().format, PixelFormat::Bgra8Unorm);
        assert_eq!(device.read_rgba8(intermediate).unwrap(), pixels);
    }

    let textures_before = reference(&provider).lock().unwrap().counters().textures_created;
    assert_eq!(engine.bridge_with(handle, 1920, 1080, false), Ok(BridgeOutcome::Converted(converted)));
    assert_eq!(engine.bridge_state().intermediates_created(), 1);
    assert_eq!(
        reference(&provider).lock().unwrap().counters().textures_created,
        textures_before
    );

    let smaller = texture(&mut engine, PixelFormat::Rgba8Unorm, 1280, 720);
    let smaller_handle = engine.device().unwrap().shared_handle(smaller).unwrap();
    let resized = engine.bridge_with(smaller_handle, 1280, 720, false).unwrap();
    assert!(matches!(resized, BridgeOutcome::Converted(_)));
    assert_eq!(engine.bridge_state().intermediates_created(), 2);
}

#[test]
fn test_unopenable_handles_fail_the_call() {
    let registry = ShareRegistry::new();
    let provider = ReferenceProvider::new(registry.clone());
    let mut engine = ShaderEngine::with_provider(EngineConfig::default(), Box::new(provider.clone())).unwrap();
    engine.set_utilization_sampler(UtilizationSampler::unavailable());

    let mut other = ReferenceDevice::on_adapter(registry.clone(), AdapterId(42), CapabilityLevel::Full);
    let foreign = other
        .create_texture(&TextureDesc::new(PixelFormat::Rgba8Unorm, 8, 8, TextureUsage::all()))
        .unwrap();
    let foreign_handle = other.shared_handle(foreign).unwrap();

    assert_eq!(
        engine.bridge_with(foreign_handle, 8, 8, false),
        Err(EngineError::OpenShared(OpenSharedError::IncompatibleAdapter(foreign_handle)))
    );
    assert!(matches!(
        engine.bridge_with(engine::backend::SharedHandle(0xdead), 8, 8, false),
        Err(EngineError::OpenShared(OpenSharedError::UnknownHandle(_)))
    ));
}

#[test]
fn test_bridge_requires_typed_store_support() {
    let (mut engine, provider) = engine();
    let sender = texture(&mut engine, PixelFormat::Rgba8Unorm, 8, 8);
    let handle = engine.device().unwrap().shared_handle(sender).unwrap();
    reference(&provider)
        .lock()
        .unwrap()
        .faults_mut()
        .no_storage
        .insert(PixelFormat::Bgra8Unorm);

    assert_eq!(
        engine.bridge_with(handle, 8, 8, false),
        Err(EngineError::UnsupportedFormat(PixelFormat::Bgra8Unorm))
    );
    // The sender plus the source the bridge holds open; no intermediate was made
    assert!(engine.bridge_state().intermediate().is_none());
    let device = reference(&provider);
    let device = device.lock().unwrap();
    assert_eq!(device.live_textures(), 2);
}

#[test]
fn test_repeated_conversion_keeps_views() {
    let (mut engine, provider) = engine();
    let sender = texture(&mut engine, PixelFormat::Rgba8Unorm, 64, 64);
    let handle = engine.device().unwrap().shared_handle(sender).unwrap();

    for _ in 0..5 {
        let outcome = engine.bridge_with(handle, 64, 64, false).unwrap();
        assert!(matches!(outcome, BridgeOutcome::Converted(_)), "{:?}", outcome);
    }
    assert_eq!(engine.bridge_state().conversions(), 5);
    assert_eq!(engine.binder().views_created(), 2);

    let device = reference(&provider);
    let device = device.lock().unwrap();
    let counters = device.counters();
    assert_eq!(counters.read_views_created, 1);
    assert_eq!(counters.write_views_created, 1);
    assert_eq!(counters.shared_opens, 5);
    // Sender, intermediate and the one source kept open
    assert_eq!(device.live_textures(), 3);
}

#[test]
fn test_source_change_behind_same_handle() {
    let registry = ShareRegistry::new();
    let provider = ReferenceProvider::new(registry.clone());
    let mut engine = ShaderEngine::with_provider(EngineConfig::default(), Box::new(provider.clone())).unwrap();
    engine.set_utilization_sampler(UtilizationSampler::unavailable());

    let sender = texture(&mut engine, PixelFormat::Rgba8Unorm, 64, 64);
    let handle = engine.device().unwrap().shared_handle(sender).unwrap();
    assert!(matches!(engine.bridge_with(handle, 64, 64, false), Ok(BridgeOutcome::Converted(_))));
    let first = engine.bridge_state().intermediate().unwrap();

    // The producer recreates its surface smaller but keeps the handle
    let pixels = gradient(32, 24);
    let smaller = texture(&mut engine, PixelFormat::Rgba8Unorm, 32, 24);
    let smaller_handle = {
        let mut device = engine.device().unwrap();
        device.write_rgba8(smaller, &pixels).unwrap();
        device.shared_handle(smaller).unwrap()
    };
    assert!(registry.retarget(handle, smaller_handle));

    assert!(matches!(engine.bridge_with(handle, 32, 24, false), Ok(BridgeOutcome::Converted(_))));
    let second = engine.bridge_state().intermediate().unwrap();
    assert_ne!(second, first);
    assert_eq!(engine.bridge_state().intermediates_created(), 2);
    assert_eq!(engine.device().unwrap().read_rgba8(second).unwrap(), pixels);
    {
        let device = reference(&provider);
        let device = device.lock().unwrap();
        assert_eq!(device.counters().read_views_created, 2);
        assert_eq!(device.counters().write_views_created, 2);
        // The old intermediate and the old opened source are gone
        assert_eq!(device.live_textures(), 4);
    }

    // Same size, other format: still a new intermediate and new views
    let wide = texture(&mut engine, PixelFormat::Rgba16Float, 32, 24);
    let wide_handle = engine.device().unwrap().shared_handle(wide).unwrap();
    assert!(registry.retarget(handle, wide_handle));

    assert!(matches!(engine.bridge_with(handle, 32, 24, false), Ok(BridgeOutcome::Converted(_))));
    assert_ne!(engine.bridge_state().intermediate().unwrap(), second);
    assert_eq!(engine.bridge_state().intermediates_created(), 3);
    assert_eq!(
        engine.binder().source_identity().map(|i| i.handle),
        engine.bridge_state().source()
    );
    let counters = reference(&provider).lock().unwrap().counters();
    assert_eq!(counters.read_views_created, 3);
    assert_eq!(counters.write_views_created, 3);
}

#[test]
fn test_failed_dispatch_discards_measurement() {
    let (mut engine, provider) = engine();
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);

    for _ in 0..120 {
        engine.swap(&target).unwrap();
    }
    // Frame 120 is a measurement frame
    reference(&provider).lock().unwrap().faults_mut().fail_dispatch = true;
    assert!(engine.swap(&target).is_err());
    assert!(!engine.governor().is_read_pending());
    assert_eq!(engine.governor().frame(), 120);

    reference(&provider).lock().unwrap().faults_mut().fail_dispatch = false;
    engine.swap(&target).unwrap();
    assert!(engine.governor().is_read_pending());
}

#[test]
fn test_throttle_hysteresis_end_to_end() {
    let (mut engine, provider) = engine();
    let utilization = Arc::new(AtomicU64::new(90));
    engine.set_utilization_sampler(UtilizationSampler::ready(Box::new(Dial(utilization.clone()))));

    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);
    reference(&provider)
        .lock()
        .unwrap()
        .set_simulated_cost(Duration::from_millis(6));

    // Measured on frames 120 and 240, read back 8 frames later
    for frame in 0..249 {
        assert_eq!(engine.swap(&target), Ok(Dispatch::Applied));
        if frame == 200 {
            assert_eq!(engine.governor().excess_streak(), 1);
            assert!(!engine.is_throttled());
        }
    }
    assert!(engine.is_throttled());
    assert_eq!(engine.peak_utilization(), 90.0);
    assert_eq!(engine.recovery_threshold(), 70.0);
    assert_eq!(engine.last_cost(), Duration::from_millis(6));

    let dispatches = reference(&provider).lock().unwrap().counters().dispatches;
    assert_eq!(engine.swap(&target), Ok(Dispatch::Throttled));
    assert_eq!(reference(&provider).lock().unwrap().counters().dispatches, dispatches);

    utilization.store(60, Ordering::SeqCst);
    let mut vetoed = 1;
    while engine.swap(&target) == Ok(Dispatch::Throttled) {
        vetoed += 1;
        assert!(vetoed <= 121, "throttle never released");
    }
    assert!(!engine.is_throttled());
    assert_eq!(engine.latest_utilization(), Some(60.0));
}

#[test]
fn test_cheap_measurement_resets_streak() {
    let (mut engine, provider) = engine();
    engine.set_utilization_sampler(UtilizationSampler::ready(Box::new(Dial(Arc::new(AtomicU64::new(90))))));
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);
    let device = reference(&provider);
    device.lock().unwrap().set_simulated_cost(Duration::from_millis(6));

    for frame in 0..489 {
        if frame == 130 {
            device.lock().unwrap().set_simulated_cost(Duration::from_millis(1));
        }
        if frame == 250 {
            device.lock().unwrap().set_simulated_cost(Duration::from_millis(6));
        }
        assert_eq!(engine.swap(&target), Ok(Dispatch::Applied));
        if frame == 300 {
            assert!(!engine.is_throttled());
            assert_eq!(engine.governor().excess_streak(), 0);
        }
    }
    // 6 ms read at 128, 1 ms at 248, 6 ms at 368 and 488
    assert!(engine.is_throttled());
    assert_eq!(engine.swap(&target), Ok(Dispatch::Throttled));
}

#[test]
fn test_disjoint_timing_never_throttles() {
    let (mut engine, provider) = engine();
    engine.set_utilization_sampler(UtilizationSampler::ready(Box::new(Dial(Arc::new(AtomicU64::new(99))))));
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    let target = EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16);
    {
        let device = reference(&provider);
        let mut device = device.lock().unwrap();
        device.set_simulated_cost(Duration::from_millis(50));
        device.set_disjoint(true);
    }
    for _ in 0..600 {
        engine.swap(&target).unwrap();
    }
    assert!(!engine.is_throttled());
    assert_eq!(engine.last_cost(), Duration::ZERO);
}

#[test]
fn test_adopted_device_survives_close() {
    let registry = ShareRegistry::new();
    let provider = ReferenceProvider::new(registry.clone());
    let external = Arc::new(Mutex::new(ReferenceDevice::new(registry)));
    let shared: SharedDevice = external.clone();

    let mut engine = ShaderEngine::adopt(EngineConfig::default(), Box::new(provider.clone()), shared).unwrap();
    engine.set_utilization_sampler(UtilizationSampler::unavailable());
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 16, 16);
    engine.swap(&EffectTarget::in_place(dest, PixelFormat::Rgba8Unorm, 16, 16)).unwrap();

    engine.close();
    engine.close();
    drop(engine);

    let device = external.lock().unwrap();
    assert!(!device.is_shut_down());
    // Engine-made resources are gone; the caller's texture is not
    assert_eq!(device.live_views(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.live_textures(), 1);
    assert!(provider.attempts().is_empty());
}

#[test]
fn test_owned_device_is_shut_down_on_drop() {
    let (mut engine, provider) = engine();
    assert!(engine.acquire());
    drop(engine);
    assert!(reference(&provider).lock().unwrap().is_shut_down());
}

#[test]
fn test_save_texture_writes_png() {
    let (mut engine, _provider) = engine();
    let pixels = gradient(6, 5);
    let dest = texture(&mut engine, PixelFormat::Rgba8Unorm, 6, 5);
    engine.device().unwrap().write_rgba8(dest, &pixels).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    engine.save_texture(dest, &path).unwrap();

    let saved = image::open(&path).unwrap().to_rgba8();
    assert_eq!(saved.dimensions(), (6, 5));
    assert_eq!(saved.into_raw(), pixels);
}
