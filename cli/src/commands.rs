use anyhow::{Context, Result};
use common::{Effect, PixelFormat};
use engine::backend::{TextureDesc, TextureHandle, TextureUsage};
use engine::{BridgeOutcome, Completion, Dispatch, EffectTarget, ShaderEngine};
use image::RgbaImage;
use std::path::Path;
use std::time::Instant;

pub fn info(engine: &mut ShaderEngine, json: bool) -> Result<()> {
    if !engine.acquire() {
        anyhow::bail!("No GPU device available");
    }
    let info = engine.device_info().context("Device disappeared after creation")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Adapter:           {}", info.adapter_name);
        println!("Backend:           {}", info.backend);
        println!("Driver:            {}", info.driver);
        println!("Capability level:  {}", info.level);
        println!("Max texture size:  {}", info.max_texture_size);
        println!(
            "Timestamp queries: {}",
            if info.timestamp_queries { "yes" } else { "no" }
        );
    }
    Ok(())
}

pub fn apply(
    engine: &mut ShaderEngine,
    effect: &Effect,
    input: &Path,
    output: &Path,
    format: PixelFormat,
) -> Result<()> {
    let image = load_image(input)?;
    let (width, height) = image.dimensions();
    let (dest, staging) = upload(engine, &image, format)?;

    let kind = effect.kind();
    let target = if kind.reads_source() {
        EffectTarget::new(dest, staging, format, PixelFormat::Unknown, width, height)
    } else {
        EffectTarget::in_place(dest, format, width, height)
    };
    expect_applied(engine.apply(effect, &target, Completion::Wait)?, kind.name())?;

    engine
        .save_texture(dest, output)
        .with_context(|| format!("Failed to save {}", output.display()))?;
    log::info!("Applied {} to {}x{} {} texture", kind, width, height, format);
    Ok(())
}

pub fn bridge(
    engine: &mut ShaderEngine,
    input: &Path,
    output: &Path,
    format: PixelFormat,
    force: bool,
) -> Result<()> {
    let image = load_image(input)?;
    let (width, height) = image.dimensions();
    let (sender, _) = upload(engine, &image, format)?;
    let handle = engine.device()?.shared_handle(sender)?;

    let outcome = engine.bridge_with(handle, width, height, force)?;
    let received = match outcome {
        BridgeOutcome::Passthrough(handle) => {
            println!("passthrough {} ({} already matches the consumer)", handle, format);
            handle
        }
        BridgeOutcome::Converted(handle) => {
            println!(
                "converted {} -> {} into {}",
                format,
                engine.bridge_state().target_format(),
                handle
            );
            handle
        }
        BridgeOutcome::Throttled => anyhow::bail!("GPU overloaded; bridge skipped"),
    };

    // Look at the texture the way the consumer would: through its handle
    let opened = engine.device()?.open_shared(received)?;
    let saved = engine
        .save_texture(opened, output)
        .with_context(|| format!("Failed to save {}", output.display()));
    engine.device()?.release_texture(opened);
    saved
}

pub fn bench(engine: &mut ShaderEngine, effect: &Effect, frames: u64, size: u32, json: bool) -> Result<()> {
    let format = PixelFormat::Rgba8Unorm;
    let dest = create_texture(engine, format, size, size)?;
    let kind = effect.kind();
    let target = if kind.reads_source() {
        let source = create_texture(engine, format, size, size)?;
        EffectTarget::new(dest, source, format, PixelFormat::Unknown, size, size)
    } else {
        EffectTarget::in_place(dest, format, size, size)
    };

    let mut applied = 0u64;
    let mut throttled = 0u64;
    let start = Instant::now();
    for _ in 0..frames {
        match engine.apply(effect, &target, Completion::Flush)? {
            Dispatch::Applied => applied += 1,
            Dispatch::Throttled => throttled += 1,
        }
    }
    let elapsed = start.elapsed();
    let stats = engine.governor_stats();

    if json {
        let report = serde_json::json!({
            "effect": kind.name(),
            "size": size,
            "frames": frames,
            "applied": applied,
            "throttled": throttled,
            "seconds": elapsed.as_secs_f64(),
            "governor": stats,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} on {}x{}: {} frames in {:.2?}", kind, size, size, frames, elapsed);
        println!("  applied:             {}", applied);
        println!("  throttled:           {}", throttled);
        println!("  last cost:           {:.3} ms", stats.last_cost_ms);
        match stats.latest_utilization {
            Some(utilization) => println!("  latest utilization:  {:.0}%", utilization),
            None => println!("  latest utilization:  unavailable"),
        }
        println!("  peak utilization:    {:.0}%", stats.peak_utilization);
        println!("  recovery threshold:  {:.0}%", stats.recovery_threshold);
        println!("  throttled now:       {}", stats.throttled);
    }
    Ok(())
}

fn load_image(path: &Path) -> Result<RgbaImage> {
    let image = image::open(path).with_context(|| format!("Failed to load image: {}", path.display()))?;
    Ok(image.to_rgba8())
}

fn create_texture(engine: &mut ShaderEngine, format: PixelFormat, width: u32, height: u32) -> Result<TextureHandle> {
    let desc = TextureDesc::new(format, width, height, TextureUsage::all());
    let texture = engine
        .device()?
        .create_texture(&desc)
        .with_context(|| format!("Failed to create {}x{} {} texture", width, height, format))?;
    Ok(texture)
}

/// Upload an image into a texture of `format`, converting on the GPU.
///
/// Returns the texture and the RGBA8 staging texture it was copied from.
fn upload(engine: &mut ShaderEngine, image: &RgbaImage, format: PixelFormat) -> Result<(TextureHandle, TextureHandle)> {
    let (width, height) = image.dimensions();
    let staging = create_texture(engine, PixelFormat::Rgba8Unorm, width, height)?;
    engine.device()?.write_rgba8(staging, image.as_raw())?;

    let texture = create_texture(engine, format, width, height)?;
    let target = EffectTarget::new(texture, staging, format, PixelFormat::Unknown, width, height);
    expect_applied(engine.apply(&Effect::Copy, &target, Completion::Flush)?, "upload")?;
    Ok((texture, staging))
}

fn expect_applied(dispatch: Dispatch, what: &str) -> Result<()> {
    match dispatch {
        Dispatch::Applied => Ok(()),
        Dispatch::Throttled => anyhow::bail!("GPU overloaded; {} skipped", what),
    }
}
