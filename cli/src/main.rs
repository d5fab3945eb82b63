mod commands;
mod config;
mod macros;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Effect, EffectKind, PixelFormat};
use engine::ShaderEngine;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "texfx")]
#[command(about = "GPU texture effects and cross-API texture bridge", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/texfx/config.toml)
    #[arg(short, long, global = true, env = "TEXFX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the GPU device effects would run on
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one effect over an image
    Apply {
        /// Effect name (copy, flip, mirror, swap, blur, sharpen, adaptive-sharpen, adjust, temperature)
        effect: String,

        /// Image to read
        #[arg(short, long)]
        input: PathBuf,

        /// Image to write (format from the extension)
        #[arg(short, long)]
        output: PathBuf,

        /// Texture format the effect runs in
        #[arg(short, long, default_value = "rgba8unorm")]
        format: String,

        /// Effect parameter as key=value (e.g. amount=2.5), repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Share an image texture and show what the consuming API would receive
    Bridge {
        /// Image to read
        #[arg(short, long)]
        input: PathBuf,

        /// Image to write from the bridged texture
        #[arg(short, long)]
        output: PathBuf,

        /// Format of the shared source texture
        #[arg(short, long, default_value = "rgba8unorm")]
        format: String,

        /// Convert even when the source is already in the target layout
        #[arg(long)]
        force: bool,
    },

    /// Run an effect for many frames and report the load governor state
    Bench {
        /// Effect name
        effect: String,

        /// Number of frames to run
        #[arg(short = 'n', long, default_value = "600")]
        frames: u64,

        /// Square texture size in pixels
        #[arg(short, long)]
        size: Option<u32>,

        /// Effect parameter as key=value, repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::Config::default_config_path()?,
    };
    let config = config::Config::load_from_path(&config_path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.general.log_level.as_str()))
        .init();

    if config_path.exists() {
        log::info!("Loaded configuration from {}", config_path.display());
    } else {
        log::info!(
            "Config file not found at {}, using defaults",
            config_path.display()
        );
    }

    let mut engine = ShaderEngine::new(config.engine.clone()).context("Failed to create shader engine")?;

    match cli.command {
        Commands::Info { json } => commands::info(&mut engine, json),
        Commands::Apply {
            effect,
            input,
            output,
            format,
            params,
        } => {
            let effect = parse_effect(&effect, &params)?;
            let format = parse_format(&format)?;
            commands::apply(&mut engine, &effect, &input, &output, format)
        }
        Commands::Bridge {
            input,
            output,
            format,
            force,
        } => {
            let format = parse_format(&format)?;
            commands::bridge(&mut engine, &input, &output, format, force)
        }
        Commands::Bench {
            effect,
            frames,
            size,
            params,
            json,
        } => {
            let effect = parse_effect(&effect, &params)?;
            let size = size.unwrap_or(config.general.bench_size);
            commands::bench(&mut engine, &effect, frames, size, json)
        }
    }
}

fn parse_effect(name: &str, params: &[String]) -> Result<Effect> {
    let kind = EffectKind::from_str(name).with_context(|| {
        let names: Vec<&str> = EffectKind::ALL.iter().map(|k| k.name()).collect();
        format!("Unknown effect: {} (expected one of: {})", name, names.join(", "))
    })?;
    let effect = Effect::from_args(kind, params).with_context(|| format!("Invalid parameters for {}", kind))?;
    Ok(effect.clamped())
}

fn parse_format(name: &str) -> Result<PixelFormat> {
    PixelFormat::from_str(name).with_context(|| format!("Unknown pixel format: {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_effect() {
        let effect = parse_effect("blur", &["amount=3".to_string()]).unwrap();
        assert_eq!(effect, Effect::Blur { amount: 3.0 });

        // Out of range values are clamped
        let effect = parse_effect("temperature", &["kelvin=20000".to_string()]).unwrap();
        assert_eq!(effect, Effect::Temperature { kelvin: 9500.0 });

        assert!(parse_effect("sepia", &[]).is_err());
        assert!(parse_effect("blur", &["radius=2".to_string()]).is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("bgra8").unwrap(), PixelFormat::Bgra8Unorm);
        assert_eq!(parse_format("rgba16f").unwrap(), PixelFormat::Rgba16Float);
        assert!(parse_format("nv12").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "texfx", "apply", "blur", "-i", "in.png", "-o", "out.png", "-p", "amount=2",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply { effect, params, format, .. } => {
                assert_eq!(effect, "blur");
                assert_eq!(params, vec!["amount=2".to_string()]);
                assert_eq!(format, "rgba8unorm");
            }
            _ => panic!("Wrong command type"),
        }
    }
}
