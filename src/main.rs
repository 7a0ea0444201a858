// =============================================================================
// VULKAN WALKTHROUGH - The Vulkan setup sequence, one stage group per command
// =============================================================================
//
// SETUP ORDER (fixed by Vulkan itself):
// ┌─────────────────────────────────────────────────────────────────┐
// │  Window ─> Instance ─> Surface ─> Physical device ─> Device     │
// │    └─> Swapchain + image views ─> Render pass ─> Framebuffers   │
// │          └─> Command pool + buffers ─> Semaphores + fence       │
// │                └─> acquire / submit / wait / present            │
// └─────────────────────────────────────────────────────────────────┘
//
// COMMANDS:
//   layers   instance layers and extensions
//   devices  everything each physical device reports
//   formats  image format support on the selected device
//   probe    buffers, images, memory and command buffers, no window
//   window   an empty window
//   surface  what the window surface supports
//   clear    the full pipeline, clearing every frame (default)
//
// =============================================================================

mod app;
mod backend;
mod config;
mod inspect;
mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, DEFAULT_CONFIG_PATH};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vkwalk")]
#[command(about = "Walk through the Vulkan setup sequence, one stage group per command.", long_about = None)]
struct Args {
    /// Configuration file, missing means defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the physical device at this enumeration index
    #[arg(long)]
    device: Option<usize>,

    /// Do not request the validation layer
    #[arg(long)]
    no_validation: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List instance layers and extensions
    Layers,
    /// Report every physical device
    Devices,
    /// Image format support on the selected device
    Formats,
    /// Create and destroy buffers, images, memory and command buffers
    Probe,
    /// Open an empty window until it is closed
    Window,
    /// Report what the window surface supports
    Surface,
    /// Clear and present frames until the window is closed
    Clear(ClearArgs),
}

#[derive(clap::Args, Debug, Default)]
struct ClearArgs {
    /// Exit after presenting this many frames
    #[arg(long)]
    frames: Option<u64>,

    #[arg(long, value_enum)]
    present_mode: Option<PresentModeArg>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PresentModeArg {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl PresentModeArg {
    /// Spelling used in config.toml
    fn config_name(self) -> &'static str {
        match self {
            PresentModeArg::Immediate => "immediate",
            PresentModeArg::Mailbox => "mailbox",
            PresentModeArg::Fifo => "fifo",
            PresentModeArg::FifoRelaxed => "fifo_relaxed",
        }
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    // Logging needs the config, so the load outcome is reported once logging is up
    let (mut config, loaded) = match Config::load_from_path(&args.config) {
        Ok((config, source)) => (config, Ok(source)),
        Err(e) => (Config::default(), Err(e)),
    };
    apply_overrides(&mut config, &args);

    init_logging(&config)?;
    match loaded {
        Ok(source) => {
            log::info!("{}", source.describe(&args.config));
            log::debug!("Config: {:?}", config);
        }
        Err(e) => log::warn!("{:#}. Using defaults.", e),
    }
    log::info!("Starting vkwalk");

    match args.command {
        Some(Command::Layers) => inspect::layers(&config, &mut std::io::stdout().lock()),
        Some(Command::Devices) => inspect::devices(&config, &mut std::io::stdout().lock()),
        Some(Command::Formats) => inspect::formats(&config, &mut std::io::stdout().lock()),
        Some(Command::Probe) => inspect::probe(&config, &mut std::io::stdout().lock()),
        Some(Command::Window) => app::run(config, app::RunMode::Window),
        Some(Command::Surface) => app::run(config, app::RunMode::Surface),
        Some(Command::Clear(_)) | None => {
            log::info!(
                "Window: {}x{}, present mode: {}",
                config.window.width,
                config.window.height,
                config.graphics.present_mode
            );
            app::run(config, app::RunMode::Clear)
        }
    }
}

/// Command line flags win over config.toml
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(index) = args.device {
        config.device.index = Some(index);
    }
    if args.no_validation {
        config.debug.validation_layers = false;
    }
    if let Some(Command::Clear(clear)) = &args.command {
        if let Some(frames) = clear.frames {
            config.graphics.frame_limit = Some(frames);
        }
        if let Some(mode) = clear.present_mode {
            config.graphics.present_mode = mode.config_name().to_string();
        }
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    // RUST_LOG still wins
    builder.parse_default_env();

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        writeln!(file, "=== Vulkan Walkthrough Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Failed to initialize logger")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn no_command_means_clear() {
        let args = parse(&["vkwalk"]);
        assert!(args.command.is_none());
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn global_flags_override_config() {
        let args = parse(&["vkwalk", "--device", "1", "--no-validation", "devices"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.device.index, Some(1));
        assert!(!config.debug.validation_layers);
        assert!(!config.enable_validation());
        assert!(matches!(args.command, Some(Command::Devices)));
    }

    #[test]
    fn clear_flags_override_graphics() {
        let args = parse(&["vkwalk", "clear", "--frames", "3", "--present-mode", "fifo-relaxed"]);
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.graphics.frame_limit, Some(3));
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
    }

    #[test]
    fn untouched_config_keeps_file_values() {
        let args = parse(&["vkwalk", "probe"]);
        let mut config = Config::from_toml_str("[device]\nindex = 2\n").unwrap();
        apply_overrides(&mut config, &args);
        assert_eq!(config.device.index, Some(2));
        assert!(config.debug.validation_layers);
        assert_eq!(config.graphics.frame_limit, None);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Args::try_parse_from(["vkwalk", "triangle"]).is_err());
        assert!(Args::try_parse_from(["vkwalk", "clear", "--present-mode", "vsync"]).is_err());
    }

    #[test]
    fn every_present_mode_arg_maps_to_config() {
        for arg in PresentModeArg::value_variants() {
            let mut config = Config::default();
            config.graphics.present_mode = arg.config_name().to_string();
            let expected = match arg {
                PresentModeArg::Immediate => vk::PresentModeKHR::IMMEDIATE,
                PresentModeArg::Mailbox => vk::PresentModeKHR::MAILBOX,
                PresentModeArg::Fifo => vk::PresentModeKHR::FIFO,
                PresentModeArg::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            };
            assert_eq!(config.get_present_mode(), expected);
        }
    }
}
