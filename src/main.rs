//! # minicomp
//!
//! Takes over the active display, shows a cleared scanout buffer composited
//! every vblank, launches a client and exits on the first key press or on
//! SIGINT/SIGTERM, restoring the previous framebuffer.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use minicomp::config::{CompositorConfig, DEFAULT_CONFIG_PATH};
use minicomp::input::{FixedChooser, KeyboardChooser, KeyboardInput, PromptChooser};
use minicomp::{Card, Compositor, DisplayPipeline, DumbAllocator, LogSink, LoopOptions};

#[derive(Parser)]
#[command(name = "minicomp")]
#[command(about = "A minimal KMS compositor core with evdev/xkb keyboard input")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// GPU device node
    #[arg(long)]
    device: Option<PathBuf>,

    /// Keyboard evdev node (skips discovery)
    #[arg(short, long)]
    keyboard: Option<PathBuf>,

    /// Keyboard to pick when several are found (skips the prompt)
    #[arg(long)]
    keyboard_index: Option<usize>,

    /// Do not launch the client
    #[arg(long)]
    no_client: bool,

    /// Keep running on key presses; stop with SIGINT/SIGTERM only
    #[arg(long)]
    no_quit_on_key: bool,
}

impl Cli {
    /// Override config with CLI flags
    fn apply(&self, config: &mut CompositorConfig) {
        if self.debug {
            config.general.debug = true;
        }
        if let Some(device) = &self.device {
            config.drm.device = device.clone();
        }
        if let Some(keyboard) = &self.keyboard {
            config.input.device = Some(keyboard.clone());
        }
        if let Some(index) = self.keyboard_index {
            config.input.keyboard_index = Some(index);
        }
        if self.no_client {
            config.client.command = None;
        }
        if self.no_quit_on_key {
            config.input.quit_on_key_press = false;
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn run(config: &CompositorConfig) -> Result<()> {
    let card = Card::open(&config.drm.device).context("Failed to open the GPU device")?;
    let allocator = DumbAllocator::for_kind(config.drm.allocator)?;
    let pipeline = DisplayPipeline::initialize(card, allocator, &config.drm)
        .context("Failed to take over the display")?;

    let mut chooser: Box<dyn KeyboardChooser> = match config.input.keyboard_index {
        Some(index) => Box::new(FixedChooser(index)),
        None => Box::new(PromptChooser::stdio()),
    };
    let keyboard = match KeyboardInput::setup(&config.input, &config.keymap, chooser.as_mut()) {
        Ok(keyboard) => keyboard,
        Err(e) => {
            // Put the previous framebuffer back before bailing out
            if let Err(restore) = pipeline.shutdown() {
                error!("{}", restore);
            }
            return Err(e).context("Failed to set up the keyboard");
        }
    };

    let mut compositor = Compositor::new(
        pipeline,
        Some(keyboard),
        LogSink::new(),
        LoopOptions::from_config(config),
    )?;
    compositor.spawn_client(&config.client);
    compositor.run()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CompositorConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    cli.apply(&mut config);
    config.validate()?;

    init_logging(config.general.debug);
    info!("Starting minicomp {}", minicomp::VERSION);

    run(&config)?;
    info!("minicomp exited cleanly");
    Ok(())
}
