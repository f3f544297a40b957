//! # minicomp
//!
//! Core of a minimal Wayland compositor on bare KMS: takes over the active
//! display plane, composites client surfaces into a CPU-mapped scanout buffer
//! once per vblank, and turns a grabbed evdev keyboard into XKB-annotated key
//! events.
//!
//! ## Architecture
//!
//! - `kms`: atomic mode-setting, plane takeover, page-flip commit loop
//! - `renderer`: per-flip software compositing into the scanout buffer
//! - `surface`: double-buffered client surfaces
//! - `input`: keyboard discovery, keymap compilation and export, key state
//! - `compositor`: calloop event loop tying the above together
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use minicomp::{Card, Compositor, CompositorConfig, DisplayPipeline, DumbAllocator, LogSink, LoopOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CompositorConfig::default();
//!     let card = Card::open(&config.drm.device)?;
//!     let allocator = DumbAllocator::for_kind(config.drm.allocator)?;
//!     let pipeline = DisplayPipeline::initialize(card, allocator, &config.drm)?;
//!     let compositor = Compositor::new(pipeline, None, LogSink::new(), LoopOptions::from_config(&config))?;
//!     compositor.run()
//! }
//! ```

pub mod compositor;
pub mod config;
pub mod error;
pub mod input;
pub mod kms;
pub mod renderer;
pub mod surface;

// Re-export main types for easy access
pub use compositor::{ClientSink, Compositor, FlipHandler, LogSink, LoopOptions};
pub use config::CompositorConfig;
pub use error::{CompositorError, Result};
pub use input::{InputEvent, KeyboardInput, KeyboardState};
pub use kms::{Card, DisplayPipeline, DumbAllocator, KmsDevice, ScanoutAllocator};
pub use renderer::{copy_pixels, FrameCompositor};
pub use surface::{PixelBuffer, Surface, SurfaceId, SurfaceStore};

/// Version information for minicomp
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
