//! Error types shared by the display pipeline, compositor and input subsystem

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::surface::SurfaceId;

/// Errors raised by the compositor core.
///
/// Setup failures (`is_fatal() == true`) are returned from the `initialize`/
/// `open` calls and abort startup. Everything else is per-frame or per-event
/// and is logged by the caller.
#[derive(Error, Debug)]
pub enum CompositorError {
    #[error("failed to open {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("atomic mode-setting unsupported by the GPU device: {0}")]
    AtomicUnsupported(#[source] io::Error),

    #[error("no plane is bound to an active output")]
    NoActivePlane,

    #[error("plane {plane} has no {name} property")]
    MissingProperty { plane: u32, name: &'static str },

    #[error("plane {0} has no framebuffer bound; cannot derive scanout size")]
    NoScanoutMode(u32),

    #[error("scanout buffer allocation failed ({stage}): {source}")]
    Allocation {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} scanout allocation is not supported")]
    UnsupportedAllocator(crate::kms::AllocatorKind),

    #[error("atomic commit of framebuffer {fb} failed: {source}")]
    CommitFailed {
        fb: u32,
        #[source]
        source: io::Error,
    },

    #[error("GPU device error: {0}")]
    Device(#[source] io::Error),

    #[error("no keyboard found")]
    NoKeyboardFound,

    #[error("keyboard selection {index} out of range (0..{count})")]
    InvalidKeyboardSelection { index: usize, count: usize },

    #[error("keyboard discovery failed: {0}")]
    Discovery(#[source] io::Error),

    #[error("failed to open keyboard {path}: {source}")]
    KeyboardOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot compile XKB keymap (rules={rules:?}, model={model:?}, layout={layout:?}, variant={variant:?}, options={options:?})")]
    KeymapCompile {
        rules: String,
        model: String,
        layout: String,
        variant: String,
        options: Option<String>,
    },

    #[error("XDG_RUNTIME_DIR is not set")]
    RuntimeDirMissing,

    #[error("creating a keymap file for {size} bytes failed: {source}")]
    KeymapExport {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("input backlog: the kernel dropped keyboard events")]
    InputBacklog,

    #[error("keyboard read failed: {0}")]
    InputRead(#[source] io::Error),

    #[error("surface {0} has no pending buffer")]
    SurfaceNotReady(SurfaceId),

    #[error("surface {id} buffer {width}x{height} exceeds scanout {max_width}x{max_height}")]
    SurfaceTooLarge {
        id: SurfaceId,
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("pixel buffer {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidPixelBuffer {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

impl CompositorError {
    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CompositorError::DeviceOpen { .. }
                | CompositorError::AtomicUnsupported(_)
                | CompositorError::NoActivePlane
                | CompositorError::MissingProperty { .. }
                | CompositorError::NoScanoutMode(_)
                | CompositorError::Allocation { .. }
                | CompositorError::UnsupportedAllocator(_)
                | CompositorError::NoKeyboardFound
                | CompositorError::InvalidKeyboardSelection { .. }
                | CompositorError::Discovery(_)
                | CompositorError::KeyboardOpen { .. }
                | CompositorError::KeymapCompile { .. }
                | CompositorError::RuntimeDirMissing
                | CompositorError::KeymapExport { .. }
        )
    }

    /// Whether retrying the failed operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompositorError::CommitFailed { .. })
    }
}

/// Result type for compositor core operations
pub type Result<T> = std::result::Result<T, CompositorError>;
