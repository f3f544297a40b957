//! Scanout buffer allocation
//!
//! The pipeline only needs "a writable framebuffer of this size"; how the
//! memory is obtained is behind [`ScanoutAllocator`]. CPU-mapped dumb buffers
//! are the one strategy implemented.

use std::io;
use std::os::fd::AsFd;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{framebuffer, Device as ControlDevice};
use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use super::device::Card;
use crate::error::{CompositorError, Result};

/// XRGB8888: 24 bits of colour in a 32-bit pixel
const DEPTH: u32 = 24;
const BITS_PER_PIXEL: u32 = 32;

/// Buffer allocation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// CPU-mappable dumb buffer
    #[default]
    Dumb,
    /// GPU buffer object; not implemented
    Accelerated,
}

/// The single framebuffer the plane scans out of
pub struct ScanoutFramebuffer {
    id: framebuffer::Handle,
    width: u32,
    height: u32,
    stride: u32,
    handle: u32,
    map: MmapMut,
}

impl ScanoutFramebuffer {
    /// `map` must cover at least `stride * height` bytes
    pub fn new(
        id: framebuffer::Handle,
        width: u32,
        height: u32,
        stride: u32,
        handle: u32,
        map: MmapMut,
    ) -> Self {
        debug_assert!(map.len() >= stride as usize * height as usize);
        Self {
            id,
            width,
            height,
            stride,
            handle,
            map,
        }
    }

    pub fn id(&self) -> framebuffer::Handle {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row; may exceed `width * 4`
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Driver buffer handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Bytes the plane scans out, `stride * height`, which is also the
    /// mapped length. The driver may have rounded the underlying allocation
    /// up to a page; that slack is neither mapped nor reported here.
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn pixels(&self) -> &[u8] {
        &self.map
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn fill(&mut self, value: u8) {
        self.map.fill(value);
    }
}

impl std::fmt::Debug for ScanoutFramebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanoutFramebuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("handle", &self.handle)
            .field("size", &self.map.len())
            .finish()
    }
}

/// Capability to create and destroy the scanout framebuffer on device `D`
pub trait ScanoutAllocator<D> {
    fn kind(&self) -> AllocatorKind;

    /// Allocate a `width` x `height` XRGB8888 framebuffer, registered with the
    /// device and mapped writable
    fn allocate(&mut self, device: &D, width: u32, height: u32) -> Result<ScanoutFramebuffer>;

    /// Unmap, unregister and free a framebuffer returned by `allocate`
    fn release(&mut self, device: &D, framebuffer: ScanoutFramebuffer) -> Result<()>;
}

/// Dumb-buffer allocator; holds the driver buffer until release
#[derive(Debug, Default)]
pub struct DumbAllocator {
    buffer: Option<DumbBuffer>,
}

impl DumbAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator for a configured strategy
    pub fn for_kind(kind: AllocatorKind) -> Result<Self> {
        match kind {
            AllocatorKind::Dumb => Ok(Self::new()),
            other => Err(CompositorError::UnsupportedAllocator(other)),
        }
    }
}

fn map_dumb(card: &Card, buffer: &DumbBuffer) -> io::Result<MmapMut> {
    let (_, height) = buffer.size();
    let len = buffer.pitch() as usize * height as usize;
    let map = drm_ffi::mode::dumbbuffer::map(card.as_fd(), u32::from(buffer.handle()), 0, 0)?;
    // SAFETY: the offset comes from MAP_DUMB for this buffer and the mapping is
    // dropped in `release` before the buffer is destroyed.
    unsafe { MmapOptions::new().offset(map.offset).len(len).map_mut(card.file()) }
}

impl ScanoutAllocator<Card> for DumbAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Dumb
    }

    fn allocate(&mut self, card: &Card, width: u32, height: u32) -> Result<ScanoutFramebuffer> {
        let buffer = card
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, BITS_PER_PIXEL)
            .map_err(|source| CompositorError::Allocation {
                stage: "create dumb buffer",
                source,
            })?;

        let fb = match card.add_framebuffer(&buffer, DEPTH, BITS_PER_PIXEL) {
            Ok(fb) => fb,
            Err(source) => {
                let _ = card.destroy_dumb_buffer(buffer);
                return Err(CompositorError::Allocation {
                    stage: "add framebuffer",
                    source,
                });
            }
        };

        let map = match map_dumb(card, &buffer) {
            Ok(map) => map,
            Err(source) => {
                let _ = card.destroy_framebuffer(fb);
                let _ = card.destroy_dumb_buffer(buffer);
                return Err(CompositorError::Allocation {
                    stage: "map dumb buffer",
                    source,
                });
            }
        };

        let handle = u32::from(buffer.handle());
        let stride = buffer.pitch();
        self.buffer = Some(buffer);

        debug!(
            "allocated {}x{} dumb buffer: stride {}, {} bytes",
            width,
            height,
            stride,
            map.len()
        );
        Ok(ScanoutFramebuffer::new(fb, width, height, stride, handle, map))
    }

    fn release(&mut self, card: &Card, framebuffer: ScanoutFramebuffer) -> Result<()> {
        let ScanoutFramebuffer { id, map, .. } = framebuffer;
        drop(map);

        if let Err(e) = card.destroy_framebuffer(id) {
            warn!("failed to remove framebuffer {:?}: {}", id, e);
        }
        match self.buffer.take() {
            Some(buffer) => card.destroy_dumb_buffer(buffer).map_err(CompositorError::Device),
            None => Ok(()),
        }
    }
}
