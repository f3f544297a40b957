//! Client surface double-buffer store
//!
//! The protocol layer owns surface lifetimes and buffer attachment; this module
//! is the slot store it fills. The frame compositor reads only the `pending`
//! slot of every surface once per vblank.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::error::{CompositorError, Result};

/// Bytes per XRGB8888 pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Byte length of a tightly packed `width` x `height` image, if it fits in
/// `usize`
pub fn image_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

/// Stable surface identifier; iteration order follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tightly packed XRGB8888 client pixels (stride = width * 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = image_len(width, height);
        if expected != Some(data.len()) {
            return Err(CompositorError::InvalidPixelBuffer {
                width,
                height,
                expected: expected.unwrap_or(usize::MAX),
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    /// Buffer with every pixel set to `pixel` in host byte order
    pub fn filled(width: u32, height: u32, pixel: u32) -> Result<Self> {
        let len = image_len(width, height).ok_or(CompositorError::InvalidPixelBuffer {
            width,
            height,
            expected: usize::MAX,
            actual: 0,
        })?;
        let data = pixel
            .to_ne_bytes()
            .into_iter()
            .cycle()
            .take(len)
            .collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A client surface with double-buffered contents
#[derive(Debug, Clone)]
pub struct Surface {
    id: SurfaceId,
    pending: Option<PixelBuffer>,
    current: Option<PixelBuffer>,
}

impl Surface {
    fn new(id: SurfaceId) -> Self {
        Self {
            id,
            pending: None,
            current: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Most recent complete client buffer, if one was attached
    pub fn pending(&self) -> Option<&PixelBuffer> {
        self.pending.as_ref()
    }

    pub fn current(&self) -> Option<&PixelBuffer> {
        self.current.as_ref()
    }

    /// Place a new client buffer in the pending slot
    pub fn attach(&mut self, buffer: PixelBuffer) {
        self.pending = Some(buffer);
    }

    /// Promote pending to current. The pending slot keeps its contents so the
    /// scanout copy keeps showing the latest frame.
    pub fn commit(&mut self) {
        self.current = self.pending.clone();
    }
}

/// All live surfaces, ordered by id
#[derive(Debug, Default)]
pub struct SurfaceStore {
    surfaces: BTreeMap<SurfaceId, Surface>,
    next_id: u32,
}

impl SurfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> SurfaceId {
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        self.surfaces.insert(id, Surface::new(id));
        debug!("surface {} created", id);
        id
    }

    pub fn destroy(&mut self, id: SurfaceId) -> Option<Surface> {
        let removed = self.surfaces.remove(&id);
        if removed.is_some() {
            debug!("surface {} destroyed", id);
        }
        removed
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Surface> {
        self.surfaces.values()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}
