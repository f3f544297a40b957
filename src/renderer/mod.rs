//! Software frame compositor
//!
//! Runs once per completed page flip: every surface's pending buffer is copied
//! into the scanout buffer at the origin, in surface order, so later surfaces
//! overwrite earlier ones. No clipping, offsets or blending.

use log::{debug, trace, warn};

use crate::error::{CompositorError, Result};
use crate::kms::ScanoutFramebuffer;
use crate::surface::{image_len, SurfaceId, SurfaceStore};

/// Copy a tightly packed `width` x `height` XRGB8888 image into `dst`, whose
/// rows are `dst_stride` bytes apart, starting at the first row and column.
///
/// Rejects images that would not fit instead of writing out of bounds.
pub fn copy_pixels(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    width: u32,
    height: u32,
) -> Result<()> {
    let expected = match image_len(width, height) {
        Some(len) if len <= src.len() => len,
        len => {
            return Err(CompositorError::InvalidPixelBuffer {
                width,
                height,
                expected: len.unwrap_or(usize::MAX),
                actual: src.len(),
            })
        }
    };
    if expected == 0 {
        return Ok(());
    }
    let rows = height as usize;
    let row_bytes = expected / rows;

    let needed = dst_stride
        .checked_mul(rows - 1)
        .and_then(|n| n.checked_add(row_bytes));
    match needed {
        Some(needed) if row_bytes <= dst_stride && needed <= dst.len() => {}
        needed => {
            return Err(CompositorError::InvalidPixelBuffer {
                width,
                height,
                expected: needed.unwrap_or(usize::MAX),
                actual: dst.len(),
            })
        }
    }

    if row_bytes == dst_stride {
        dst[..expected].copy_from_slice(&src[..expected]);
        return Ok(());
    }
    for (dst_row, src_row) in dst
        .chunks_mut(dst_stride)
        .zip(src.chunks_exact(row_bytes))
        .take(rows)
    {
        dst_row[..row_bytes].copy_from_slice(src_row);
    }
    Ok(())
}

/// Outcome of one compositing pass
#[derive(Debug, Default)]
pub struct FrameReport {
    /// Surfaces copied into the scanout buffer, in order
    pub composited: Vec<SurfaceId>,
    /// Surfaces left out of this frame and why
    pub skipped: Vec<CompositorError>,
}

/// Per-vblank compositing pass over the surface store
#[derive(Debug, Default)]
pub struct FrameCompositor {
    frames: u64,
}

impl FrameCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames composited so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn composite(&mut self, surfaces: &SurfaceStore, target: &mut ScanoutFramebuffer) -> FrameReport {
        self.frames += 1;
        let mut report = FrameReport::default();
        let (max_width, max_height) = (target.width(), target.height());
        let stride = target.stride() as usize;

        for surface in surfaces.iter() {
            let id = surface.id();
            let Some(buffer) = surface.pending() else {
                trace!("surface {} has nothing attached yet", id);
                report.skipped.push(CompositorError::SurfaceNotReady(id));
                continue;
            };

            if buffer.width() > max_width || buffer.height() > max_height {
                let err = CompositorError::SurfaceTooLarge {
                    id,
                    width: buffer.width(),
                    height: buffer.height(),
                    max_width,
                    max_height,
                };
                warn!("{}", err);
                report.skipped.push(err);
                continue;
            }

            match copy_pixels(
                target.pixels_mut(),
                stride,
                buffer.data(),
                buffer.width(),
                buffer.height(),
            ) {
                Ok(()) => report.composited.push(id),
                Err(e) => {
                    warn!("surface {}: {}", id, e);
                    report.skipped.push(e);
                }
            }
        }

        debug!(
            "frame {}: {} composited, {} skipped",
            self.frames,
            report.composited.len(),
            report.skipped.len()
        );
        report
    }
}
