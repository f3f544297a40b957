//! Display pipeline: atomic KMS on a single plane
//!
//! The pipeline takes over the first plane that is already scanning out on an
//! active CRTC, puts a CPU-mapped framebuffer of the same size on it and keeps
//! it there with a page-flip driven commit loop:
//!
//! ```text
//!  commit(fb) ──► kernel ──► vblank ──► flip event
//!      ▲                                    │
//!      └──── process_flip_events(on_flip) ◄─┘
//! ```
//!
//! The previously displayed framebuffer is put back on [`DisplayPipeline::shutdown`].

mod allocator;
mod device;

pub use allocator::{AllocatorKind, DumbAllocator, ScanoutAllocator, ScanoutFramebuffer};
pub use device::{AtomicRequest, Card, CommitMode, KmsDevice, PlaneCandidate, PropertyWrite};

use std::time::{Duration, Instant};

use drm::control::{crtc, framebuffer, plane, property};
use log::{debug, error, info, warn};

use crate::config::DrmConfig;
use crate::error::{CompositorError, Result};

const FB_ID: &str = "FB_ID";

/// The plane taken over at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    handle: plane::Handle,
    crtc: crtc::Handle,
    fb_id_property: property::Handle,
    original_fb: framebuffer::Handle,
}

impl Plane {
    /// First plane bound to a CRTC, with its FB_ID property resolved
    fn discover<D: KmsDevice>(device: &D) -> Result<Self> {
        let candidates = device.plane_candidates().map_err(CompositorError::Device)?;
        debug!("{} planes reported", candidates.len());

        let (candidate, crtc) = candidates
            .iter()
            .find_map(|c| c.crtc.map(|crtc| (c, crtc)))
            .ok_or(CompositorError::NoActivePlane)?;
        let raw = u32::from(candidate.handle);

        let original_fb = candidate
            .framebuffer
            .ok_or(CompositorError::NoScanoutMode(raw))?;
        let fb_id_property = device
            .find_property(candidate.handle, FB_ID)
            .map_err(CompositorError::Device)?
            .ok_or(CompositorError::MissingProperty {
                plane: raw,
                name: FB_ID,
            })?;

        Ok(Self {
            handle: candidate.handle,
            crtc,
            fb_id_property,
            original_fb,
        })
    }

    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    pub fn fb_id_property(&self) -> property::Handle {
        self.fb_id_property
    }

    /// Framebuffer that was on the plane before takeover
    pub fn original_fb(&self) -> framebuffer::Handle {
        self.original_fb
    }

    fn fb_request(&self, fb: framebuffer::Handle) -> AtomicRequest {
        let mut request = AtomicRequest::new();
        request.add_property(self.handle, self.fb_id_property, u64::from(u32::from(fb)));
        request
    }
}

/// Owner of the GPU device, the selected plane and the scanout framebuffer
pub struct DisplayPipeline<D: KmsDevice, A: ScanoutAllocator<D>> {
    device: D,
    allocator: A,
    plane: Plane,
    scanout: ScanoutFramebuffer,
    in_flight: usize,
    stalled: Option<framebuffer::Handle>,
    frames: u64,
    shutdown_timeout: Duration,
}

impl<D: KmsDevice, A: ScanoutAllocator<D>> DisplayPipeline<D, A> {
    /// Negotiate atomic KMS, take over the active plane and allocate a
    /// scanout buffer matching its current framebuffer.
    ///
    /// Every error returned here is fatal.
    pub fn initialize(device: D, mut allocator: A, config: &DrmConfig) -> Result<Self> {
        device
            .enable_atomic()
            .map_err(CompositorError::AtomicUnsupported)?;

        let plane = Plane::discover(&device)?;
        let (width, height) = device
            .framebuffer_size(plane.original_fb)
            .map_err(CompositorError::Device)?;
        info!(
            "taking over plane {:?} on crtc {:?} ({}x{}, previous fb {:?})",
            plane.handle, plane.crtc, width, height, plane.original_fb
        );

        let mut scanout = allocator.allocate(&device, width, height)?;
        scanout.fill(config.clear_byte);
        debug!(
            "scanout fb {:?} ready via {:?} allocator",
            scanout.id(),
            allocator.kind()
        );

        Ok(Self {
            device,
            allocator,
            plane,
            scanout,
            in_flight: 0,
            stalled: None,
            frames: 0,
            shutdown_timeout: Duration::from_millis(config.shutdown_flip_timeout_ms),
        })
    }

    /// Put `fb` on the plane at the next vblank and request a flip event.
    ///
    /// On failure the current frame stays on screen and the pipeline is marked
    /// stalled until [`retry_stalled_commit`](Self::retry_stalled_commit) succeeds.
    pub fn commit(&mut self, fb: framebuffer::Handle) -> Result<()> {
        let request = self.plane.fb_request(fb);
        match self.device.submit(request, CommitMode::PageFlip) {
            Ok(()) => {
                self.in_flight += 1;
                self.stalled = None;
                Ok(())
            }
            Err(source) => {
                self.stalled = Some(fb);
                Err(CompositorError::CommitFailed {
                    fb: u32::from(fb),
                    source,
                })
            }
        }
    }

    /// Commit the scanout framebuffer
    pub fn commit_scanout(&mut self) -> Result<()> {
        self.commit(self.scanout.id())
    }

    /// Re-submit a commit that previously failed. Returns `None` when nothing
    /// is stalled.
    pub fn retry_stalled_commit(&mut self) -> Option<Result<()>> {
        let fb = self.stalled?;
        if self.in_flight > 0 {
            return None;
        }
        debug!("retrying commit of fb {:?}", fb);
        Some(self.commit(fb))
    }

    /// Handle device readability: for every completed page flip run `on_flip`
    /// against the scanout buffer, then queue the next flip.
    ///
    /// A failed follow-up commit is returned after the flips were handled;
    /// the pipeline is stalled at that point.
    pub fn process_flip_events<F>(&mut self, mut on_flip: F) -> Result<usize>
    where
        F: FnMut(&mut ScanoutFramebuffer),
    {
        let completed = self
            .device
            .read_flip_events()
            .map_err(CompositorError::Device)?;

        for _ in 0..completed {
            self.in_flight = self.in_flight.saturating_sub(1);
            self.frames += 1;
            on_flip(&mut self.scanout);
        }

        // One flip may be in flight at a time; the kernel rejects a second.
        if completed > 0 && self.in_flight == 0 {
            self.commit_scanout()?;
        }
        Ok(completed)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    pub fn scanout(&self) -> &ScanoutFramebuffer {
        &self.scanout
    }

    pub fn scanout_mut(&mut self) -> &mut ScanoutFramebuffer {
        &mut self.scanout
    }

    /// Commits submitted whose flip event has not arrived yet
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    /// Page flips completed since startup
    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    /// Restore the plane's original framebuffer and free the scanout buffer.
    ///
    /// An outstanding flip is waited for (bounded by the configured timeout)
    /// so the restore commit is not rejected as busy. Cleanup after the
    /// restore is best-effort.
    pub fn shutdown(self) -> Result<()> {
        let DisplayPipeline {
            device,
            mut allocator,
            plane,
            scanout,
            mut in_flight,
            frames,
            shutdown_timeout,
            ..
        } = self;
        info!("shutting down display pipeline after {} frames", frames);

        let deadline = Instant::now() + shutdown_timeout;
        while in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("abandoning {} outstanding page flip(s)", in_flight);
                break;
            }
            match device.wait_readable(remaining) {
                Ok(true) => match device.read_flip_events() {
                    Ok(n) => in_flight = in_flight.saturating_sub(n),
                    Err(e) => {
                        warn!("reading final flip events failed: {}", e);
                        break;
                    }
                },
                Ok(false) => {
                    warn!("timed out waiting for {} page flip(s)", in_flight);
                    break;
                }
                Err(e) => {
                    warn!("waiting for page flip failed: {}", e);
                    break;
                }
            }
        }

        let restore = device.submit(plane.fb_request(plane.original_fb), CommitMode::Blocking);
        match &restore {
            Ok(()) => debug!("restored fb {:?} on plane {:?}", plane.original_fb, plane.handle),
            Err(e) => error!("failed to restore fb {:?}: {}", plane.original_fb, e),
        }

        let released = allocator.release(&device, scanout);
        if let Err(e) = &released {
            warn!("failed to release scanout buffer: {}", e);
        }
        drop(device);

        restore.map_err(|source| CompositorError::CommitFailed {
            fb: u32::from(plane.original_fb),
            source,
        })?;
        released
    }
}
