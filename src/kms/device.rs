//! GPU device handle and the KMS operations the pipeline needs from it

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use drm::control::{
    atomic, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice, Event,
};
use drm::{ClientCapability, Device as _};
use log::debug;

use crate::error::{CompositorError, Result};

/// DRM card opened read-write and non-blocking
#[derive(Debug)]
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| CompositorError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("opened GPU device {}", path.display());
        Ok(Card(file))
    }

    pub(crate) fn file(&self) -> &File {
        &self.0
    }
}

/// A plane as reported by the kernel, before selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneCandidate {
    pub handle: plane::Handle,
    pub crtc: Option<crtc::Handle>,
    pub framebuffer: Option<framebuffer::Handle>,
}

/// One `(object, property, value)` write in an atomic request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: plane::Handle,
    pub property: property::Handle,
    pub value: u64,
}

/// Ordered property writes applied by a single atomic commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    writes: Vec<PropertyWrite>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(&mut self, object: plane::Handle, property: property::Handle, value: u64) {
        self.writes.push(PropertyWrite {
            object,
            property,
            value,
        });
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn into_mode_req(self) -> atomic::AtomicModeReq {
        let mut req = atomic::AtomicModeReq::new();
        for write in self.writes {
            req.add_property(
                write.object,
                write.property,
                property::Value::UnsignedRange(write.value),
            );
        }
        req
    }
}

/// How a commit is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Non-blocking, completion reported later as a page-flip event
    PageFlip,
    /// Blocking, no completion event
    Blocking,
}

/// The subset of the KMS interface the display pipeline drives.
///
/// `Card` implements it against the kernel; the pipeline is generic over it so
/// the commit/flip protocol runs the same against any implementation.
pub trait KmsDevice {
    /// Negotiate universal planes and atomic mode-setting
    fn enable_atomic(&self) -> io::Result<()>;

    fn plane_candidates(&self) -> io::Result<Vec<PlaneCandidate>>;

    fn find_property(&self, plane: plane::Handle, name: &str) -> io::Result<Option<property::Handle>>;

    fn framebuffer_size(&self, fb: framebuffer::Handle) -> io::Result<(u32, u32)>;

    fn submit(&self, request: AtomicRequest, mode: CommitMode) -> io::Result<()>;

    /// Read pending device events without blocking; returns the number of
    /// page-flip completions among them.
    fn read_flip_events(&self) -> io::Result<usize>;

    /// Block until the device has events to read or `timeout` elapses
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;
}

impl KmsDevice for Card {
    fn enable_atomic(&self) -> io::Result<()> {
        self.set_client_capability(ClientCapability::UniversalPlanes, true)?;
        self.set_client_capability(ClientCapability::Atomic, true)
    }

    fn plane_candidates(&self) -> io::Result<Vec<PlaneCandidate>> {
        self.plane_handles()?
            .into_iter()
            .map(|handle| {
                let info = self.get_plane(handle)?;
                Ok(PlaneCandidate {
                    handle: info.handle(),
                    crtc: info.crtc(),
                    framebuffer: info.framebuffer(),
                })
            })
            .collect()
    }

    fn find_property(&self, plane: plane::Handle, name: &str) -> io::Result<Option<property::Handle>> {
        let props = self.get_properties(plane)?.as_hashmap(self)?;
        Ok(props.get(name).map(|info| info.handle()))
    }

    fn framebuffer_size(&self, fb: framebuffer::Handle) -> io::Result<(u32, u32)> {
        Ok(self.get_framebuffer(fb)?.size())
    }

    fn submit(&self, request: AtomicRequest, mode: CommitMode) -> io::Result<()> {
        let flags = match mode {
            CommitMode::PageFlip => AtomicCommitFlags::NONBLOCK | AtomicCommitFlags::PAGE_FLIP_EVENT,
            CommitMode::Blocking => AtomicCommitFlags::empty(),
        };
        self.atomic_commit(flags, request.into_mode_req())
    }

    fn read_flip_events(&self) -> io::Result<usize> {
        match self.receive_events() {
            Ok(events) => Ok(events
                .filter(|event| matches!(event, Event::PageFlip(_)))
                .count()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            // SAFETY: `pfd` is a valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret >= 0 {
                return Ok(ret > 0 && pfd.revents & libc::POLLIN != 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
