//! In-memory KMS device, allocator and keyboard shared by the integration
//! tests
//!
//! The device records every atomic request. Page-flip completions are bytes
//! written to a pipe whose read end stands in for the GPU fd, so the event
//! loop sees real readiness. The keyboard works the same way: every queued
//! chunk of records is one byte in its pipe.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use drm::control::{framebuffer, plane, property};
use memmap2::MmapOptions;
use minicomp::compositor::ClientSink;
use minicomp::error::{CompositorError, Result};
use minicomp::input::{InputEvent, KeyboardInput, KeyboardState, KeymapNames, RawRecord, RecordSource};
use minicomp::kms::{
    AllocatorKind, AtomicRequest, CommitMode, KmsDevice, PlaneCandidate, ScanoutAllocator,
    ScanoutFramebuffer,
};

pub const PLANE: u32 = 31;
pub const CRTC: u32 = 41;
pub const ORIGINAL_FB: u32 = 90;
pub const FB_ID_PROP: u32 = 17;
pub const SCANOUT_FB: u32 = 120;

pub fn plane_handle(raw: u32) -> plane::Handle {
    drm::control::from_u32(raw).unwrap()
}

pub fn fb_handle(raw: u32) -> framebuffer::Handle {
    drm::control::from_u32(raw).unwrap()
}

pub fn prop_handle(raw: u32) -> property::Handle {
    drm::control::from_u32(raw).unwrap()
}

/// Everything the fake device observed
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub commits: Vec<(AtomicRequest, CommitMode)>,
    /// Number of upcoming commits that fail with EBUSY
    pub fail_commits: usize,
    /// Page-flip commits not yet completed by `vblank`
    pub pending_flips: usize,
    pub flips_delivered: usize,
    pub allocations: Vec<(u32, u32)>,
    pub released: Vec<u32>,
}

impl DeviceLog {
    /// Framebuffer ids committed, in order
    pub fn committed_fbs(&self) -> Vec<u64> {
        self.commits
            .iter()
            .flat_map(|(req, _)| req.writes().iter().map(|w| w.value))
            .collect()
    }
}

/// Knobs for the plane layout a device reports
#[derive(Debug, Clone)]
pub struct Layout {
    pub atomic: bool,
    pub planes: Vec<PlaneCandidate>,
    pub has_fb_id: bool,
    pub size: (u32, u32),
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            atomic: true,
            planes: vec![
                PlaneCandidate {
                    handle: plane_handle(30),
                    crtc: None,
                    framebuffer: None,
                },
                PlaneCandidate {
                    handle: plane_handle(PLANE),
                    crtc: Some(drm::control::from_u32(CRTC).unwrap()),
                    framebuffer: Some(fb_handle(ORIGINAL_FB)),
                },
            ],
            has_fb_id: true,
            size: (64, 32),
        }
    }
}

pub struct FakeDevice {
    pub log: Rc<RefCell<DeviceLog>>,
    layout: Layout,
    read_end: OwnedFd,
    write_end: Rc<OwnedFd>,
}

/// Test-side handle to drive vblanks after the device moved into a pipeline
#[derive(Clone)]
pub struct Vblank {
    log: Rc<RefCell<DeviceLog>>,
    write_end: Rc<OwnedFd>,
}

impl Vblank {
    /// Complete every pending page flip
    pub fn fire(&self) -> usize {
        let pending = std::mem::take(&mut self.log.borrow_mut().pending_flips);
        for _ in 0..pending {
            let byte = [1u8];
            let n = unsafe { libc::write(self.write_end.as_raw_fd(), byte.as_ptr().cast(), 1) };
            assert_eq!(n, 1);
        }
        pending
    }
}

impl FakeDevice {
    pub fn new(layout: Layout) -> Self {
        let (read_end, write_end) = pipe();
        Self {
            log: Rc::default(),
            layout,
            read_end,
            write_end: Rc::new(write_end),
        }
    }

    pub fn vblank(&self) -> Vblank {
        Vblank {
            log: Rc::clone(&self.log),
            write_end: Rc::clone(&self.write_end),
        }
    }
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

impl AsFd for FakeDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }
}

impl KmsDevice for FakeDevice {
    fn enable_atomic(&self) -> io::Result<()> {
        if self.layout.atomic {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
        }
    }

    fn plane_candidates(&self) -> io::Result<Vec<PlaneCandidate>> {
        Ok(self.layout.planes.clone())
    }

    fn find_property(&self, _plane: plane::Handle, name: &str) -> io::Result<Option<property::Handle>> {
        Ok((self.layout.has_fb_id && name == "FB_ID").then(|| prop_handle(FB_ID_PROP)))
    }

    fn framebuffer_size(&self, _fb: framebuffer::Handle) -> io::Result<(u32, u32)> {
        Ok(self.layout.size)
    }

    fn submit(&self, request: AtomicRequest, mode: CommitMode) -> io::Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_commits > 0 {
            log.fail_commits -= 1;
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if mode == CommitMode::PageFlip {
            log.pending_flips += 1;
        }
        log.commits.push((request, mode));
        Ok(())
    }

    fn read_flip_events(&self) -> io::Result<usize> {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let n = unsafe { libc::read(self.read_end.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                total += n as usize;
                continue;
            }
            if n == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                break;
            }
            return Err(err);
        }
        self.log.borrow_mut().flips_delivered += total;
        Ok(total)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.read_end.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }
}

/// Allocator backed by anonymous memory, with a padded stride
#[derive(Debug, Default)]
pub struct FakeAllocator {
    pub fail: bool,
    pub padding: u32,
}

impl ScanoutAllocator<FakeDevice> for FakeAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Dumb
    }

    fn allocate(&mut self, device: &FakeDevice, width: u32, height: u32) -> Result<ScanoutFramebuffer> {
        if self.fail {
            return Err(CompositorError::Allocation {
                stage: "create dumb buffer",
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        let stride = width * 4 + self.padding;
        let map = MmapOptions::new()
            .len(stride as usize * height as usize)
            .map_anon()
            .map_err(|source| CompositorError::Allocation {
                stage: "map dumb buffer",
                source,
            })?;
        device.log.borrow_mut().allocations.push((width, height));
        Ok(ScanoutFramebuffer::new(
            fb_handle(SCANOUT_FB),
            width,
            height,
            stride,
            1,
            map,
        ))
    }

    fn release(&mut self, device: &FakeDevice, framebuffer: ScanoutFramebuffer) -> Result<()> {
        device
            .log
            .borrow_mut()
            .released
            .push(u32::from(framebuffer.id()));
        Ok(())
    }
}

/// What the fake keyboard has queued and observed
#[derive(Debug, Default)]
pub struct KeyboardLog {
    pub chunks: VecDeque<Vec<RawRecord>>,
    /// Reported by `keys_down` after an overflow
    pub down: Vec<u16>,
    pub released: bool,
}

pub struct FakeKeyboard {
    log: Rc<RefCell<KeyboardLog>>,
    read_end: OwnedFd,
}

/// Test-side handle that queues records for the fake keyboard
#[derive(Clone)]
pub struct KeyFeed {
    pub log: Rc<RefCell<KeyboardLog>>,
    write_end: Rc<OwnedFd>,
}

impl KeyFeed {
    pub fn push(&self, records: Vec<RawRecord>) {
        self.log.borrow_mut().chunks.push_back(records);
        let byte = [1u8];
        let n = unsafe { libc::write(self.write_end.as_raw_fd(), byte.as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    }

    /// A key transition followed by its report
    pub fn key(&self, code: u16, value: i32) {
        self.push(vec![RawRecord::key(code, value), syn(SYN_REPORT)]);
    }
}

pub const SYN_REPORT: u16 = 0;
pub const SYN_DROPPED: u16 = 3;

pub fn syn(code: u16) -> RawRecord {
    RawRecord {
        kind: evdev::EventType::SYNCHRONIZATION.0,
        code,
        value: 0,
    }
}

impl AsFd for FakeKeyboard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }
}

impl RecordSource for FakeKeyboard {
    fn fetch(&mut self) -> io::Result<Vec<RawRecord>> {
        let Some(chunk) = self.log.borrow_mut().chunks.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let mut byte = [0u8];
        let n = unsafe { libc::read(self.read_end.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
        assert_eq!(n, 1);
        Ok(chunk)
    }

    fn keys_down(&self) -> io::Result<Vec<u16>> {
        Ok(self.log.borrow().down.clone())
    }

    fn release(&mut self) -> io::Result<()> {
        self.log.borrow_mut().released = true;
        Ok(())
    }
}

/// A `us` keyboard backed by [`FakeKeyboard`]
pub fn fake_keyboard() -> (KeyboardInput, KeyFeed) {
    let dir = tempfile::tempdir().unwrap();
    let names = KeymapNames {
        layout: "us".to_string(),
        ..Default::default()
    };
    let state = KeyboardState::new(&names, dir.path()).unwrap();
    let (read_end, write_end) = pipe();
    let log = Rc::new(RefCell::new(KeyboardLog::default()));
    let source = FakeKeyboard {
        log: Rc::clone(&log),
        read_end,
    };
    let feed = KeyFeed {
        log,
        write_end: Rc::new(write_end),
    };
    let input = KeyboardInput::from_source(Path::new("/dev/input/event9"), Box::new(source), state);
    (input, feed)
}

/// Everything a client would have been sent
#[derive(Debug, Default)]
pub struct SinkLog {
    pub keymap_size: Option<usize>,
    pub keys: Vec<InputEvent>,
    pub lost: usize,
}

#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub log: Rc<RefCell<SinkLog>>,
}

impl ClientSink for RecordingSink {
    fn keymap(&mut self, _fd: BorrowedFd<'_>, size: usize) {
        self.log.borrow_mut().keymap_size = Some(size);
    }

    fn key(&mut self, event: &InputEvent) {
        self.log.borrow_mut().keys.push(*event);
    }

    fn input_lost(&mut self) {
        self.log.borrow_mut().lost += 1;
    }
}
