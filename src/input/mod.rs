//! Keyboard input subsystem
//!
//! One keyboard is discovered through udev, grabbed exclusively and read
//! without blocking. Records pass through the XKB state machine and come out
//! as [`InputEvent`]s carrying the modifier state clients need.

pub mod discovery;
pub mod keymap;
pub mod state;

pub use discovery::{
    enumerate_keyboards, select_keyboard, FixedChooser, KeyboardCandidate, KeyboardChooser,
    PromptChooser,
};
pub use keymap::{compile_keymap, KeymapFile, KeymapNames};
pub use state::{InputEvent, KeyboardState, RawRecord};

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use evdev::raw_stream::RawDevice;
use log::{debug, info, warn};

use crate::config::{InputConfig, KeymapConfig};
use crate::error::{CompositorError, Result};

/// Events drained by one readiness notification
#[derive(Debug, Default)]
pub struct InputBatch {
    pub events: Vec<InputEvent>,
    /// The kernel reported lost records somewhere in this batch
    pub overflowed: bool,
}

impl InputBatch {
    pub fn has_press(&self) -> bool {
        self.events.iter().any(|e| e.pressed)
    }
}

/// A readable stream of keyboard records
pub trait RecordSource: AsFd {
    /// The next chunk of queued records. Fails with `WouldBlock` once the
    /// queue is empty.
    fn fetch(&mut self) -> io::Result<Vec<RawRecord>>;

    /// Scancodes of every key the device currently reports as down
    fn keys_down(&self) -> io::Result<Vec<u16>>;

    /// Give up exclusive access
    fn release(&mut self) -> io::Result<()>;
}

/// An evdev node, opened non-blocking and grabbed
pub struct EvdevSource {
    device: RawDevice,
}

impl EvdevSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut device = RawDevice::open(path)?;
        set_nonblocking(device.as_raw_fd())?;
        device.grab()?;
        info!(
            "grabbed keyboard {} ({})",
            path.display(),
            device.name().unwrap_or("unnamed")
        );
        Ok(Self { device })
    }
}

impl AsFd for EvdevSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is owned by `self.device`, which outlives the borrow.
        unsafe { BorrowedFd::borrow_raw(self.device.as_raw_fd()) }
    }
}

impl RecordSource for EvdevSource {
    fn fetch(&mut self) -> io::Result<Vec<RawRecord>> {
        Ok(self
            .device
            .fetch_events()?
            .map(|event| RawRecord::from(&event))
            .collect())
    }

    fn keys_down(&self) -> io::Result<Vec<u16>> {
        Ok(self
            .device
            .get_key_state()?
            .iter()
            .map(|key| key.code())
            .collect())
    }

    fn release(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }
}

/// The grabbed keyboard and its keymap state
pub struct KeyboardInput {
    source: Box<dyn RecordSource>,
    path: PathBuf,
    state: KeyboardState,
    /// Records are being skipped until the report that ends an overflow
    resyncing: bool,
}

impl KeyboardInput {
    /// Pick a keyboard (configured node, else udev discovery and `chooser`),
    /// build its keymap and open it.
    pub fn setup(
        config: &InputConfig,
        keymap: &KeymapConfig,
        chooser: &mut dyn KeyboardChooser,
    ) -> Result<Self> {
        let path = match &config.device {
            Some(path) => {
                debug!("using configured keyboard {}", path.display());
                path.clone()
            }
            None => select_keyboard(enumerate_keyboards()?, chooser)?.devnode,
        };

        let runtime_dir = keymap::runtime_dir(config.runtime_dir.as_deref())?;
        let state = KeyboardState::new(&KeymapNames::from_env(keymap), &runtime_dir)?;
        Self::open(&path, state)
    }

    /// Open `path` non-blocking and take an exclusive grab
    pub fn open(path: &Path, state: KeyboardState) -> Result<Self> {
        let source = EvdevSource::open(path).map_err(|source| CompositorError::KeyboardOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_source(path, Box::new(source), state))
    }

    /// Wrap an already opened record source
    pub fn from_source(path: &Path, source: Box<dyn RecordSource>, state: KeyboardState) -> Self {
        Self {
            source,
            path: path.to_path_buf(),
            state,
            resyncing: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &KeyboardState {
        &self.state
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.source.as_fd()
    }

    /// Read every record the kernel has queued, until it would block
    pub fn drain(&mut self) -> Result<InputBatch> {
        let mut batch = InputBatch::default();
        loop {
            let records = match self.source.fetch() {
                Ok(records) => records,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CompositorError::InputRead(e)),
            };
            if records.is_empty() {
                break;
            }
            self.absorb(records, &mut batch);
        }

        if batch.overflowed {
            warn!("{}", CompositorError::InputBacklog);
        }
        Ok(batch)
    }

    /// Feed records through the keymap state, appending events to `batch`.
    ///
    /// After `SYN_DROPPED` everything up to the next `SYN_REPORT` is
    /// discarded, then the state is resynced against the keys the device
    /// reports as down.
    pub fn absorb(&mut self, records: impl IntoIterator<Item = RawRecord>, batch: &mut InputBatch) {
        for record in records {
            if record.is_dropped() {
                batch.overflowed = true;
                self.resyncing = true;
                continue;
            }
            if self.resyncing {
                if record.is_report() {
                    self.resyncing = false;
                    self.resync(batch);
                }
                continue;
            }
            if let Some(event) = self.state.process(record) {
                batch.events.push(event);
            }
        }
    }

    fn resync(&mut self, batch: &mut InputBatch) {
        match self.source.keys_down() {
            Ok(down) => {
                let events = self.state.resync(&down);
                debug!("resynced keyboard state: {} key(s) changed", events.len());
                batch.events.extend(events);
            }
            Err(e) => warn!("cannot read key state of {}: {}", self.path.display(), e),
        }
    }

    /// Drop the exclusive grab and close the device
    pub fn release(mut self) {
        if let Err(e) = self.source.release() {
            warn!("failed to ungrab {}: {}", self.path.display(), e);
        }
        debug!("released keyboard {}", self.path.display());
    }
}

fn set_nonblocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no pointers involved.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
