//! Keyboard state machine: raw evdev records in, modifier-annotated key
//! events out

use std::collections::BTreeSet;
use std::os::fd::BorrowedFd;
use std::path::Path;

use log::trace;
use xkbcommon::xkb;

use super::keymap::{compile_keymap, KeymapFile, KeymapNames};
use crate::error::Result;

/// evdev scancodes are XKB keycodes minus this
pub const EVDEV_KEYCODE_OFFSET: u32 = 8;

/// One input record as delivered by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawRecord {
    pub fn key(code: u16, value: i32) -> Self {
        Self {
            kind: evdev::EventType::KEY.0,
            code,
            value,
        }
    }

    pub fn is_key(&self) -> bool {
        self.kind == evdev::EventType::KEY.0
    }

    /// The kernel ring overflowed and records were lost
    pub fn is_dropped(&self) -> bool {
        self.kind == evdev::EventType::SYNCHRONIZATION.0
            && self.code == evdev::Synchronization::SYN_DROPPED.0
    }

    /// End of one hardware report
    pub fn is_report(&self) -> bool {
        self.kind == evdev::EventType::SYNCHRONIZATION.0
            && self.code == evdev::Synchronization::SYN_REPORT.0
    }
}

impl From<&evdev::InputEvent> for RawRecord {
    fn from(event: &evdev::InputEvent) -> Self {
        Self {
            kind: event.event_type().0,
            code: event.code(),
            value: event.value(),
        }
    }
}

/// A key transition with the modifier state after applying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// evdev scancode, as wl_keyboard expects it
    pub keycode: u32,
    pub pressed: bool,
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

/// Compiled keymap, its exported file and the live XKB state
pub struct KeyboardState {
    keymap: xkb::Keymap,
    state: xkb::State,
    file: KeymapFile,
    held: BTreeSet<u16>,
}

impl KeyboardState {
    /// Compile the keymap for `names` and export it under `runtime_dir`
    pub fn new(names: &KeymapNames, runtime_dir: &Path) -> Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = compile_keymap(&context, names)?;
        let file = KeymapFile::export(&keymap, runtime_dir)?;
        let state = xkb::State::new(&keymap);
        Ok(Self {
            keymap,
            state,
            file,
            held: BTreeSet::new(),
        })
    }

    pub fn keymap(&self) -> &xkb::Keymap {
        &self.keymap
    }

    pub fn keymap_fd(&self) -> BorrowedFd<'_> {
        self.file.fd()
    }

    pub fn keymap_size(&self) -> usize {
        self.file.size()
    }

    /// Advance the state with one record. Key records yield an event,
    /// everything else is ignored.
    ///
    /// Autorepeat records (`value == 2`) are reported as presses but do not
    /// touch the XKB state, which counts every down transition.
    pub fn process(&mut self, record: RawRecord) -> Option<InputEvent> {
        if !record.is_key() {
            return None;
        }

        let pressed = record.value > 0;
        if record.value != 2 {
            let direction = if pressed {
                self.held.insert(record.code);
                xkb::KeyDirection::Down
            } else {
                self.held.remove(&record.code);
                xkb::KeyDirection::Up
            };
            let xkb_keycode = u32::from(record.code) + EVDEV_KEYCODE_OFFSET;
            self.state.update_key(xkb_keycode.into(), direction);
        }

        let event = self.snapshot(u32::from(record.code), pressed);
        trace!("{:?}", event);
        Some(event)
    }

    fn snapshot(&self, keycode: u32, pressed: bool) -> InputEvent {
        InputEvent {
            keycode,
            pressed,
            depressed: self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        }
    }

    /// Keys currently held down, by scancode
    pub fn held(&self) -> impl Iterator<Item = u16> + '_ {
        self.held.iter().copied()
    }

    /// Bring the state in line with the keys the kernel reports as down,
    /// emitting a release or press for every key that disagrees
    pub fn resync(&mut self, down: &[u16]) -> Vec<InputEvent> {
        let actual: BTreeSet<u16> = down.iter().copied().collect();
        let released: Vec<u16> = self.held.difference(&actual).copied().collect();
        let pressed: Vec<u16> = actual.difference(&self.held).copied().collect();

        released
            .into_iter()
            .map(|code| RawRecord::key(code, 0))
            .chain(pressed.into_iter().map(|code| RawRecord::key(code, 1)))
            .filter_map(|record| self.process(record))
            .collect()
    }

    /// Current `(depressed, latched, locked, group)`
    pub fn modifiers(&self) -> (u32, u32, u32, u32) {
        let e = self.snapshot(0, false);
        (e.depressed, e.latched, e.locked, e.group)
    }
}
