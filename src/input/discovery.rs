//! Keyboard discovery through udev and selection among candidates

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{CompositorError, Result};

/// An evdev node advertising keyboard capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardCandidate {
    pub devnode: PathBuf,
    pub name: Option<String>,
}

impl std::fmt::Display for KeyboardCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[{}] {}", self.devnode.display(), name),
            None => write!(f, "[{}]", self.devnode.display()),
        }
    }
}

/// All `event*` nodes tagged `ID_INPUT_KEYBOARD=1`
pub fn enumerate_keyboards() -> Result<Vec<KeyboardCandidate>> {
    let mut enumerator = udev::Enumerator::new().map_err(CompositorError::Discovery)?;
    enumerator
        .match_property("ID_INPUT_KEYBOARD", "1")
        .map_err(CompositorError::Discovery)?;
    enumerator
        .match_sysname("event*")
        .map_err(CompositorError::Discovery)?;

    let candidates: Vec<KeyboardCandidate> = enumerator
        .scan_devices()
        .map_err(CompositorError::Discovery)?
        .filter_map(|device| {
            let devnode = device.devnode()?.to_path_buf();
            let name = device.parent().and_then(|parent| {
                parent
                    .attribute_value("name")
                    .map(|value| value.to_string_lossy().into_owned())
            });
            Some(KeyboardCandidate { devnode, name })
        })
        .collect();

    debug!("udev reported {} keyboard(s)", candidates.len());
    Ok(candidates)
}

/// Picks one keyboard when more than one is available
pub trait KeyboardChooser {
    fn choose(&mut self, candidates: &[KeyboardCandidate]) -> Result<usize>;
}

/// Always answers the same index
#[derive(Debug, Clone, Copy)]
pub struct FixedChooser(pub usize);

impl KeyboardChooser for FixedChooser {
    fn choose(&mut self, _candidates: &[KeyboardCandidate]) -> Result<usize> {
        Ok(self.0)
    }
}

/// Lists the candidates and reads an index, re-prompting on garbage
pub struct PromptChooser<R, W> {
    input: R,
    output: W,
}

impl PromptChooser<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> PromptChooser<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, candidates: &[KeyboardCandidate]) -> io::Result<usize> {
        writeln!(self.output, "Found multiple keyboards:")?;
        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(self.output, "({}) {}", i, candidate)?;
        }
        loop {
            write!(self.output, "Choose one: ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "no keyboard selected",
                ));
            }
            match line.trim().parse() {
                Ok(index) => return Ok(index),
                Err(_) => writeln!(self.output, "'{}' is not an index", line.trim())?,
            }
        }
    }
}

impl<R: BufRead, W: Write> KeyboardChooser for PromptChooser<R, W> {
    fn choose(&mut self, candidates: &[KeyboardCandidate]) -> Result<usize> {
        self.prompt(candidates).map_err(CompositorError::Discovery)
    }
}

/// Reduce the candidates to one keyboard.
///
/// Zero candidates is an error, one is taken as is, several go through
/// `chooser` and the answer is range-checked.
pub fn select_keyboard(
    mut candidates: Vec<KeyboardCandidate>,
    chooser: &mut dyn KeyboardChooser,
) -> Result<KeyboardCandidate> {
    let count = candidates.len();
    let selected = match count {
        0 => return Err(CompositorError::NoKeyboardFound),
        1 => candidates.remove(0),
        _ => {
            let index = chooser.choose(&candidates)?;
            if index >= count {
                return Err(CompositorError::InvalidKeyboardSelection { index, count });
            }
            candidates.swap_remove(index)
        }
    };
    info!("using keyboard {}", selected);
    Ok(selected)
}
