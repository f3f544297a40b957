//! XKB keymap compilation and export to clients
//!
//! The compiled keymap is handed to clients as a file descriptor plus a
//! size: the text-v1 serialization followed by a NUL, in an anonymous file
//! under the runtime directory.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use log::{debug, info};
use memmap2::MmapMut;
use xkbcommon::xkb;

use crate::config::KeymapConfig;
use crate::error::{CompositorError, Result};

/// Fully resolved XKB rule names. Empty strings select the libxkbcommon
/// built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeymapNames {
    pub rules: String,
    pub model: String,
    pub layout: String,
    pub variant: String,
    pub options: Option<String>,
}

impl KeymapNames {
    /// Fill each name from `config`, then from the `XKB_DEFAULT_*` variable
    /// looked up through `env`, else leave it empty.
    pub fn resolve<F>(config: &KeymapConfig, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |configured: &Option<String>, var: &str| {
            configured
                .clone()
                .or_else(|| env(var))
                .filter(|value| !value.is_empty())
        };

        Self {
            rules: pick(&config.rules, "XKB_DEFAULT_RULES").unwrap_or_default(),
            model: pick(&config.model, "XKB_DEFAULT_MODEL").unwrap_or_default(),
            layout: pick(&config.layout, "XKB_DEFAULT_LAYOUT").unwrap_or_default(),
            variant: pick(&config.variant, "XKB_DEFAULT_VARIANT").unwrap_or_default(),
            options: pick(&config.options, "XKB_DEFAULT_OPTIONS"),
        }
    }

    /// Resolve against the process environment
    pub fn from_env(config: &KeymapConfig) -> Self {
        Self::resolve(config, |var| std::env::var(var).ok())
    }
}

/// Compile a keymap from rule names
pub fn compile_keymap(context: &xkb::Context, names: &KeymapNames) -> Result<xkb::Keymap> {
    let keymap = xkb::Keymap::new_from_names(
        context,
        &names.rules,
        &names.model,
        &names.layout,
        &names.variant,
        names.options.clone(),
        xkb::KEYMAP_COMPILE_NO_FLAGS,
    )
    .ok_or_else(|| CompositorError::KeymapCompile {
        rules: names.rules.clone(),
        model: names.model.clone(),
        layout: names.layout.clone(),
        variant: names.variant.clone(),
        options: names.options.clone(),
    })?;

    info!(
        "compiled keymap (rules={:?}, model={:?}, layout={:?}, variant={:?}, options={:?})",
        names.rules, names.model, names.layout, names.variant, names.options
    );
    Ok(keymap)
}

/// `$XDG_RUNTIME_DIR`, unless overridden
pub fn runtime_dir(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .ok_or(CompositorError::RuntimeDirMissing)
}

/// Anonymous file holding the keymap text and its NUL terminator
#[derive(Debug)]
pub struct KeymapFile {
    file: File,
    size: usize,
}

impl KeymapFile {
    /// Serialize `keymap` and write it to a fresh file in `runtime_dir`
    pub fn export(keymap: &xkb::Keymap, runtime_dir: &Path) -> Result<Self> {
        let text = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
        Self::from_text(&text, runtime_dir)
    }

    pub fn from_text(text: &str, runtime_dir: &Path) -> Result<Self> {
        let size = text.len() + 1;
        let fail = |source| CompositorError::KeymapExport { size, source };

        // Unlinked on creation and opened close-on-exec
        let file = tempfile::tempfile_in(runtime_dir).map_err(fail)?;
        allocate(&file, size).map_err(fail)?;

        // SAFETY: the file is private to this process and was just sized.
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(fail)?;
        map[..text.len()].copy_from_slice(text.as_bytes());
        map[text.len()] = 0;
        map.flush().map_err(fail)?;

        debug!(
            "keymap exported to fd {} ({} bytes)",
            file.as_raw_fd(),
            size
        );
        Ok(Self { file, size })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Text length plus the terminator
    pub fn size(&self) -> usize {
        self.size
    }
}

fn allocate(file: &File, size: usize) -> io::Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "keymap too large"))?;
    loop {
        // SAFETY: plain syscall on a descriptor owned by `file`.
        match unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) } {
            0 => return Ok(()),
            libc::EINTR => continue,
            err => return Err(io::Error::from_raw_os_error(err)),
        }
    }
}
