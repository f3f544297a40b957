//! Configuration management for minicomp
//!
//! Settings are read from a TOML file. Every section is optional and falls
//! back to its defaults, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::kms::AllocatorKind;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/minicomp/minicomp.toml";

/// Main configuration struct containing all minicomp settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CompositorConfig {
    /// GPU device and scanout settings
    #[serde(default)]
    pub drm: DrmConfig,

    /// Keyboard selection and handling
    #[serde(default)]
    pub input: InputConfig,

    /// XKB keymap names
    #[serde(default)]
    pub keymap: KeymapConfig,

    /// Client launched once the compositor is up
    #[serde(default)]
    pub client: ClientConfig,

    /// General compositor settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Display pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrmConfig {
    /// GPU device node
    pub device: PathBuf,

    /// Byte every scanout byte is set to before the first frame
    pub clear_byte: u8,

    /// Scanout buffer allocation strategy
    pub allocator: AllocatorKind,

    /// Delay before re-submitting a failed commit (milliseconds)
    pub commit_retry_ms: u64,

    /// How long shutdown waits for an outstanding page flip (milliseconds)
    pub shutdown_flip_timeout_ms: u64,
}

/// Keyboard configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    /// Use this evdev node and skip discovery
    pub device: Option<PathBuf>,

    /// Index to pick when several keyboards are found; prompts when unset
    pub keyboard_index: Option<usize>,

    /// Stop the compositor on the first key press
    pub quit_on_key_press: bool,

    /// Directory for the keymap file; `$XDG_RUNTIME_DIR` when unset
    pub runtime_dir: Option<PathBuf>,
}

/// XKB rule names. Unset fields fall back to `XKB_DEFAULT_*`, then to the
/// libxkbcommon defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct KeymapConfig {
    pub rules: Option<String>,
    pub model: Option<String>,
    pub layout: Option<String>,
    pub variant: Option<String>,
    pub options: Option<String>,
}

/// Client launch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Program to run; nothing is launched when unset
    pub command: Option<String>,

    /// Arguments passed to `command`
    pub args: Vec<String>,
}

/// General compositor settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            clear_byte: 0x33,
            allocator: AllocatorKind::Dumb,
            commit_retry_ms: 16,
            shutdown_flip_timeout_ms: 100,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            device: None,
            keyboard_index: None,
            quit_on_key_press: true,
            runtime_dir: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: Some("weston-terminal".to_string()),
            args: vec!["--shell=bash".to_string()],
        }
    }
}

/// Expand a leading `~` to `$HOME`
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

impl CompositorConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: CompositorConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` if it exists, otherwise use the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;
        if expanded_path.exists() {
            Self::load(expanded_path)
        } else {
            log::debug!(
                "no config at {}, using defaults",
                expanded_path.display()
            );
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.drm.device.as_os_str().is_empty() {
            anyhow::bail!("Invalid drm.device: must not be empty");
        }

        if self.drm.commit_retry_ms == 0 || self.drm.commit_retry_ms > 1000 {
            anyhow::bail!("Invalid commit_retry_ms: must be between 1 and 1000");
        }

        if self.drm.shutdown_flip_timeout_ms > 10_000 {
            anyhow::bail!("Invalid shutdown_flip_timeout_ms: must be at most 10000");
        }

        if let Some(command) = &self.client.command {
            if command.trim().is_empty() {
                anyhow::bail!("Invalid client.command: must not be blank");
            }
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
