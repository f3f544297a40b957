//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization/deserialization,
//! and edge cases in configuration handling.

use super::*;
use anyhow::Result;
use serial_test::serial;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = CompositorConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card0"));
    assert_eq!(config.drm.clear_byte, 0x33);
    assert_eq!(config.drm.allocator, AllocatorKind::Dumb);
    assert!(config.input.quit_on_key_press);
    assert!(config.input.device.is_none());
    assert_eq!(config.keymap, KeymapConfig::default());
    assert_eq!(config.client.command.as_deref(), Some("weston-terminal"));
    assert_eq!(config.client.args, vec!["--shell=bash".to_string()]);
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let mut original_config = CompositorConfig::default();
    original_config.keymap.layout = Some("de".to_string());
    original_config.input.keyboard_index = Some(1);

    let toml_string = toml::to_string(&original_config)?;
    let deserialized_config: CompositorConfig = toml::from_str(&toml_string)?;

    assert_eq!(original_config, deserialized_config);
    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("test_config.toml");

    let test_config = r#"
[drm]
device = "/dev/dri/card1"
clear_byte = 0
allocator = "dumb"
commit_retry_ms = 8

[input]
device = "/dev/input/event3"
quit_on_key_press = false

[keymap]
layout = "us,ru"
options = "grp:alt_shift_toggle"

[client]
command = "foot"
args = []

[general]
debug = true
"#;

    fs::write(&file_path, test_config)?;
    let config = CompositorConfig::load(&file_path)?;

    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card1"));
    assert_eq!(config.drm.clear_byte, 0);
    assert_eq!(config.drm.commit_retry_ms, 8);
    // Omitted keys keep their defaults
    assert_eq!(config.drm.shutdown_flip_timeout_ms, 100);

    assert_eq!(config.input.device, Some(PathBuf::from("/dev/input/event3")));
    assert!(!config.input.quit_on_key_press);
    assert_eq!(config.keymap.layout.as_deref(), Some("us,ru"));
    assert_eq!(config.keymap.options.as_deref(), Some("grp:alt_shift_toggle"));
    assert!(config.keymap.rules.is_none());
    assert_eq!(config.client.command.as_deref(), Some("foot"));
    assert!(config.client.args.is_empty());
    assert!(config.general.debug);

    Ok(())
}

#[test]
fn test_partial_configuration() -> Result<()> {
    let config: CompositorConfig = toml::from_str("[keymap]\nlayout = \"fr\"\n")?;

    assert_eq!(config.keymap.layout.as_deref(), Some("fr"));
    assert_eq!(config.drm, DrmConfig::default());
    assert_eq!(config.input, InputConfig::default());
    assert_eq!(config.client, ClientConfig::default());

    let empty: CompositorConfig = toml::from_str("")?;
    assert_eq!(empty, CompositorConfig::default());
    Ok(())
}

#[test]
fn test_malformed_toml_handling() {
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("malformed_config.toml");

    let malformed_config = r#"
[drm
device = "/dev/dri/card0"

[input]
keyboard_index = "first"
"#;

    fs::write(&file_path, malformed_config).unwrap();
    assert!(CompositorConfig::load(&file_path).is_err());
}

#[test]
fn test_unknown_allocator_rejected() {
    let result: std::result::Result<CompositorConfig, _> =
        toml::from_str("[drm]\nallocator = \"vulkan\"\n");
    assert!(result.is_err());

    let accel: CompositorConfig = toml::from_str("[drm]\nallocator = \"accelerated\"\n").unwrap();
    assert_eq!(accel.drm.allocator, AllocatorKind::Accelerated);
}

#[test]
fn test_configuration_validation() {
    let config = CompositorConfig::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.drm.commit_retry_ms = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.drm.device = PathBuf::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.client.command = Some("  ".to_string());
    assert!(invalid_config.validate().is_err());

    let mut no_client = config;
    no_client.client.command = None;
    assert!(no_client.validate().is_ok());
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = CompositorConfig::default();
    config.drm.device = PathBuf::from("/dev/dri/card2");
    config.keymap.variant = Some("dvorak".to_string());
    config.save(&file_path)?;

    assert_eq!(CompositorConfig::load(&file_path)?, config);
    Ok(())
}

#[test]
#[serial]
fn test_home_expansion() -> Result<()> {
    let dir = tempdir()?;
    let previous = std::env::var_os("HOME");
    std::env::set_var("HOME", dir.path());

    fs::create_dir_all(dir.path().join(".config/minicomp"))?;
    fs::write(
        dir.path().join(".config/minicomp/minicomp.toml"),
        "[general]\ndebug = true\n",
    )?;
    let loaded = CompositorConfig::load(DEFAULT_CONFIG_PATH);
    let expanded = expand_home(Path::new("~/x.toml"));

    match previous {
        Some(home) => std::env::set_var("HOME", home),
        None => std::env::remove_var("HOME"),
    }

    assert!(loaded?.general.debug);
    assert_eq!(expanded?, dir.path().join("x.toml"));
    assert_eq!(
        expand_home(Path::new("/etc/minicomp.toml"))?,
        PathBuf::from("/etc/minicomp.toml")
    );
    Ok(())
}

#[test]
fn test_missing_file_falls_back_to_defaults() -> Result<()> {
    let dir = tempdir()?;
    let config = CompositorConfig::load_or_default(dir.path().join("absent.toml"))?;
    assert_eq!(config, CompositorConfig::default());
    assert!(CompositorConfig::load(dir.path().join("absent.toml")).is_err());
    Ok(())
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_commit_retry_bounds(retry in 0u64..3000) {
            let mut config = CompositorConfig::default();
            config.drm.commit_retry_ms = retry;

            let result = config.validate();
            if (1..=1000).contains(&retry) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_clear_byte_survives_toml(byte in any::<u8>()) {
            let mut config = CompositorConfig::default();
            config.drm.clear_byte = byte;

            let text = toml::to_string(&config).unwrap();
            let parsed: CompositorConfig = toml::from_str(&text).unwrap();
            prop_assert_eq!(parsed.drm.clear_byte, byte);
        }
    }
}
