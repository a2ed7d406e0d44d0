//! Integration tests for cask-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;

use cask_config::{Config, LogLevel};
use tempfile::tempdir;

/// Test config loading from a single global file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("config.toml");
    std::fs::write(
        &global,
        r#"
[container]
path = "/srv/disk.cask"

[store]
write_through = false
defragment_on_close = true

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(global.as_path()), None).unwrap();
    assert_eq!(config.container.path, PathBuf::from("/srv/disk.cask"));
    assert!(!config.store.write_through);
    assert!(config.store.defragment_on_close);
    assert_eq!(config.logging.level, LogLevel::Debug);
}

/// Test config hierarchy: project config overrides global per key
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global_dir = temp.path().join("global/.cask");
    std::fs::create_dir_all(&global_dir).unwrap();
    let global = global_dir.join("config.toml");
    std::fs::write(
        &global,
        r#"
[container]
path = "global.cask"

[store]
write_through = false
defragment_on_close = true
"#,
    )
    .unwrap();

    let project_dir = temp.path().join("project/.cask");
    std::fs::create_dir_all(&project_dir).unwrap();
    let project = project_dir.join("config.toml");
    std::fs::write(
        &project,
        r#"
[store]
write_through = true
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(global.as_path()), Some(project.as_path())).unwrap();

    // Overridden key replaced, sibling key and other sections kept
    assert!(config.store.write_through);
    assert!(config.store.defragment_on_close);
    assert_eq!(config.container.path, PathBuf::from("global.cask"));
    assert_eq!(config.logging.level, LogLevel::Warn);
}

/// Missing files fall back to defaults
#[test]
fn test_missing_files_yield_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_from(
        Some(temp.path().join("absent.toml").as_path()),
        Some(temp.path().join("also-absent.toml").as_path()),
    )
    .unwrap();
    assert_eq!(config, Config::default());
}

/// Broken TOML is reported, not ignored
#[test]
fn test_malformed_config_is_an_error() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[store\nwrite_through = ").unwrap();

    assert!(matches!(
        Config::load_from(Some(path.as_path()), None),
        Err(cask_config::ConfigError::Toml(_))
    ));
}

/// Env overrides win over file values
#[test]
fn test_config_env_override_integration() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[container]\npath = \"file.cask\"\n").unwrap();

    let mut config = Config::load_from(Some(path.as_path()), None).unwrap();
    config.apply_env_overrides(|key| match key {
        cask_config::CONTAINER_ENV => Some("/override/env.cask".to_string()),
        _ => None,
    });

    assert_eq!(config.container.path, PathBuf::from("/override/env.cask"));
}

/// Test complete config serialization/deserialization cycle
#[test]
fn test_config_full_roundtrip_with_all_sections() {
    let original = Config::default();

    let temp = tempdir().unwrap();
    let config_path = temp.path().join("config.toml");
    std::fs::write(&config_path, Config::default_toml().unwrap()).unwrap();

    let loaded = Config::load_from(Some(config_path.as_path()), None).unwrap();
    assert_eq!(original, loaded);
}
