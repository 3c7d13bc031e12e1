//! Unit tests for configuration and graceful degradation
//!
//! Uses serial_test to prevent environment variable races: tests touching
//! MIDIME_ROOT_FOLDER are marked #[serial].

use midime_common::config::{
    load_toml_config, LoggingConfig, RootFolderInitializer,
    RootFolderResolver, TomlConfig, ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_env_var_overrides_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/from/env");

    let toml_config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        logging: LoggingConfig::default(),
    };
    let resolver = RootFolderResolver::new(None, toml_config);
    assert_eq!(resolver.resolve(), PathBuf::from("/from/env"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_toml_used_when_env_missing() {
    env::remove_var(ROOT_FOLDER_ENV);

    let toml_config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        logging: LoggingConfig::default(),
    };
    let resolver = RootFolderResolver::new(None, toml_config);
    assert_eq!(resolver.resolve(), PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_default_root_folder_when_nothing_configured() {
    env::remove_var(ROOT_FOLDER_ENV);

    let resolver = RootFolderResolver::new(None, TomlConfig::default());
    let resolved = resolver.resolve();
    assert!(!resolved.as_os_str().is_empty());
    assert!(resolved.to_string_lossy().contains("midime"));
}

#[test]
fn test_load_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        "root_folder = \"/srv/midime\"\n\n[logging]\nlevel = \"debug\"\n",
    )
    .unwrap();

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(
        loaded,
        TomlConfig {
            root_folder: Some(PathBuf::from("/srv/midime")),
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
        }
    );
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, "root_folder = [unterminated").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, midime_common::Error::Config(_)));
}

#[test]
fn test_initializer_creates_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("a").join("b");

    let init = RootFolderInitializer::new(root.clone());
    init.ensure_directory_exists().unwrap();
    assert!(root.is_dir());
}
