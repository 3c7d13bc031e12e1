//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is read from a TOML file. Everything in it is optional:
//! a missing file produces defaults and a warning, never a startup failure.
//!
//! Root folder resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `MIDIME_ROOT_FOLDER` environment variable
//! 3. TOML config file (`root_folder` key)
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "MIDIME_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "midime.db";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Root folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load a TOML config file
///
/// Returns `Error::Config` when the file exists but cannot be parsed.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Load the TOML config from the platform location, falling back to defaults
pub fn load_toml_config_or_default() -> TomlConfig {
    match default_config_path() {
        Some(path) if path.exists() => match load_toml_config(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded TOML config");
                config
            }
            Err(e) => {
                warn!(error = %e, "Invalid TOML config, using defaults");
                TomlConfig::default()
            }
        },
        _ => {
            warn!("No TOML config found, using defaults");
            TomlConfig::default()
        }
    }
}

/// Platform config file path
///
/// Linux checks `~/.config/midime/config.toml` first, then `/etc/midime/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("midime").join("config.toml"));

    if cfg!(target_os = "linux") {
        if let Some(path) = &user_config {
            if path.exists() {
                return user_config;
            }
        }
        let system_config = PathBuf::from("/etc/midime/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    user_config
}

/// Resolves the root folder following the documented priority order
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_config: TomlConfig,
}

impl RootFolderResolver {
    pub fn new(cli_arg: Option<PathBuf>, toml_config: TomlConfig) -> Self {
        Self {
            cli_arg,
            toml_config,
        }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_config.root_folder {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Ensures the root folder exists and derives paths inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!(path = %self.root_folder.display(), "Created root folder");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("midime"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/midime"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("midime"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/midime"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("midime"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\midime"))
    } else {
        PathBuf::from("./midime_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
    }

    #[test]
    fn test_empty_toml_parses_to_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
    }

    #[test]
    fn test_cli_arg_wins() {
        let toml_config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            logging: LoggingConfig::default(),
        };
        let resolver = RootFolderResolver::new(Some(PathBuf::from("/from/cli")), toml_config);
        assert_eq!(resolver.resolve(), PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_database_path() {
        let init = RootFolderInitializer::new(PathBuf::from("/tmp/midime-root"));
        assert_eq!(
            init.database_path(),
            PathBuf::from("/tmp/midime-root").join(DATABASE_FILE)
        );
    }
}
