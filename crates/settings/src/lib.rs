//! Stakenode Settings
//!
//! JSON settings persistence for stakenode services.
//! Each service defines its own config type and uses `Settings<T>` to persist it.
//! Writes go through a temporary file in the same directory and are renamed
//! into place, so an interrupted save leaves the previous file intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// File name under the service's config directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Errors loading or saving a settings file.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(String),
    #[error("Failed to write settings: {0}")]
    WriteError(String),
    #[error("Failed to parse settings: {0}")]
    ParseError(String),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
    #[error("Invalid settings in {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Checks a config beyond what deserialization enforces.
pub trait Validate {
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Settings wrapper for any serializable config type.
///
/// ```ignore
/// let settings: Settings<NodeConfig> = Settings::load_or_default("stakenode", None)?;
/// ```
pub struct Settings<T> {
    /// The loaded config. Call [`Settings::save`] after changing it.
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned + Default + Validate> Settings<T> {
    /// Load and validate settings from the default path for a service, or
    /// create defaults when no file exists yet.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(service),
        };

        if path.exists() {
            debug!(service, path = %path.display(), "loading settings");
            let content = fs::read_to_string(&path).map_err(|e| SettingsError::ReadError(e.to_string()))?;
            let config: T = serde_json::from_str(&content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
            config
                .validate()
                .map_err(|reason| SettingsError::Invalid { path: path.clone(), reason })?;
            Ok(Self { config, path })
        } else {
            info!(service, path = %path.display(), "writing default settings");
            let settings = Self {
                config: T::default(),
                path,
            };
            settings.save()?;
            Ok(settings)
        }
    }

    /// Validate and atomically replace the settings file.
    pub fn save(&self) -> Result<()> {
        self.config.validate().map_err(|reason| SettingsError::Invalid {
            path: self.path.clone(),
            reason,
        })?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| SettingsError::CreateDirError(e.to_string()))?;

        let content =
            serde_json::to_string_pretty(&self.config).map_err(|e| SettingsError::WriteError(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| SettingsError::WriteError(e.to_string()))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| SettingsError::WriteError(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| SettingsError::WriteError(e.error.to_string()))?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `$XDG_CONFIG_HOME/<service>/settings.json`, falling back to `~/.config`.
pub fn default_settings_path(service: &str) -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(service.to_lowercase()).join(SETTINGS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct TestConfig {
        name: String,
        value: u32,
    }

    impl Validate for TestConfig {
        fn validate(&self) -> std::result::Result<(), String> {
            if self.value > 100 {
                return Err(format!("value {} exceeds 100", self.value));
            }
            Ok(())
        }
    }

    #[test]
    fn test_settings_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-settings.json");

        let settings: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(settings.config, TestConfig::default());
        assert!(path.exists());

        let settings2: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(settings2.config, TestConfig::default());
    }

    #[test]
    fn test_settings_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        settings.config.name = "modified".to_string();
        settings.config.value = 42;
        settings.save().unwrap();

        let loaded: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(loaded.config.name, "modified");
        assert_eq!(loaded.config.value, 42);
    }

    #[test]
    fn test_save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        for value in 1..=3 {
            settings.config.value = value;
            settings.save().unwrap();
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_invalid_config_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        settings.config.value = 7;
        settings.save().unwrap();

        settings.config.value = 500;
        assert!(matches!(settings.save(), Err(SettingsError::Invalid { .. })));

        let on_disk: Settings<TestConfig> = Settings::load_or_default("test", Some(&path)).unwrap();
        assert_eq!(on_disk.config.value, 7);
    }

    #[test]
    fn test_invalid_file_is_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "name": "x", "value": 101 }"#).unwrap();

        let result: Result<Settings<TestConfig>> = Settings::load_or_default("test", Some(&path));
        match result {
            Err(SettingsError::Invalid { reason, .. }) => assert!(reason.contains("exceeds 100")),
            other => panic!("expected invalid settings, got {:?}", other.map(|s| s.config)),
        }
    }

    #[test]
    fn test_corrupt_settings_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let result: Result<Settings<TestConfig>> = Settings::load_or_default("test", Some(&path));
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_default_settings_path() {
        let path = default_settings_path("Stakenode");
        assert!(path.ends_with("stakenode/settings.json"));
    }
}
