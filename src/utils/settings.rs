//! Settings and configuration utilities.
//!
//! Settings are read from `$HOME/.gitprobe/settings.json`. Every engine
//! option can be overridden by a `GITPROBE_*` environment variable, looked
//! up first in the process environment and then in the file's `env` map.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::EngineOptions;

/// Overrides `EngineOptions::max_symref_hops`.
pub const ENV_MAX_SYMREF_HOPS: &str = "GITPROBE_MAX_SYMREF_HOPS";
/// Overrides `EngineOptions::max_delta_depth`.
pub const ENV_MAX_DELTA_DEPTH: &str = "GITPROBE_MAX_DELTA_DEPTH";
/// Overrides `EngineOptions::io_retries`.
pub const ENV_IO_RETRIES: &str = "GITPROBE_IO_RETRIES";
/// Overrides `EngineOptions::force_rehash`.
pub const ENV_FORCE_REHASH: &str = "GITPROBE_FORCE_REHASH";
/// Overrides `EngineOptions::max_object_size`.
pub const ENV_MAX_OBJECT_SIZE: &str = "GITPROBE_MAX_OBJECT_SIZE";

/// Settings loaded from $HOME/.gitprobe/settings.json.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    /// Environment variable overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Engine options; missing fields keep their defaults.
    #[serde(default)]
    pub engine: EngineOptions,
}

impl Settings {
    /// Loads settings from the default location.
    pub fn load() -> Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::load_from_path(&settings_path)
    }

    /// Loads settings from a specific path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        serde_json::from_str::<Settings>(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }

    /// Returns the default settings path.
    pub fn get_settings_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to determine home directory")?;

        Ok(home_dir.join(".gitprobe").join("settings.json"))
    }

    /// Returns an environment variable with fallback to settings.
    pub fn get_env_var(&self, key: &str) -> Option<String> {
        match env::var(key) {
            Ok(value) => Some(value),
            Err(_) => self.env.get(key).cloned(),
        }
    }

    /// Engine options from the file with environment overrides applied.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let mut options = self.engine.clone();
        self.apply(ENV_MAX_SYMREF_HOPS, &mut options.max_symref_hops)?;
        self.apply(ENV_MAX_DELTA_DEPTH, &mut options.max_delta_depth)?;
        self.apply(ENV_IO_RETRIES, &mut options.io_retries)?;
        self.apply(ENV_MAX_OBJECT_SIZE, &mut options.max_object_size)?;
        if let Some(value) = self.get_env_var(ENV_FORCE_REHASH) {
            options.force_rehash = parse_bool(&value)
                .with_context(|| format!("Invalid value for {ENV_FORCE_REHASH}: {value}"))?;
        }
        Ok(options)
    }

    fn apply<T>(&self, key: &str, slot: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        if let Some(value) = self.get_env_var(key) {
            *slot = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {key}: {value}"))?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn settings_load_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let settings_path = temp_dir.path().join("settings.json");

        let settings_json = r#"{
            "env": {
                "GITPROBE_TEST_ONLY_VAR": "from_file"
            },
            "engine": {
                "maxSymrefHops": 4,
                "ioRetries": 0
            }
        }"#;
        fs::write(&settings_path, settings_json).unwrap();

        let settings = Settings::load_from_path(&settings_path).unwrap();
        assert_eq!(settings.env.get("GITPROBE_TEST_ONLY_VAR").unwrap(), "from_file");
        assert_eq!(settings.engine.max_symref_hops, 4);
        assert_eq!(settings.engine.io_retries, 0);
        assert_eq!(
            settings.engine.max_delta_depth,
            EngineOptions::default().max_delta_depth
        );
    }

    #[test]
    fn missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from_path(temp_dir.path().join("nope.json")).unwrap();
        assert!(settings.env.is_empty());
        assert_eq!(settings.engine, EngineOptions::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let settings_path = temp_dir.path().join("settings.json");
        fs::write(&settings_path, "{ not json").unwrap();
        let err = Settings::load_from_path(&settings_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings file"));
    }

    #[test]
    fn file_env_map_overrides_engine_section() {
        // Keys that are never set in the real environment, so the file's
        // `env` map is what gets consulted.
        let settings = Settings {
            env: HashMap::from([
                (ENV_MAX_DELTA_DEPTH.to_string(), "12".to_string()),
                (ENV_FORCE_REHASH.to_string(), "yes".to_string()),
            ]),
            engine: EngineOptions {
                max_delta_depth: 99,
                ..EngineOptions::default()
            },
        };
        if env::var(ENV_MAX_DELTA_DEPTH).is_ok() || env::var(ENV_FORCE_REHASH).is_ok() {
            return;
        }
        let options = settings.engine_options().unwrap();
        assert_eq!(options.max_delta_depth, 12);
        assert!(options.force_rehash);
    }

    #[test]
    fn invalid_override_is_reported() {
        let settings = Settings {
            env: HashMap::from([(ENV_MAX_OBJECT_SIZE.to_string(), "lots".to_string())]),
            engine: EngineOptions::default(),
        };
        if env::var(ENV_MAX_OBJECT_SIZE).is_ok() {
            return;
        }
        let err = settings.engine_options().unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_OBJECT_SIZE));
    }
}
