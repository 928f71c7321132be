//! Service configuration
//!
//! Settings file location and the errors raised while loading it.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

pub use settings::{BackendKind, ServiceSettings};

/// Environment variable naming an explicit settings file
pub const SETTINGS_PATH_ENV: &str = "FINSERVE_SETTINGS";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Get the service data directory
///
/// Returns the platform-specific data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\finserve\finserve`
/// - macOS: `/Users/{user}/Library/Application Support/com.finserve.finserve`
/// - Linux: `/home/{user}/.local/share/finserve`
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "finserve", "finserve")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDirError("Could not determine data directory".to_string()))
}

/// Settings file path: `FINSERVE_SETTINGS` if set, else `settings.json` in
/// the data directory.
pub fn get_settings_path() -> Result<PathBuf, ConfigError> {
    match std::env::var(SETTINGS_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(get_data_dir()?.join("settings.json")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        let path = get_data_dir().unwrap();
        assert!(path.to_string_lossy().contains("finserve"));
    }
}
