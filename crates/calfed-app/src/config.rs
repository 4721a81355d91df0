//! Application configuration.
//!
//! Resolves the data directory and engine tunables from the environment
//! with proper error handling instead of panicking at boot.

use std::env;
use std::path::PathBuf;

use calfed_core::config::EngineConfig;

/// Configuration errors surfaced during startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable value for {var_name}: {value}")]
    InvalidEnvVar { var_name: String, value: String },

    #[error("data directory is not usable: {message}")]
    DataDir { message: String },
}

/// Application configuration.
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub json_logs: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(
            env::var("CALFED_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );
        if data_dir.as_os_str().is_empty() {
            return Err(ConfigError::DataDir {
                message: "CALFED_DATA_DIR is empty".to_string(),
            });
        }

        let json_logs = match env::var("CALFED_LOG_JSON") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var_name: "CALFED_LOG_JSON".to_string(),
                value: raw,
            })?,
            Err(_) => false,
        };

        Ok(Self {
            data_dir,
            engine: EngineConfig::from_env(),
            json_logs,
        })
    }
}
