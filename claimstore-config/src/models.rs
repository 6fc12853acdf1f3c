use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML or JSON file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub agent: FileAgentConfig,
    pub capture: Option<FileCaptureConfig>,
    #[serde(default)]
    pub database: FileDatabaseConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAgentConfig {
    #[serde(default)]
    pub check_in_directories: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_directory: Option<PathBuf>,
    /// Humantime duration, e.g. `"30m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_lock_timeout: Option<String>,
    /// Humantime duration, e.g. `"1m"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCaptureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_threshold: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Environment variables consulted while loading the configuration.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// `CLAIMSTORE_CONFIG_PATH`
    pub config_path: Option<PathBuf>,
    /// `DATABASE_URL`
    pub database_url: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
        };
        Self {
            config_path: non_empty("CLAIMSTORE_CONFIG_PATH").map(PathBuf::from),
            database_url: non_empty("DATABASE_URL"),
        }
    }
}
