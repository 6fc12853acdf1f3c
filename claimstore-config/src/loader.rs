use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use claimstore_core::{AgentSettings, CaptureSettings};
use tracing::debug;

use crate::error::ConfigLoadError;
use crate::models::{EnvConfig, FileAgentConfig, FileCaptureConfig, FileConfig};

const CANDIDATES: &[&str] = &[
    "claimstore.toml",
    "config/claimstore.toml",
    "claimstore.json",
];

/// Fully resolved and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentSettings,
    pub capture: CaptureSettings,
    pub database_url: Option<String>,
    /// File the configuration was read from.
    pub path: PathBuf,
}

/// Where a configuration file path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    env: EnvConfig,
}

impl ConfigLoader {
    pub fn new(env: EnvConfig) -> Self {
        Self {
            explicit_path: None,
            env,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EnvConfig::from_env())
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Explicit path, then `CLAIMSTORE_CONFIG_PATH`, then the first default
    /// candidate present in the working directory.
    pub fn resolve_path(&self) -> Result<(PathBuf, ConfigPathProvenance), ConfigLoadError> {
        if let Some(path) = &self.explicit_path {
            return Ok((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env.config_path {
            return Ok((path.clone(), ConfigPathProvenance::Env));
        }
        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| (path.to_path_buf(), ConfigPathProvenance::Default))
            .ok_or(ConfigLoadError::NotFound)
    }

    pub fn load(&self) -> Result<Config, ConfigLoadError> {
        let (path, provenance) = self.resolve_path()?;
        debug!(path = %path.display(), ?provenance, "Loading claim store configuration");
        let file = read_file_config(&path)?;
        self.resolve(file, path)
    }

    /// Reads only the agent settings from `path`.
    ///
    /// Directories are not required to exist: an unreachable check-in
    /// directory is skipped by the collection pass rather than failing it.
    pub fn load_agent_settings(path: &Path) -> Result<AgentSettings, ConfigLoadError> {
        let file = read_file_config(path)?;
        let agent = agent_settings(&file.agent)?;
        validate_agent(&agent)?;
        Ok(agent)
    }

    fn resolve(&self, file: FileConfig, path: PathBuf) -> Result<Config, ConfigLoadError> {
        let agent = agent_settings(&file.agent)?;
        validate_agent(&agent)?;
        ensure_directories_exist(&agent)?;
        let capture = capture_settings(file.capture.as_ref(), &agent);
        validate_capture(&capture)?;

        let database_url = self
            .env
            .database_url
            .clone()
            .or(file.database.url)
            .filter(|url| !url.trim().is_empty());

        Ok(Config {
            agent,
            capture,
            database_url,
            path,
        })
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    if !path.exists() {
        return Err(ConfigLoadError::MissingConfig {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|source| {
            ConfigLoadError::ParseJson {
                path: path.to_path_buf(),
                source,
            }
        }),
        _ => toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn agent_settings(file: &FileAgentConfig) -> Result<AgentSettings, ConfigLoadError> {
    let check_out_directory = file
        .check_out_directory
        .clone()
        .ok_or_else(|| ConfigLoadError::Invalid("agent.check_out_directory is required".into()))?;

    let mut settings = AgentSettings::new(file.check_in_directories.clone(), check_out_directory);
    if let Some(value) = &file.file_lock_timeout {
        settings.file_lock_timeout = parse_duration("agent.file_lock_timeout", value)?;
    }
    if let Some(value) = &file.polling_interval {
        settings.polling_interval = parse_duration("agent.polling_interval", value)?;
    }
    Ok(settings)
}

fn capture_settings(file: Option<&FileCaptureConfig>, agent: &AgentSettings) -> CaptureSettings {
    let file = file.cloned().unwrap_or_default();
    let check_in_directory = file
        .check_in_directory
        .or_else(|| agent.check_in_directories.first().cloned())
        .unwrap_or_else(|| agent.check_out_directory.clone());
    let check_out_directory = file
        .check_out_directory
        .unwrap_or_else(|| agent.check_out_directory.clone());

    let settings = CaptureSettings::new(check_in_directory, check_out_directory);
    match file.claim_threshold {
        Some(threshold) => settings.with_claim_threshold(threshold),
        None => settings,
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(value.trim()).map_err(|source| ConfigLoadError::InvalidDuration {
        field,
        value: value.to_string(),
        source,
    })
}

fn validate_agent(agent: &AgentSettings) -> Result<(), ConfigLoadError> {
    agent
        .validate()
        .map_err(|err| ConfigLoadError::Invalid(err.to_string()))
}

fn ensure_directories_exist(agent: &AgentSettings) -> Result<(), ConfigLoadError> {
    for directory in agent
        .check_in_directories
        .iter()
        .chain(std::iter::once(&agent.check_out_directory))
    {
        if !directory.is_dir() {
            return Err(ConfigLoadError::Invalid(format!(
                "directory '{}' does not exist",
                directory.display()
            )));
        }
    }
    Ok(())
}

fn validate_capture(capture: &CaptureSettings) -> Result<(), ConfigLoadError> {
    if capture.claim_threshold == 0 {
        return Err(ConfigLoadError::Invalid(
            "capture.claim_threshold must be strictly positive".into(),
        ));
    }
    Ok(())
}
