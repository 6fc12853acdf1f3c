use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClaimStoreError, Result};

/// Settings driving the collection of message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    /// Local directories scanned for data files, in scan order.
    pub check_in_directories: Vec<PathBuf>,
    /// Root of the central claim store.
    pub check_out_directory: PathBuf,
    /// Age past which another agent's lock is considered abandoned.
    pub file_lock_timeout: Duration,
    /// Delay between the end of a pass and the start of the next one.
    pub polling_interval: Duration,
}

impl AgentSettings {
    pub const DEFAULT_FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(check_in_directories: Vec<PathBuf>, check_out_directory: impl Into<PathBuf>) -> Self {
        Self {
            check_in_directories,
            check_out_directory: check_out_directory.into(),
            file_lock_timeout: Self::DEFAULT_FILE_LOCK_TIMEOUT,
            polling_interval: Self::DEFAULT_POLLING_INTERVAL,
        }
    }

    pub fn with_file_lock_timeout(mut self, timeout: Duration) -> Self {
        self.file_lock_timeout = timeout;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_in_directories.is_empty() {
            return Err(ClaimStoreError::Settings(
                "at least one check-in directory is required".into(),
            ));
        }
        if self.file_lock_timeout.is_zero() {
            return Err(ClaimStoreError::Settings(
                "file lock timeout must be strictly positive".into(),
            ));
        }
        if self.polling_interval.is_zero() {
            return Err(ClaimStoreError::Settings(
                "polling interval must be strictly positive".into(),
            ));
        }
        Ok(())
    }
}

/// Supplies the current agent settings.
///
/// Read at the start of every collection pass and whenever the next pass is
/// scheduled, so implementations may pick up configuration changes.
pub trait AgentSettingsSource: Send + Sync {
    fn agent_settings(&self) -> Result<AgentSettings>;
}

impl AgentSettingsSource for AgentSettings {
    fn agent_settings(&self) -> Result<AgentSettings> {
        Ok(self.clone())
    }
}

/// Settings of the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub check_in_directory: PathBuf,
    pub check_out_directory: PathBuf,
    /// Payloads smaller than this many bytes are not claimed.
    pub claim_threshold: usize,
}

impl CaptureSettings {
    pub const DEFAULT_CLAIM_THRESHOLD: usize = 64 * 1024;

    pub fn new(check_in_directory: impl Into<PathBuf>, check_out_directory: impl Into<PathBuf>) -> Self {
        Self {
            check_in_directory: check_in_directory.into(),
            check_out_directory: check_out_directory.into(),
            claim_threshold: Self::DEFAULT_CLAIM_THRESHOLD,
        }
    }

    pub fn with_claim_threshold(mut self, threshold: usize) -> Self {
        self.claim_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = AgentSettings::new(vec![PathBuf::from("/in")], "/out");
        assert_eq!(settings.file_lock_timeout, Duration::from_secs(1800));
        assert_eq!(settings.polling_interval, Duration::from_secs(60));
        assert!(settings.validate().is_ok());
        assert_eq!(
            CaptureSettings::new("/in", "/out").claim_threshold,
            64 * 1024
        );
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        assert!(AgentSettings::new(Vec::new(), "/out").validate().is_err());
        assert!(
            AgentSettings::new(vec![PathBuf::from("/in")], "/out")
                .with_polling_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            AgentSettings::new(vec![PathBuf::from("/in")], "/out")
                .with_file_lock_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
