use std::path::{Path, PathBuf};

use claimstore_core::{AgentSettings, AgentSettingsSource, ClaimStoreError};
use parking_lot::Mutex;
use tracing::info;

use crate::loader::ConfigLoader;

/// Agent settings re-read from a configuration file on every request, so
/// that edits are picked up by the next collection pass without a restart.
#[derive(Debug)]
pub struct FileSettingsSource {
    path: PathBuf,
    current: Mutex<Option<AgentSettings>>,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AgentSettingsSource for FileSettingsSource {
    fn agent_settings(&self) -> claimstore_core::Result<AgentSettings> {
        let settings = ConfigLoader::load_agent_settings(&self.path)
            .map_err(|err| ClaimStoreError::Settings(format!("{}: {err}", self.path.display())))?;

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|previous| previous != &settings) {
            info!(
                path = %self.path.display(),
                check_in_directories = ?settings.check_in_directories,
                check_out_directory = %settings.check_out_directory.display(),
                polling_interval = ?settings.polling_interval,
                file_lock_timeout = ?settings.file_lock_timeout,
                "Claim store agent settings changed"
            );
        }
        *current = Some(settings.clone());
        Ok(settings)
    }
}
