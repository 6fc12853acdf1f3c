use std::path::Path;

use tracing::debug;

use super::tokenizer::new_name_for_state;
use super::{DataFile, DataFileState, LockState};
use crate::error::{ClaimStoreError, Result};
use crate::servant::DataFileServant;

impl DataFile {
    /// Takes, or refreshes, this agent's exclusive hold on the data file.
    ///
    /// The lock timestamp is renewed while staying in the current state, so
    /// that a remote agent sharing the check-in directory never mistakes a
    /// file being worked on for an abandoned one.
    pub async fn lock(&self, servant: &dyn DataFileServant) -> Result<DataFile> {
        let target_state = match self.state {
            DataFileState::AwaitingRetry { .. } => return Ok(self.clone()),
            DataFileState::Unlocked | DataFileState::Locked { .. } => LockState::Locked,
            DataFileState::Gathered { .. } => LockState::Gathered,
            DataFileState::Released { .. } => LockState::Released,
        };
        debug!(data_file = %self, "Locking data file");
        self.rename_into(target_state, servant).await
    }

    /// Copies the payload to `<gathering_directory>/<capture date>/<id>` and
    /// marks the local file as gathered.
    pub async fn gather(
        &self,
        gathering_directory: &Path,
        servant: &dyn DataFileServant,
    ) -> Result<DataFile> {
        match self.state {
            DataFileState::Unlocked => Err(self.illegal("gather")),
            DataFileState::Locked { .. } => {
                debug!(data_file = %self, "Gathering data file");
                let target = self.claim_store_path(gathering_directory);
                if !servant.try_create_directory(&target).await?
                    || !servant.try_copy_file(&self.path, &target).await?
                {
                    return Ok(self.awaiting_retry());
                }
                self.rename_into(LockState::Gathered, servant).await
            }
            DataFileState::Gathered { .. } | DataFileState::Released { .. } => {
                debug!(data_file = %self, "Skipping gathering of already gathered data file");
                Ok(self.clone())
            }
            DataFileState::AwaitingRetry { .. } => Ok(self.clone()),
        }
    }

    /// Releases the claim token of a gathered payload, renaming the local
    /// file to its released form in the same unit of work.
    pub async fn release(&self, servant: &dyn DataFileServant) -> Result<DataFile> {
        match self.state {
            DataFileState::Unlocked | DataFileState::Locked { .. } => Err(self.illegal("release")),
            DataFileState::Gathered { .. } => {
                debug!(data_file = %self, "Releasing data file");
                let released_path = new_name_for_state(&self.path, LockState::Released)?;
                let released = DataFile::open_expecting(released_path, Some(LockState::Released))?;
                let token = self.claim_store_relative_path();
                if servant
                    .try_release_token_and_move_file(&token, &self.path, &released.path)
                    .await?
                {
                    Ok(released)
                } else {
                    Ok(self.awaiting_retry())
                }
            }
            DataFileState::Released { .. } => {
                debug!(data_file = %self, "Skipping release of already released data file");
                Ok(self.clone())
            }
            DataFileState::AwaitingRetry { .. } => Ok(self.clone()),
        }
    }

    /// Deletes the local copy of a payload that has reached the central
    /// store. The returned value describes a file that no longer exists.
    pub async fn unlock(&self, servant: &dyn DataFileServant) -> Result<DataFile> {
        match self.state {
            DataFileState::Unlocked | DataFileState::Locked { .. } => Err(self.illegal("unlock")),
            DataFileState::Gathered { .. } | DataFileState::Released { .. } => {
                debug!(data_file = %self, "Unlocking data file");
                if servant.try_delete_file(&self.path).await? {
                    Ok(self.clone())
                } else {
                    Ok(self.awaiting_retry())
                }
            }
            DataFileState::AwaitingRetry { .. } => Ok(self.clone()),
        }
    }

    async fn rename_into(&self, state: LockState, servant: &dyn DataFileServant) -> Result<DataFile> {
        let next_path = new_name_for_state(&self.path, state)?;
        let next = DataFile::open_expecting(next_path, Some(state))?;
        if servant.try_move_file(&self.path, &next.path).await? {
            Ok(next)
        } else {
            Ok(self.awaiting_retry())
        }
    }

    fn illegal(&self, operation: &'static str) -> ClaimStoreError {
        ClaimStoreError::IllegalTransition {
            operation,
            state: self.state.name(),
            file: self.to_string(),
        }
    }
}
