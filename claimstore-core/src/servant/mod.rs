//! The single seam through which the collector touches the outside world.
//!
//! Every `try_*` operation reports a transient failure (file held by another
//! process, permission hiccup, network share blip, database timeout) as
//! `Ok(false)` after logging it, so that the calling transition can park its
//! data file until the next pass. Only fatal conditions surface as `Err`.

#[cfg(feature = "database")]
pub mod postgres;
pub mod tokens;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::error::{ClaimStoreError, Result};
use tokens::ClaimTokenRepository;

#[cfg(feature = "database")]
pub use postgres::PostgresClaimTokenRepository;
pub use tokens::{InMemoryClaimTokenRepository, PendingTokenRelease};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataFileServant: Send + Sync {
    /// Creates the parent directory of `file_path`.
    async fn try_create_directory(&self, file_path: &Path) -> Result<bool>;

    /// Copies `source` to `target`, overwriting any previous copy.
    async fn try_copy_file(&self, source: &Path, target: &Path) -> Result<bool>;

    /// Atomically renames `source` to `target`.
    async fn try_move_file(&self, source: &Path, target: &Path) -> Result<bool>;

    async fn try_delete_file(&self, path: &Path) -> Result<bool>;

    /// Releases a claim token; succeeds only if exactly one registration was
    /// removed.
    async fn try_release_token(&self, token: &str) -> Result<bool>;

    /// Releases a claim token and renames `source` to `target` as one unit
    /// of work: either both happen or neither does.
    async fn try_release_token_and_move_file(
        &self,
        token: &str,
        source: &Path,
        target: &Path,
    ) -> Result<bool>;

    /// Files, in file-system order, directly contained in `directory`.
    async fn list_files(&self, directory: &Path) -> Result<Vec<PathBuf>>;

    /// When the file was captured, if the platform can tell.
    async fn creation_time(&self, path: &Path) -> Option<DateTime<Utc>>;
}

/// Servant backed by the local file system and a claim token repository.
#[derive(Debug, Clone)]
pub struct FileSystemServant {
    tokens: Arc<dyn ClaimTokenRepository>,
}

impl FileSystemServant {
    pub fn new(tokens: Arc<dyn ClaimTokenRepository>) -> Self {
        Self { tokens }
    }

    fn io_outcome(result: io::Result<()>, message: impl FnOnce() -> String) -> Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::OutOfMemory => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "{}", message());
                Ok(false)
            }
        }
    }

    fn token_store_outcome(err: ClaimStoreError, message: impl FnOnce() -> String) -> Result<bool> {
        if err.is_fatal() {
            return Err(err);
        }
        warn!(error = %err, "{}", message());
        Ok(false)
    }
}

#[async_trait]
impl DataFileServant for FileSystemServant {
    async fn try_create_directory(&self, file_path: &Path) -> Result<bool> {
        let Some(directory) = file_path.parent() else {
            warn!(path = %file_path.display(), "Path has no parent directory to create");
            return Ok(false);
        };
        Self::io_outcome(tokio::fs::create_dir_all(directory).await, || {
            format!("Failed to create directory '{}'", directory.display())
        })
    }

    async fn try_copy_file(&self, source: &Path, target: &Path) -> Result<bool> {
        let result = tokio::fs::copy(source, target).await.map(|_| ());
        Self::io_outcome(result, || {
            format!(
                "Failed to copy file from '{}' to '{}'",
                source.display(),
                target.display()
            )
        })
    }

    async fn try_move_file(&self, source: &Path, target: &Path) -> Result<bool> {
        Self::io_outcome(tokio::fs::rename(source, target).await, || {
            format!(
                "Failed to move file from '{}' to '{}'",
                source.display(),
                target.display()
            )
        })
    }

    async fn try_delete_file(&self, path: &Path) -> Result<bool> {
        Self::io_outcome(tokio::fs::remove_file(path).await, || {
            format!("Failed to delete file '{}'", path.display())
        })
    }

    async fn try_release_token(&self, token: &str) -> Result<bool> {
        let failure = || format!("Failed to release claim check token '{token}'");
        let pending = match self.tokens.begin_release(token).await {
            Ok(pending) => pending,
            Err(err) => return Self::token_store_outcome(err, failure),
        };
        if pending.rows_affected() != 1 {
            warn!(token, rows = pending.rows_affected(), "Claim check token is not registered");
            if let Err(err) = pending.rollback().await {
                return Self::token_store_outcome(err, failure);
            }
            return Ok(false);
        }
        match pending.commit().await {
            Ok(()) => Ok(true),
            Err(err) => Self::token_store_outcome(err, failure),
        }
    }

    async fn try_release_token_and_move_file(
        &self,
        token: &str,
        source: &Path,
        target: &Path,
    ) -> Result<bool> {
        let failure = || {
            format!(
                "Failed to release claim check token '{token}' and move file '{}'",
                source.display()
            )
        };

        let pending = match self.tokens.begin_release(token).await {
            Ok(pending) => pending,
            Err(err) => return Self::token_store_outcome(err, failure),
        };
        if pending.rows_affected() != 1 {
            warn!(token, rows = pending.rows_affected(), "Claim check token is not registered");
            if let Err(err) = pending.rollback().await {
                return Self::token_store_outcome(err, failure);
            }
            return Ok(false);
        }

        if !self.try_move_file(source, target).await? {
            if let Err(err) = pending.rollback().await {
                return Self::token_store_outcome(err, failure);
            }
            return Ok(false);
        }

        match pending.commit().await {
            Ok(()) => Ok(true),
            Err(err) => {
                // the rename went through but the release did not: undo it
                if !self.try_move_file(target, source).await? {
                    error!(
                        token,
                        path = %target.display(),
                        "Claim check token release failed to commit and the data file could not be restored; manual intervention required"
                    );
                }
                Self::token_store_outcome(err, failure)
            }
        }
    }

    async fn list_files(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    async fn creation_time(&self, path: &Path) -> Option<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }
}
