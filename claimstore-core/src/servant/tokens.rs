//! Claim token registry seam.
//!
//! Claimed payloads are registered in a database under their claim store
//! relative path when captured, and released once the collector has moved
//! them to the central store. Releasing is split in two phases so the caller
//! can couple it with a file rename.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ClaimStoreError, Result};

#[async_trait]
pub trait ClaimTokenRepository: Send + Sync + fmt::Debug {
    /// Registers the token of a freshly claimed payload.
    async fn check_in(&self, token: &str) -> Result<()>;

    /// Releases `token` inside a transaction that is neither committed nor
    /// rolled back yet.
    async fn begin_release(&self, token: &str) -> Result<Box<dyn PendingTokenRelease>>;
}

/// A token release awaiting its outcome.
#[async_trait]
pub trait PendingTokenRelease: Send {
    /// Number of registrations the release removed; exactly one means the
    /// token was known and is now released.
    fn rows_affected(&self) -> u64;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Process-local registry, used by tests and by agents running without a
/// database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClaimTokenRepository {
    tokens: Arc<Mutex<HashSet<String>>>,
    reject_commits: Arc<AtomicBool>,
}

impl InMemoryClaimTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let repository = Self::new();
        repository
            .tokens
            .lock()
            .extend(tokens.into_iter().map(Into::into));
        repository
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.lock().contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Makes every subsequent commit fail, simulating a lost connection
    /// between the release and its commit.
    pub fn reject_commits(&self, reject: bool) {
        self.reject_commits.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClaimTokenRepository for InMemoryClaimTokenRepository {
    async fn check_in(&self, token: &str) -> Result<()> {
        if !self.tokens.lock().insert(token.to_string()) {
            return Err(ClaimStoreError::TokenStore(format!(
                "claim token '{token}' is already checked in"
            )));
        }
        Ok(())
    }

    async fn begin_release(&self, token: &str) -> Result<Box<dyn PendingTokenRelease>> {
        let rows_affected = u64::from(self.tokens.lock().contains(token));
        Ok(Box::new(InMemoryPendingRelease {
            tokens: Arc::clone(&self.tokens),
            token: token.to_string(),
            rows_affected,
            reject_commit: self.reject_commits.load(Ordering::SeqCst),
        }))
    }
}

struct InMemoryPendingRelease {
    tokens: Arc<Mutex<HashSet<String>>>,
    token: String,
    rows_affected: u64,
    reject_commit: bool,
}

#[async_trait]
impl PendingTokenRelease for InMemoryPendingRelease {
    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.reject_commit {
            return Err(ClaimStoreError::TokenStore(format!(
                "commit of claim token '{}' release rejected",
                self.token
            )));
        }
        self.tokens.lock().remove(&self.token);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
