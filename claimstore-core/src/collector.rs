//! The scheduler bringing claimed and tracked message bodies into the
//! central claim store.
//!
//! One collection task per collector. A pass runs right after `start()` and
//! the next one is armed `polling_interval` after the previous one ends, so
//! passes never overlap.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::enumerable::{CollectionReport, collect_message_bodies, enumerate_message_bodies};
use crate::error::{ClaimStoreError, Result};
use crate::servant::DataFileServant;
use crate::settings::{AgentSettings, AgentSettingsSource};

pub struct MessageBodyCollector {
    shared: Arc<Shared>,
    running: Mutex<Option<RunningCollection>>,
}

struct Shared {
    settings: Arc<dyn AgentSettingsSource>,
    servant: Arc<dyn DataFileServant>,
    halted: Notify,
}

struct RunningCollection {
    shutdown_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl fmt::Debug for MessageBodyCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .running
            .try_lock()
            .map(|guard| guard.as_ref().is_some_and(RunningCollection::is_alive))
            .unwrap_or(true);
        f.debug_struct("MessageBodyCollector")
            .field("running", &running)
            .finish()
    }
}

impl MessageBodyCollector {
    pub fn new(settings: Arc<dyn AgentSettingsSource>, servant: Arc<dyn DataFileServant>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                servant,
                halted: Notify::new(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Starts the collection task. Starting a running collector is a no-op;
    /// a collection task that has halted is replaced.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(collection) if collection.is_alive() => {
                *running = Some(collection);
                debug!("Message body collector is already running");
                return Ok(());
            }
            Some(collection) => {
                if let Err(err) = collection.handle.await {
                    warn!(error = %err, "Previous message body collection task ended abnormally");
                }
            }
            None => {}
        }

        let settings = match read_settings(&self.shared.settings).await {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = %err, "Failed to read claim store agent settings");
                return Err(err);
            }
        };
        info!(
            check_in_directories = ?settings.check_in_directories,
            check_out_directory = %settings.check_out_directory.display(),
            "Claim store agent is starting"
        );

        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), shutdown_token.clone()));
        *running = Some(RunningCollection {
            shutdown_token,
            handle,
        });
        Ok(())
    }

    /// Stops the collection task, waiting for an in-flight pass to complete.
    /// Stopping a stopped collector is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(collection) = running.take() else {
            return;
        };
        collection.shutdown_token.cancel();
        if let Err(err) = collection.handle.await {
            error!(error = %err, "Message body collection task ended abnormally");
        }
        info!("Claim store agent stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(RunningCollection::is_alive)
    }

    /// Runs a single collection pass with the current settings.
    pub async fn collect_once(&self) -> Result<CollectionReport> {
        collect(&self.shared).await
    }

    /// Resolves once the collection task has ended for any reason other
    /// than [`stop`](Self::stop).
    pub async fn halted(&self) {
        self.shared.halted.notified().await;
    }
}

impl RunningCollection {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

async fn run(shared: Arc<Shared>, shutdown_token: CancellationToken) {
    let _halt = HaltSignal {
        shared: Arc::clone(&shared),
        shutdown_token: shutdown_token.clone(),
    };

    loop {
        match collect(&shared).await {
            Ok(report) => debug!(
                collected = report.collected,
                awaiting_retry = report.awaiting_retry,
                "Collection pass completed"
            ),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "A fatal error occurred while collecting claimed and tracked message bodies");
                panic!("fatal error while collecting message bodies: {err}");
            }
            Err(err) => {
                error!(error = %err, "An error occurred while collecting claimed and tracked message bodies");
            }
        }

        let polling_interval = match read_settings(&shared.settings).await {
            Ok(settings) => settings.polling_interval,
            Err(err) => {
                error!(error = %err, "Failed to read claim store agent settings, using default polling interval");
                AgentSettings::DEFAULT_POLLING_INTERVAL
            }
        };

        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = tokio::time::sleep(polling_interval) => {}
        }
    }
}

async fn collect(shared: &Shared) -> Result<CollectionReport> {
    let settings = read_settings(&shared.settings).await?;
    let servant = shared.servant.as_ref();
    let message_bodies = enumerate_message_bodies(
        servant,
        &settings.check_in_directories,
        settings.file_lock_timeout,
        Utc::now(),
    );
    collect_message_bodies(message_bodies, &settings.check_out_directory, servant).await
}

/// Settings sources may hit the file system, so they are read on the
/// blocking pool.
async fn read_settings(source: &Arc<dyn AgentSettingsSource>) -> Result<AgentSettings> {
    let source = Arc::clone(source);
    tokio::task::spawn_blocking(move || source.agent_settings())
        .await
        .map_err(|err| ClaimStoreError::Settings(format!("settings reader failed: {err}")))?
}

/// Signals [`MessageBodyCollector::halted`] when the collection task ends,
/// including by panic, without having been asked to.
struct HaltSignal {
    shared: Arc<Shared>,
    shutdown_token: CancellationToken,
}

impl Drop for HaltSignal {
    fn drop(&mut self) {
        if !self.shutdown_token.is_cancelled() {
            self.shared.halted.notify_one();
        }
    }
}
