//! Discovery of collectible message bodies and their sequential collection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tracing::{debug, error, warn};

use crate::data_file::DataFile;
use crate::error::Result;
use crate::message_body::MessageBody;
use crate::servant::DataFileServant;

/// Files left uncollected for longer than this are reported at `error`.
pub const STALE_CAPTURE_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Lock age, as a multiple of the file lock timeout, past which a lock is
/// reported as troublesome.
pub const TROUBLESOME_LOCK_FACTOR: u32 = 3;

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    /// Message bodies whose whole transition sequence went through.
    pub collected: usize,
    /// Message bodies left for the next pass.
    pub awaiting_retry: usize,
}

impl CollectionReport {
    pub fn total(&self) -> usize {
        self.collected + self.awaiting_retry
    }
}

/// Lazily lists `directories`, in order, and yields a message body for every
/// data file that is either unlocked or whose lock is older than
/// `file_lock_timeout` at `now`.
///
/// Files not matching the data file name grammar are skipped. A directory
/// that cannot be listed is skipped for this pass unless the failure is
/// fatal, in which case the error is yielded and the stream ends.
pub fn enumerate_message_bodies<'a>(
    servant: &'a dyn DataFileServant,
    directories: &'a [PathBuf],
    file_lock_timeout: Duration,
    now: DateTime<Utc>,
) -> impl Stream<Item = Result<MessageBody>> + Send + 'a {
    async_stream::stream! {
        for directory in directories {
            debug!(directory = %directory.display(), "Enumerating message body data files");
            let files = match servant.list_files(directory).await {
                Ok(files) => files,
                Err(err) if err.is_fatal() => {
                    yield Err(err);
                    return;
                }
                Err(err) => {
                    warn!(directory = %directory.display(), error = %err, "Failed to list check-in directory");
                    continue;
                }
            };

            for path in files {
                let data_file = match DataFile::open(&path) {
                    Ok(data_file) => data_file,
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "Skipping file that is not a message body data file");
                        continue;
                    }
                };
                report_stale_capture(servant, &data_file, now).await;
                if is_collectible(&data_file, file_lock_timeout, now) {
                    yield Ok(MessageBody::create(data_file));
                } else {
                    debug!(data_file = %data_file, "Skipping locked message body data file");
                }
            }
        }
    }
}

/// Collects every message body of `message_bodies`, in enumeration order.
pub async fn collect_message_bodies<S>(
    message_bodies: S,
    gathering_directory: &Path,
    servant: &dyn DataFileServant,
) -> Result<CollectionReport>
where
    S: Stream<Item = Result<MessageBody>>,
{
    let mut report = CollectionReport::default();
    let mut message_bodies = std::pin::pin!(message_bodies);
    while let Some(message_body) = message_bodies.next().await {
        let mut message_body = message_body?;
        message_body.collect(gathering_directory, servant).await?;
        if message_body.data_file().is_awaiting_retry() {
            report.awaiting_retry += 1;
        } else {
            report.collected += 1;
        }
    }
    Ok(report)
}

fn is_collectible(data_file: &DataFile, file_lock_timeout: Duration, now: DateTime<Utc>) -> bool {
    let Some(lock_time) = data_file.lock_time() else {
        return true;
    };
    match (now - lock_time).to_std() {
        Ok(lock_age) => {
            if lock_age > file_lock_timeout * TROUBLESOME_LOCK_FACTOR {
                warn!(
                    data_file = %data_file,
                    lock_age_minutes = lock_age.as_secs() / 60,
                    "Lock on message body data file was acquired long ago and its processing could not be pursued since then"
                );
            }
            lock_age > file_lock_timeout
        }
        // lock taken in the future by a remote agent with a skewed clock
        Err(_) => false,
    }
}

async fn report_stale_capture(servant: &dyn DataFileServant, data_file: &DataFile, now: DateTime<Utc>) {
    let Some(created) = servant.creation_time(data_file.path()).await else {
        return;
    };
    if let Ok(age) = (now - created).to_std()
        && age > STALE_CAPTURE_AGE
    {
        error!(
            data_file = %data_file,
            age_hours = age.as_secs() / 3600,
            "Message body data file was captured long ago and could not be collected since then"
        );
    }
}
