//! Transition sequences driving a data file to the central store.

use std::path::Path;

use tracing::debug;

use crate::data_file::{DataFile, TrackingMode};
use crate::error::Result;
use crate::servant::DataFileServant;

/// A data file bound to the sequence of transitions its tracking mode
/// requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// `chk` payloads: lock, gather, release, unlock.
    Claimed(DataFile),
    /// `trk` payloads: lock, gather, unlock. No claim token is involved.
    Tracked(DataFile),
}

impl MessageBody {
    pub fn create(data_file: DataFile) -> Self {
        match data_file.tracking_mode() {
            TrackingMode::Claimed => MessageBody::Claimed(data_file),
            TrackingMode::Tracked => MessageBody::Tracked(data_file),
        }
    }

    pub fn data_file(&self) -> &DataFile {
        match self {
            MessageBody::Claimed(data_file) | MessageBody::Tracked(data_file) => data_file,
        }
    }

    /// Runs the whole sequence. Each step works on the data file left by
    /// the previous one, so a step that ends up awaiting retry turns the
    /// remaining ones into no-ops.
    pub async fn collect(
        &mut self,
        gathering_directory: &Path,
        servant: &dyn DataFileServant,
    ) -> Result<()> {
        debug!(data_file = %self.data_file(), "Collecting message body");
        let claimed = matches!(self, MessageBody::Claimed(_));
        let slot = match self {
            MessageBody::Claimed(data_file) | MessageBody::Tracked(data_file) => data_file,
        };

        *slot = slot.lock(servant).await?;
        *slot = slot.gather(gathering_directory, servant).await?;
        if claimed {
            *slot = slot.release(servant).await?;
        }
        *slot = slot.unlock(servant).await?;
        Ok(())
    }
}
