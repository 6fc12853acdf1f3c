//! Message body data files and their lifecycle.
//!
//! A [`DataFile`] is a payload sitting in a check-in directory. Everything
//! about it (capture date, id, tracking mode, state and lock time) is
//! encoded in its file name, see [`tokenizer`]. State changes happen by
//! atomic rename only, so a `DataFile` value is a snapshot: transitions
//! return the next snapshot instead of mutating the current one.

pub mod tokenizer;
mod transitions;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{ClaimStoreError, Result};

/// How a captured payload is handed over to the central store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingMode {
    /// `chk`: the payload is claimed and a database token must be released
    /// once it has reached the central store.
    Claimed,
    /// `trk`: the payload is archived for tracking purposes only.
    Tracked,
}

impl TrackingMode {
    pub const fn token(&self) -> &'static str {
        match self {
            TrackingMode::Claimed => "chk",
            TrackingMode::Tracked => "trk",
        }
    }
}

impl FromStr for TrackingMode {
    type Err = ClaimStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chk" => Ok(TrackingMode::Claimed),
            "trk" => Ok(TrackingMode::Tracked),
            other => Err(ClaimStoreError::UnsupportedTrackingMode(other.to_string())),
        }
    }
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// State suffix of a data file that an agent has taken hold of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Locked,
    Gathered,
    Released,
}

impl LockState {
    pub const fn token(&self) -> &'static str {
        match self {
            LockState::Locked => "locked",
            LockState::Gathered => "gathered",
            LockState::Released => "released",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "locked" => Some(LockState::Locked),
            "gathered" => Some(LockState::Gathered),
            "released" => Some(LockState::Released),
            _ => None,
        }
    }
}

/// Lifecycle state of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileState {
    Unlocked,
    Locked { lock_time: DateTime<Utc> },
    Gathered { lock_time: DateTime<Utc> },
    Released { lock_time: DateTime<Utc> },
    /// A transition failed during this pass; every further transition is a
    /// no-op until the next pass re-reads the file from disk.
    AwaitingRetry { lock_time: Option<DateTime<Utc>> },
}

impl DataFileState {
    pub const fn name(&self) -> &'static str {
        match self {
            DataFileState::Unlocked => "unlocked",
            DataFileState::Locked { .. } => "locked",
            DataFileState::Gathered { .. } => "gathered",
            DataFileState::Released { .. } => "released",
            DataFileState::AwaitingRetry { .. } => "awaiting retry",
        }
    }

    pub const fn lock_time(&self) -> Option<DateTime<Utc>> {
        match *self {
            DataFileState::Unlocked => None,
            DataFileState::Locked { lock_time }
            | DataFileState::Gathered { lock_time }
            | DataFileState::Released { lock_time } => Some(lock_time),
            DataFileState::AwaitingRetry { lock_time } => lock_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    path: PathBuf,
    capture_date: String,
    id: String,
    tracking_mode: TrackingMode,
    state: DataFileState,
}

impl DataFile {
    /// Builds the data file found at `path`, its state being whatever the
    /// file name says.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tokens = tokenizer::tokenize(&path)?;
        let state = match (tokens.state, tokens.lock_time) {
            (Some(LockState::Locked), Some(lock_time)) => DataFileState::Locked { lock_time },
            (Some(LockState::Gathered), Some(lock_time)) => {
                DataFileState::Gathered { lock_time }
            }
            (Some(LockState::Released), Some(lock_time)) => {
                DataFileState::Released { lock_time }
            }
            _ => DataFileState::Unlocked,
        };
        Ok(Self {
            path,
            capture_date: tokens.capture_date,
            id: tokens.id,
            tracking_mode: tokens.tracking_mode,
            state,
        })
    }

    /// Builds the data file at `path` and fails unless its name carries the
    /// `expected` state (`None` standing for unlocked).
    pub fn open_expecting(path: impl Into<PathBuf>, expected: Option<LockState>) -> Result<Self> {
        let data_file = Self::open(path)?;
        let actual = match data_file.state {
            DataFileState::Locked { .. } => Some(LockState::Locked),
            DataFileState::Gathered { .. } => Some(LockState::Gathered),
            DataFileState::Released { .. } => Some(LockState::Released),
            _ => None,
        };
        if actual != expected {
            return Err(ClaimStoreError::UnexpectedState {
                path: data_file.path,
                expected: expected.map_or("unlocked", |state| state.token()),
                actual: actual.map_or("undefined", |state| state.token()).to_string(),
            });
        }
        Ok(data_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capture_date(&self) -> &str {
        &self.capture_date
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking_mode
    }

    pub fn state(&self) -> DataFileState {
        self.state
    }

    pub fn lock_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock_time()
    }

    pub fn is_awaiting_retry(&self) -> bool {
        matches!(self.state, DataFileState::AwaitingRetry { .. })
    }

    /// `<capture date>/<id>`: sub path of the payload in the central store,
    /// and the claim token registered for claimed payloads.
    pub fn claim_store_relative_path(&self) -> String {
        format!("{}/{}", self.capture_date, self.id)
    }

    /// Location of the payload once gathered under `gathering_directory`.
    pub fn claim_store_path(&self, gathering_directory: &Path) -> PathBuf {
        gathering_directory.join(&self.capture_date).join(&self.id)
    }

    pub(crate) fn awaiting_retry(&self) -> DataFile {
        DataFile {
            state: DataFileState::AwaitingRetry {
                lock_time: self.lock_time(),
            },
            ..self.clone()
        }
    }
}

impl fmt::Display for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path.file_name() {
            Some(name) => write!(f, "{}", name.to_string_lossy()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}
