//! Filename grammar of message body data files.
//!
//! A data file name is `<capture date><id>.<mode>` while unlocked, and
//! `<capture date><id>.<mode>.<lock timestamp>.<state>` once an agent has
//! taken hold of it. Only the final path component is ever matched; the
//! directory part of a path is carried through untouched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{LockState, TrackingMode};
use crate::error::{ClaimStoreError, Result};

/// Format of the lock timestamp embedded in locked file names.
pub const LOCK_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static DATA_FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<capture_date>[0-9]{8})(?P<id>[0-9A-Fa-f]{32})\.(?P<tracking_mode>trk|chk)(?:\.(?P<lock_time>[0-9]{14})\.(?P<state>locked|gathered|released))?$",
    )
    .unwrap()
});

/// Tokens extracted from a data file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens {
    pub capture_date: String,
    pub id: String,
    pub tracking_mode: TrackingMode,
    pub lock_time: Option<DateTime<Utc>>,
    pub state: Option<LockState>,
    pub unlocked_file_path: PathBuf,
}

pub fn is_valid_data_file_path(path: &Path) -> bool {
    tokenize(path).is_ok()
}

pub fn tokenize(path: &Path) -> Result<Tokens> {
    let unrecognized = || ClaimStoreError::UnrecognizedDataFilePath {
        path: path.to_path_buf(),
    };

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(unrecognized)?;
    let captures = DATA_FILE_NAME.captures(file_name).ok_or_else(unrecognized)?;

    let capture_date = captures["capture_date"].to_string();
    let id = captures["id"].to_string();
    let tracking_mode: TrackingMode = captures["tracking_mode"].parse()?;

    let lock_time = match captures.name("lock_time") {
        Some(token) => Some(
            NaiveDateTime::parse_from_str(token.as_str(), LOCK_TIMESTAMP_FORMAT)
                .map_err(|_| unrecognized())?
                .and_utc(),
        ),
        None => None,
    };
    let state = captures
        .name("state")
        .and_then(|token| LockState::from_token(token.as_str()));

    let unlocked_file_path =
        path.with_file_name(format!("{capture_date}{id}.{}", tracking_mode.token()));

    Ok(Tokens {
        capture_date,
        id,
        tracking_mode,
        lock_time,
        state,
        unlocked_file_path,
    })
}

/// Synthesizes the name the file at `path` takes when entering `state`,
/// stamped with the current UTC time.
pub fn new_name_for_state(path: &Path, state: LockState) -> Result<PathBuf> {
    new_name_for_state_at(path, state, Utc::now())
}

/// Same as [`new_name_for_state`] with an explicit clock reading.
///
/// The lock timestamp never goes backwards nor repeats for a given file: if
/// `now` is not past the current lock time, the current lock time plus one
/// second is used instead.
pub fn new_name_for_state_at(
    path: &Path,
    state: LockState,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let tokens = tokenize(path)?;
    let now = now.trunc_subsecs(0);
    let stamp = match tokens.lock_time {
        Some(previous) if previous >= now => previous + Duration::seconds(1),
        _ => now,
    };

    let unlocked_name = format!(
        "{}{}.{}",
        tokens.capture_date,
        tokens.id,
        tokens.tracking_mode.token()
    );
    Ok(tokens.unlocked_file_path.with_file_name(format!(
        "{unlocked_name}.{}.{}",
        stamp.format(LOCK_TIMESTAMP_FORMAT),
        state.token()
    )))
}
