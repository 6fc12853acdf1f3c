//! Configuration of the claim store agent.
//!
//! Settings come from a TOML (or JSON) file located through
//! `CLAIMSTORE_CONFIG_PATH` or a default candidate, with durations written in
//! humantime syntax. The database URL may be overridden by `DATABASE_URL`.

#![allow(missing_docs)]

pub mod error;
pub mod loader;
pub mod models;
pub mod source;

pub use error::ConfigLoadError;
pub use loader::{Config, ConfigLoader, ConfigPathProvenance};
pub use models::{EnvConfig, FileConfig};
pub use source::FileSettingsSource;

/// Loads `.env` from the working directory, if present.
pub fn load_dotenv() -> Result<Option<std::path::PathBuf>, ConfigLoadError> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}
