//! # Claim Store Core
//!
//! Claim-check store for large message bodies.
//!
//! Producers capture payloads to a local check-in directory as data files
//! whose names encode everything about them. A collector agent periodically
//! moves every collectible data file to the central check-out store, driving
//! each one through a rename-based state machine that tolerates crashes,
//! agents sharing a directory and abandoned locks.
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL claim token repository and its migrations
//!
//! ## Layout
//!
//! - [`data_file`]: file name grammar and the lifecycle state machine
//! - [`servant`]: every file system and database side effect
//! - [`message_body`]: transition sequences per tracking mode
//! - [`enumerable`]: discovery and sequential collection
//! - [`collector`]: the polling scheduler
//! - [`capture`]: the producer side writing data files

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Producer side: tracking streams and the claim store
pub mod capture;

/// Polling scheduler of collection passes
pub mod collector;

/// Data files, their name grammar and lifecycle
pub mod data_file;

/// Discovery of collectible message bodies
pub mod enumerable;

pub mod error;

pub mod message_body;

/// File system and claim token side effects
pub mod servant;

pub mod settings;

pub use capture::{ActivityTrackingMode, CaptureDescriptor, CaptureMode, ClaimStore, TrackingStream};
pub use collector::MessageBodyCollector;
pub use data_file::{DataFile, DataFileState, LockState, TrackingMode};
pub use enumerable::{CollectionReport, collect_message_bodies, enumerate_message_bodies};
pub use error::{ClaimStoreError, Result};
pub use message_body::MessageBody;
pub use servant::tokens::ClaimTokenRepository;
pub use servant::{DataFileServant, FileSystemServant, InMemoryClaimTokenRepository};
pub use settings::{AgentSettings, AgentSettingsSource, CaptureSettings};

#[cfg(feature = "database")]
pub use servant::PostgresClaimTokenRepository;

/// Migrations creating the claim token registry.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
