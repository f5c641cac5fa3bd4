//! Service Account Credential Rotator
//!
//! Watches a credentials record on disk, collapses bursts of change
//! notifications into single change signals, and applies each new record to a
//! target with a bounded, fixed-delay retry policy.

pub mod config;
pub mod error;
pub mod monitor;
pub mod record;
pub mod targets;

pub use config::Config;
pub use error::{RecordError, WatchError};
pub use monitor::{Monitor, UpdateCoordinator};
pub use record::{mask_username, CredentialRecord};
