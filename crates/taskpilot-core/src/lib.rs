//! # TaskPilot Core
//!
//! Shared foundation for all TaskPilot crates: configuration loading and the
//! common error type. Everything else (cache, CRM client, automation logic,
//! gateway) builds on top of this crate.

pub mod config;
pub mod error;

pub use config::TaskPilotConfig;
pub use error::{Result, TaskPilotError};
