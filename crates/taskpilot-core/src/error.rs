//! TaskPilot error type.

use chrono::{DateTime, Utc};

/// Convenience result alias used throughout TaskPilot.
pub type Result<T> = std::result::Result<T, TaskPilotError>;

/// Errors shared across TaskPilot crates.
#[derive(Debug, thiserror::Error)]
pub enum TaskPilotError {
    /// Configuration is missing, malformed, or internally inconsistent
    /// (bad timezone, sequence position out of range, unparsable config file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relational cache (SQLite) failure.
    #[error("Database error: {0}")]
    Db(String),

    /// External CRM API failure (HTTP transport or API-level error).
    #[error("CRM API error: {0}")]
    Crm(String),

    /// A sequence trigger resolved to an instant before "now". This is an
    /// expected business outcome, not a bug: the follow-up window has passed
    /// and no run is created.
    #[error("Scheduled time {planned} is in the past")]
    PastDue { planned: DateTime<Utc> },

    /// I/O error (config file read/write).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskPilotError {
    /// Whether this error is the distinct past-due rejection.
    pub fn is_past_due(&self) -> bool {
        matches!(self, TaskPilotError::PastDue { .. })
    }
}
