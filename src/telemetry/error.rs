//! Telemetry error types.

use thiserror::Error;

/// Errors raised while recording audit events.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The local syslog daemon could not be reached.
    #[error("Cannot reach syslog: {0}")]
    SyslogConnection(String),

    /// An event could not be encoded as JSON.
    #[error("Cannot encode audit event: {0}")]
    SerializationError(#[from] serde_json::Error),
}
