//! Audit telemetry for shellguard.
//!
//! Security decisions (wraps, exclusions, fallbacks, proxy verdicts, retries,
//! forced terminations) are serialized as JSON and sent to syslog with the
//! `SHELLGUARD` tag. Diagnostic logging is separate and goes through
//! `tracing` to stderr.
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"network_block","domain":"evil.io","reason":"not_allowlisted"}
//! ```

mod error;
mod events;
mod audit;

pub use error::TelemetryError;
pub use events::{AllowReason, AuditEvent, BlockReason, Decision};
pub use audit::{AuditLogger, SYSLOG_TAG};
