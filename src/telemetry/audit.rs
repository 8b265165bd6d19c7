//! Audit sink: one JSON line per event, sent to the local syslog daemon.

use std::sync::{Mutex, PoisonError};

use syslog::{Facility, Formatter3164, LoggerBackend};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Process name stamped on every syslog record.
pub const SYSLOG_TAG: &str = "SHELLGUARD";

type SyslogWriter = syslog::Logger<LoggerBackend, Formatter3164>;

enum Sink {
    Syslog(Mutex<SyslogWriter>),
    Discard,
}

/// Records isolation and supervision decisions.
///
/// One instance is shared by the orchestrator, the proxy and the supervisor.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Connect to syslog over its unix socket, facility `user`.
    pub fn new() -> Result<Self, TelemetryError> {
        let writer = syslog::unix(Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        })
        .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!(tag = SYSLOG_TAG, "audit events go to syslog");
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// A logger that only mirrors events to `tracing`.
    pub fn new_null() -> Self {
        Self { sink: Sink::Discard }
    }

    /// Record `event`. Failures are reported through `tracing` and never
    /// propagate to the caller.
    ///
    /// Every event is mirrored at debug level, so `-vv` shows the trail
    /// even without syslog.
    pub fn log(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event.with_timestamp()) {
            Ok(line) => line,
            Err(e) => {
                error!("{}", TelemetryError::SerializationError(e));
                return;
            }
        };
        debug!(target: "shellguard::audit", "{}", line);

        if let Sink::Syslog(writer) = &self.sink {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = writer.info(&line) {
                error!("Audit event dropped, syslog write failed: {}", e);
            }
        }
    }
}
