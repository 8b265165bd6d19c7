//! Audit records emitted for every isolation and supervision decision.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One audit record. Serialized as a flat JSON object whose `event` field
/// names the variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Command wrapped by an isolator.
    CommandSandboxed {
        /// Original command.
        command: String,
        /// Isolator name.
        isolator: String,
    },

    /// Command ran natively because its leading token is excluded.
    CommandExcluded {
        /// Original command.
        command: String,
        /// The matching exclusion entry.
        matched: String,
    },

    /// Wrapping failed and the command ran unwrapped.
    SandboxFallback {
        /// Original command.
        command: String,
        /// Why wrapping failed.
        reason: String,
    },

    /// A proxied destination was let through.
    NetworkAllow {
        /// Lowercased host.
        domain: String,
        /// Allowlist hit or runtime approval.
        reason: AllowReason,
    },

    /// A proxied destination was refused with 403.
    NetworkBlock {
        /// Lowercased host.
        domain: String,
        /// Which check refused it.
        reason: BlockReason,
    },

    /// The approval gate was consulted.
    NetworkPrompt {
        /// Lowercased host.
        domain: String,
        /// Outcome, timeouts count as block.
        decision: Decision,
    },

    /// An unsandboxed re-run was requested after a failure.
    UnsandboxedRetry {
        /// Original command.
        command: String,
        /// Exit code of the sandboxed attempt.
        exit_code: i32,
        /// Whether the re-run went ahead.
        decision: Decision,
    },

    /// Supervised process exceeded a timeout.
    ProcessTimeout {
        /// Group leader pid.
        pid: u32,
        /// Command as submitted.
        command: String,
        /// Seconds since spawn.
        elapsed_sec: u64,
    },

    /// Supervised process was killed on user request.
    ProcessKilled {
        /// Group leader pid.
        pid: u32,
        /// Command as submitted.
        command: String,
    },
}

/// Why a destination was allowed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// Exact or subdomain match.
    Allowlist,
    /// Approved by the gate; now on the allowlist.
    Approved,
}

/// Why a destination was refused.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Not listed and approval is disabled or unwired.
    NotAllowlisted,
    /// Approval was denied.
    UserDenied,
}

/// Yes/no outcome of a prompt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Go ahead.
    Allow,
    /// Refuse.
    Block,
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed { Decision::Allow } else { Decision::Block }
    }
}

/// An event paired with the moment it was logged.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// RFC 3339, UTC.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Flattened next to `ts`.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Stamp with the current time.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_json(event: &AuditEvent) -> String {
        serde_json::to_string(&event.with_timestamp()).unwrap()
    }

    #[test]
    fn test_command_sandboxed_serialization() {
        let json = to_json(&AuditEvent::CommandSandboxed {
            command: "make test".to_string(),
            isolator: "bubblewrap".to_string(),
        });
        assert!(json.contains("\"event\":\"command_sandboxed\""));
        assert!(json.contains("\"isolator\":\"bubblewrap\""));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_network_allow_serialization() {
        let json = to_json(&AuditEvent::NetworkAllow {
            domain: "pypi.org".to_string(),
            reason: AllowReason::Allowlist,
        });
        assert!(json.contains("\"event\":\"network_allow\""));
        assert!(json.contains("\"domain\":\"pypi.org\""));
        assert!(json.contains("\"reason\":\"allowlist\""));
    }

    #[test]
    fn test_network_block_serialization() {
        let json = to_json(&AuditEvent::NetworkBlock {
            domain: "evil.io".to_string(),
            reason: BlockReason::NotAllowlisted,
        });
        assert!(json.contains("\"event\":\"network_block\""));
        assert!(json.contains("\"reason\":\"not_allowlisted\""));
    }

    #[test]
    fn test_unsandboxed_retry_serialization() {
        let json = to_json(&AuditEvent::UnsandboxedRetry {
            command: "npm ci".to_string(),
            exit_code: 126,
            decision: Decision::from(false),
        });
        assert!(json.contains("\"event\":\"unsandboxed_retry\""));
        assert!(json.contains("\"exit_code\":126"));
        assert!(json.contains("\"decision\":\"block\""));
    }

    #[test]
    fn test_process_timeout_serialization() {
        let json = to_json(&AuditEvent::ProcessTimeout {
            pid: 4242,
            command: "sleep 999".to_string(),
            elapsed_sec: 270,
        });
        assert!(json.contains("\"event\":\"process_timeout\""));
        assert!(json.contains("\"elapsed_sec\":270"));
    }
}
