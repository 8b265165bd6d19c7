//! Unsandboxed retry policy.
//!
//! Some failures inside a sandbox are caused by the sandbox itself: a tool
//! that cannot see its config, a binary that is not bind-mounted, a write
//! that lands on a read-only mount. When a sandboxed run exits with one of a
//! handful of such codes, the caller may offer to re-run it natively.
//!
//! The heuristic is approximate. These codes also come from ordinary bugs,
//! so a match only means "worth asking". Nothing is retried without an
//! explicit yes from the approval callback.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PolicyStore;
use crate::telemetry::{AuditEvent, AuditLogger, Decision};

/// Exit codes that may indicate a sandbox-induced failure.
///
/// General error, permission denied, command not found, and SIGSEGV as
/// reported by the shell.
pub const SANDBOX_SUSPECT_EXIT_CODES: [i32; 4] = [1, 126, 127, 139];

/// Approval callback for an unsandboxed re-run. Receives the command.
pub type RetryApproval<'a> = &'a dyn Fn(&str) -> anyhow::Result<bool>;

/// Decides whether a failed sandboxed command may be re-run natively.
pub struct RetryPolicy {
    store: Arc<PolicyStore>,
    audit: Arc<AuditLogger>,
}

impl RetryPolicy {
    /// Create a retry policy backed by `store`.
    pub fn new(store: Arc<PolicyStore>, audit: Arc<AuditLogger>) -> Self {
        Self { store, audit }
    }

    /// Whether a failure with `exit_code` should offer an unsandboxed retry.
    pub fn should_retry_unsandboxed(&self, command: &str, exit_code: i32) -> bool {
        if !self.store.allow_unsandboxed_commands() {
            return false;
        }
        let suspect = SANDBOX_SUSPECT_EXIT_CODES.contains(&exit_code);
        if suspect {
            info!(
                "Exit code {} from '{}' may be caused by the sandbox",
                exit_code, command
            );
        }
        suspect
    }

    /// Ask `approve` whether to re-run `command` without isolation.
    ///
    /// No callback, or a callback that returns an error, means no.
    pub fn request_unsandboxed_retry(
        &self,
        command: &str,
        exit_code: i32,
        approve: Option<RetryApproval<'_>>,
    ) -> bool {
        let approved = match approve {
            None => false,
            Some(approve) => match approve(command) {
                Ok(approved) => approved,
                Err(e) => {
                    warn!("Retry approval failed for '{}': {:#}", command, e);
                    false
                }
            },
        };

        self.audit.log(AuditEvent::UnsandboxedRetry {
            command: command.to_string(),
            exit_code,
            decision: Decision::from(approved),
        });
        approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn policy(dir: &std::path::Path) -> RetryPolicy {
        let store = Arc::new(PolicyStore::with_path(dir.join("sandbox_config.json")));
        RetryPolicy::new(store, Arc::new(AuditLogger::new_null()))
    }

    #[test]
    fn test_suspect_codes_retry() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        for code in SANDBOX_SUSPECT_EXIT_CODES {
            assert!(retry.should_retry_unsandboxed("npm ci", code), "code {}", code);
        }
    }

    #[test]
    fn test_other_codes_do_not_retry() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        for code in [0, 2, 130, 137, -9] {
            assert!(!retry.should_retry_unsandboxed("npm ci", code), "code {}", code);
        }
    }

    #[test]
    fn test_disabled_by_policy() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        retry.store.set_allow_unsandboxed_commands(false).unwrap();
        assert!(!retry.should_retry_unsandboxed("npm ci", 126));
    }

    #[test]
    fn test_no_callback_denies() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        assert!(!retry.request_unsandboxed_retry("npm ci", 126, None));
    }

    #[test]
    fn test_callback_decides() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        let seen = Cell::new(None);

        let yes = |cmd: &str| -> anyhow::Result<bool> {
            seen.set(Some(cmd.to_string()));
            Ok(true)
        };
        assert!(retry.request_unsandboxed_retry("npm ci", 126, Some(&yes)));
        assert_eq!(seen.take().as_deref(), Some("npm ci"));

        let no = |_: &str| -> anyhow::Result<bool> { Ok(false) };
        assert!(!retry.request_unsandboxed_retry("npm ci", 126, Some(&no)));
    }

    #[test]
    fn test_callback_error_denies() {
        let temp = tempdir().unwrap();
        let retry = policy(temp.path());
        let failing = |_: &str| -> anyhow::Result<bool> { anyhow::bail!("prompt closed") };
        assert!(!retry.request_unsandboxed_retry("npm ci", 1, Some(&failing)));
    }
}
