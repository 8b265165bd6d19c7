//! Tracked set of running supervised processes.
//!
//! Every command the supervisor launches is registered here for the
//! duration of its run, so a user interrupt can reach all of them at once.
//! Entries are removed by a guard, so they disappear on every exit path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use super::terminate::ProcessHandle;
use crate::telemetry::{AuditEvent, AuditLogger};

/// The set of supervised processes currently running.
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u32, Arc<ProcessHandle>>>,
    /// PIDs terminated on user request, consumed when their result is built.
    user_killed: Mutex<HashSet<u32>>,
    audit: Arc<AuditLogger>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            user_killed: Mutex::new(HashSet::new()),
            audit,
        }
    }

    /// Track `handle` until the returned guard is dropped.
    pub fn register(&self, handle: Arc<ProcessHandle>) -> Registration<'_> {
        let pid = handle.pid();
        self.lock_processes().insert(pid, handle);
        Registration {
            registry: self,
            pid,
        }
    }

    /// Number of tracked processes still running. Exited entries are pruned.
    pub fn running_count(&self) -> usize {
        let mut processes = self.lock_processes();
        processes.retain(|_, handle| handle.is_alive());
        processes.len()
    }

    /// Terminate every tracked process and mark it as user-killed.
    ///
    /// Returns the number of processes that were still running. The lock is
    /// only held to snapshot the set; termination happens outside it.
    pub fn kill_all(&self) -> usize {
        let snapshot: Vec<Arc<ProcessHandle>> = self.lock_processes().values().cloned().collect();

        let mut killed = 0;
        for handle in snapshot {
            if handle.is_alive() {
                self.user_killed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(handle.pid());
                handle.terminate();
                killed += 1;
                self.audit.log(AuditEvent::ProcessKilled {
                    pid: handle.pid(),
                    command: handle.command().to_string(),
                });
            }
            self.unregister(handle.pid());
        }

        if killed > 0 {
            info!("Interrupted {} running command(s)", killed);
        }
        killed
    }

    /// Consume the user-killed mark for `pid`.
    pub fn take_user_killed(&self, pid: u32) -> bool {
        self.user_killed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid)
    }

    fn unregister(&self, pid: u32) {
        self.lock_processes().remove(&pid);
    }

    fn lock_processes(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<ProcessHandle>>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a process from the registry when dropped.
#[must_use = "the process is unregistered when this guard is dropped"]
pub struct Registration<'a> {
    registry: &'a ProcessRegistry,
    pid: u32,
}

impl Registration<'_> {
    /// The registered PID.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.pid);
    }
}
