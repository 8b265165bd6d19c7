//! Process-group termination.
//!
//! Supervised commands start as leaders of their own process group, so
//! signalling the group reaches the shell and everything it spawned.
//! Termination escalates:
//!
//! 1. `SIGTERM` to the group, wait up to 1.0s
//! 2. `SIGINT` to the group, wait up to 0.6s
//! 3. `SIGKILL` to the group, wait up to 0.5s
//! 4. up to three more `SIGKILL`s, 0.2s apart
//!
//! Windows has no process groups in this sense; `taskkill /F /T` kills the
//! tree and `Child::kill` is the fallback.

use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Signal to send when killing process groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM, allows graceful shutdown.
    Term,
    /// SIGINT, the Ctrl+C equivalent.
    Int,
    /// SIGKILL, immediate termination.
    Kill,
}

#[cfg(unix)]
impl KillSignal {
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Int => Signal::SIGINT,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Escalation steps: signal and how long to wait for exit afterwards.
pub const ESCALATION: [(KillSignal, Duration); 3] = [
    (KillSignal::Term, Duration::from_millis(1000)),
    (KillSignal::Int, Duration::from_millis(600)),
    (KillSignal::Kill, Duration::from_millis(500)),
];

/// Extra `SIGKILL` attempts after the escalation.
const FINAL_KILL_ATTEMPTS: usize = 3;
const FINAL_KILL_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A spawned child plus what is needed to stop it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: String,
    child: Mutex<Child>,
}

impl ProcessHandle {
    /// Take ownership of a spawned child.
    pub fn new(child: Child, command: impl Into<String>) -> Self {
        Self {
            pid: child.id(),
            command: command.into(),
            child: Mutex::new(child),
        }
    }

    /// Process id (also the process group id on Unix).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command as displayed to the user.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking exit check. Reaps the child once it has exited.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait()
    }

    /// Whether the child is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Wait up to `limit` for the child to exit.
    fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn kill_child(&self) {
        if let Err(e) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
        {
            debug!("kill({}) failed: {}", self.pid, e);
        }
    }

    /// Terminate the child and its process group.
    ///
    /// Returns `true` if the child is gone afterwards. An unkillable child
    /// is logged and `false` is returned; this never blocks indefinitely.
    pub fn terminate(&self) -> bool {
        if !self.is_alive() {
            sweep_group(self.pid);
            return true;
        }
        debug!("Terminating process group {} ({})", self.pid, self.command);

        if self.escalate() {
            sweep_group(self.pid);
            return true;
        }

        for _ in 0..FINAL_KILL_ATTEMPTS {
            let _ = signal_group(self.pid, KillSignal::Kill);
            self.kill_child();
            if self.wait_for_exit(FINAL_KILL_INTERVAL) {
                sweep_group(self.pid);
                return true;
            }
        }

        error!(
            "Process {} ({}) survived termination",
            self.pid, self.command
        );
        false
    }

    #[cfg(unix)]
    fn escalate(&self) -> bool {
        for (signal, grace) in ESCALATION {
            match signal_group(self.pid, signal) {
                Ok(true) => {}
                Ok(false) => {
                    // Group is gone; fall back to the single process.
                    self.kill_child();
                    return self.wait_for_exit(grace);
                }
                Err(e) => warn!("{}", e),
            }
            if self.wait_for_exit(grace) {
                return true;
            }
        }
        false
    }

    #[cfg(windows)]
    fn escalate(&self) -> bool {
        let pid = self.pid.to_string();
        match std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", pid.as_str()])
            .output()
        {
            Ok(out) if !out.status.success() => {
                debug!("taskkill exited with {}", out.status);
            }
            Ok(_) => {}
            Err(e) => debug!("taskkill failed: {}", e),
        }
        if self.wait_for_exit(Duration::from_millis(300)) {
            return true;
        }
        self.kill_child();
        self.wait_for_exit(Duration::from_millis(300))
    }
}

/// Send `signal` to the process group led by `pgid`.
///
/// Returns `Ok(false)` if the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: KillSignal) -> Result<bool, super::SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return Ok(false);
    };
    match killpg(Pid::from_raw(raw), signal.as_nix()) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(super::SupervisorError::Signal {
            pid: pgid,
            message: e.to_string(),
        }),
    }
}

/// Windows has no group signals; callers use `taskkill` instead.
#[cfg(windows)]
pub fn signal_group(_pgid: u32, _signal: KillSignal) -> Result<bool, super::SupervisorError> {
    Ok(false)
}

/// Kill stragglers left in the group after the leader exited.
fn sweep_group(pgid: u32) {
    #[cfg(unix)]
    if let Err(e) = signal_group(pgid, KillSignal::Kill) {
        debug!("Sweep of group {} failed: {}", pgid, e);
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn spawn(script: &str) -> ProcessHandle {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap();
        ProcessHandle::new(child, script)
    }

    #[test]
    fn test_terminate_running_process() {
        let handle = spawn("sleep 30");
        assert!(handle.is_alive());

        let started = Instant::now();
        assert!(handle.terminate());
        assert!(!handle.is_alive());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_terminate_escalates_past_ignored_term() {
        let handle = spawn("trap '' TERM INT; while true; do sleep 0.05; done");
        // Give the shell time to install its traps.
        std::thread::sleep(Duration::from_millis(200));

        assert!(handle.terminate());
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_terminate_exited_process() {
        let handle = spawn("true");
        assert!(handle.wait_for_exit(Duration::from_secs(5)));
        assert!(handle.terminate());
    }

    #[test]
    fn test_signal_missing_group() {
        // PID 0x7fff_fff0 is far above any default pid_max.
        assert!(!signal_group(0x7fff_fff0, KillSignal::Term).unwrap());
    }
}
