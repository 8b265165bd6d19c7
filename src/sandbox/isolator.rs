//! Isolator capability and platform selection.
//!
//! Each platform variant implements [`FilesystemIsolator`]. [`Isolator`] is
//! the tagged union the orchestrator holds, and [`Isolator::select`] picks the
//! first candidate that matches the host and is installed, falling back to
//! the no-op variant.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use super::bwrap::BubblewrapIsolator;
use super::error::SandboxError;
use super::options::SandboxOptions;
use super::seatbelt::SandboxExecIsolator;

/// Platforms an isolator can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux namespaces via bubblewrap.
    Linux,
    /// macOS profiles via sandbox-exec.
    Macos,
    /// No isolation.
    Noop,
}

impl Platform {
    /// The platform this binary runs on.
    pub fn host() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::Macos
        } else {
            Platform::Noop
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Macos => write!(f, "macos"),
            Platform::Noop => write!(f, "noop"),
        }
    }
}

/// A command rewritten to run under isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedCommand {
    /// Shell command line to execute.
    pub command: String,
    /// Environment for the outer process.
    pub env: HashMap<String, String>,
}

/// Capability shared by all isolation strategies.
pub trait FilesystemIsolator {
    /// Whether the underlying tool is installed.
    fn is_available(&self) -> bool;

    /// Platform this isolator targets.
    fn platform(&self) -> Platform;

    /// Rewrite `command` so it runs under isolation.
    fn wrap_command(
        &self,
        command: &str,
        options: &SandboxOptions,
    ) -> Result<IsolatedCommand, SandboxError>;
}

/// Isolator that leaves commands untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIsolator;

impl FilesystemIsolator for NoopIsolator {
    fn is_available(&self) -> bool {
        true
    }

    fn platform(&self) -> Platform {
        Platform::Noop
    }

    fn wrap_command(
        &self,
        command: &str,
        options: &SandboxOptions,
    ) -> Result<IsolatedCommand, SandboxError> {
        Ok(IsolatedCommand {
            command: command.to_string(),
            env: options.env.clone(),
        })
    }
}

/// The isolator variants.
#[derive(Debug, Clone)]
pub enum Isolator {
    /// Linux bubblewrap.
    Bubblewrap(BubblewrapIsolator),
    /// macOS sandbox-exec.
    SandboxExec(SandboxExecIsolator),
    /// Pass-through.
    Noop(NoopIsolator),
}

impl Isolator {
    /// Probe the host and pick the best isolator.
    pub fn detect() -> Self {
        Self::select(
            Platform::host(),
            vec![
                Isolator::Bubblewrap(BubblewrapIsolator::new()),
                Isolator::SandboxExec(SandboxExecIsolator::new()),
            ],
        )
    }

    /// First candidate whose platform is `host` and which is available.
    pub fn select(host: Platform, candidates: Vec<Isolator>) -> Self {
        candidates
            .into_iter()
            .find(|c| c.platform() == host && c.is_available())
            .unwrap_or(Isolator::Noop(NoopIsolator))
    }

    /// Short name for status output.
    pub fn name(&self) -> &'static str {
        match self {
            Isolator::Bubblewrap(_) => "bubblewrap",
            Isolator::SandboxExec(_) => "sandbox-exec",
            Isolator::Noop(_) => "noop",
        }
    }

    fn inner(&self) -> &dyn FilesystemIsolator {
        match self {
            Isolator::Bubblewrap(i) => i,
            Isolator::SandboxExec(i) => i,
            Isolator::Noop(i) => i,
        }
    }
}

impl FilesystemIsolator for Isolator {
    fn is_available(&self) -> bool {
        self.inner().is_available()
    }

    fn platform(&self) -> Platform {
        self.inner().platform()
    }

    fn wrap_command(
        &self,
        command: &str,
        options: &SandboxOptions,
    ) -> Result<IsolatedCommand, SandboxError> {
        self.inner().wrap_command(command, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bwrap(available: bool) -> Isolator {
        Isolator::Bubblewrap(BubblewrapIsolator::with_binary(
            available.then(|| PathBuf::from("/usr/bin/bwrap")),
        ))
    }

    fn seatbelt(available: bool) -> Isolator {
        Isolator::SandboxExec(SandboxExecIsolator::with_binary(
            available.then(|| PathBuf::from("/usr/bin/sandbox-exec")),
        ))
    }

    #[test]
    fn test_select_matches_host() {
        let chosen = Isolator::select(Platform::Linux, vec![bwrap(true), seatbelt(true)]);
        assert_eq!(chosen.name(), "bubblewrap");

        let chosen = Isolator::select(Platform::Macos, vec![bwrap(true), seatbelt(true)]);
        assert_eq!(chosen.name(), "sandbox-exec");
    }

    #[test]
    fn test_select_skips_unavailable() {
        let chosen = Isolator::select(Platform::Linux, vec![bwrap(false), seatbelt(true)]);
        assert_eq!(chosen.name(), "noop");
        assert_eq!(chosen.platform(), Platform::Noop);
    }

    #[test]
    fn test_select_unknown_host() {
        let chosen = Isolator::select(Platform::Noop, vec![bwrap(true), seatbelt(true)]);
        assert_eq!(chosen.name(), "noop");
    }

    #[test]
    fn test_noop_returns_input() {
        let options = SandboxOptions::new("/work").env_var("A", "1");
        let wrapped = NoopIsolator.wrap_command("echo hi", &options).unwrap();
        assert_eq!(wrapped.command, "echo hi");
        assert_eq!(wrapped.env.get("A"), Some(&"1".to_string()));
        assert!(NoopIsolator.is_available());
    }

    #[test]
    fn test_platform_display() {
        assert_eq!(Platform::Linux.to_string(), "linux");
        assert_eq!(Platform::Macos.to_string(), "macos");
        assert_eq!(Platform::Noop.to_string(), "noop");
    }

    #[test]
    fn test_detect_does_not_panic() {
        let isolator = Isolator::detect();
        assert!(isolator.platform() == Platform::host() || isolator.platform() == Platform::Noop);
    }
}
