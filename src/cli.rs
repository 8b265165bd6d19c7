//! Command-line interface definitions for shellguard.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::ReadScope;

/// Opt-in isolation and supervision for agent-driven shell commands.
///
/// shellguard keeps a per-user sandbox policy, wraps shell commands in a
/// filesystem isolator, filters their network access through a local
/// domain-allowlist proxy, and supervises them with timeouts.
#[derive(Parser, Debug)]
#[command(name = "shellguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Use this policy file instead of the per-user default.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for shellguard.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Turn sandboxing on.
    Enable,

    /// Turn sandboxing off.
    Disable,

    /// Show the current policy and isolator state.
    Status {
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check isolator availability and show how a sample command is wrapped.
    Test,

    /// Allow network access to a domain (`*.example.com` for subdomains).
    AllowDomain {
        /// Domain or wildcard pattern.
        domain: String,
    },

    /// Remove a domain from the allowlist.
    RemoveDomain {
        /// Domain or wildcard pattern.
        domain: String,
    },

    /// Allow sandboxed commands to write to a path.
    AllowPath {
        /// Directory to make writable.
        path: String,
    },

    /// Stop allowing writes to a path.
    RemovePath {
        /// Path previously given to `allow-path`.
        path: String,
    },

    /// Allow sandboxed commands to read a path in restricted scope.
    AllowReadPath {
        /// Directory to make readable.
        path: String,
    },

    /// Stop allowing reads of a path in restricted scope.
    RemoveReadPath {
        /// Path previously given to `allow-read-path`.
        path: String,
    },

    /// Hide a path from sandboxed commands in broad scope.
    DenyReadPath {
        /// Path to hide.
        path: String,
    },

    /// Always run a command natively.
    Exclude {
        /// Command name, e.g. `docker`.
        command: String,
    },

    /// Stop excluding a command.
    Include {
        /// Command name.
        command: String,
    },

    /// Set how much of the filesystem sandboxed commands may read.
    ReadScope {
        /// `broad` or `restricted`.
        scope: ReadScope,
    },

    /// Change a single policy value.
    ///
    /// Switches take on/off, ports a number, and limits a number or `none`.
    Set {
        /// Policy value to change.
        setting: Setting,
        /// New value.
        value: String,
    },

    /// Run a command under the sandbox and print the result as JSON.
    Run {
        /// Kill the command after this many seconds without output.
        #[arg(long, value_name = "SECONDS", default_value_t = 60)]
        timeout: u64,

        /// Working directory for the command.
        #[arg(long, value_name = "PATH")]
        cwd: Option<PathBuf>,

        /// Skip the confirmation prompt.
        #[arg(short = 'y', long = "yes")]
        yes: bool,

        /// The command and its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run the filtering proxy in the foreground until Ctrl-C.
    Proxy {
        /// Listen on this port instead of the configured one.
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Scalar policy values settable from the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Setting {
    /// `filesystem_isolation`
    FilesystemIsolation,
    /// `network_isolation`
    NetworkIsolation,
    /// `require_approval_for_new_domains`
    RequireApproval,
    /// `http_proxy_port`
    HttpProxyPort,
    /// `socks_proxy_port`
    SocksProxyPort,
    /// `allow_unsandboxed_commands`
    AllowUnsandboxed,
    /// `max_memory_mb`
    MaxMemoryMb,
    /// `max_cpu_percent`
    MaxCpuPercent,
    /// `max_execution_time`, in seconds
    MaxExecutionTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_status() {
        let cli = Cli::parse_from(["shellguard", "status", "--json"]);
        assert!(matches!(cli.command, Commands::Status { json: true }));
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::parse_from(["shellguard", "enable", "-vv", "--config", "/tmp/p.json"]);
        assert!(matches!(cli.command, Commands::Enable));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.json")));
    }

    #[test]
    fn test_read_scope_value() {
        let cli = Cli::parse_from(["shellguard", "read-scope", "restricted"]);
        match cli.command {
            Commands::ReadScope { scope } => assert_eq!(scope, ReadScope::Restricted),
            other => panic!("Expected ReadScope, got {:?}", other),
        }
        assert!(Cli::try_parse_from(["shellguard", "read-scope", "everything"]).is_err());
    }

    #[test]
    fn test_run_collects_command() {
        let cli = Cli::parse_from([
            "shellguard",
            "run",
            "--timeout",
            "5",
            "--yes",
            "--",
            "ls",
            "-la",
            "/tmp",
        ]);
        match cli.command {
            Commands::Run {
                timeout,
                cwd,
                yes,
                command,
            } => {
                assert_eq!(timeout, 5);
                assert!(cwd.is_none());
                assert!(yes);
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            other => panic!("Expected Run, got {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["shellguard", "run"]).is_err());
    }

    #[test]
    fn test_set_parses_setting_name() {
        let cli = Cli::parse_from(["shellguard", "set", "max-execution-time", "120"]);
        match cli.command {
            Commands::Set { setting, value } => {
                assert_eq!(setting, Setting::MaxExecutionTime);
                assert_eq!(value, "120");
            }
            other => panic!("Expected Set, got {:?}", other),
        }
        assert!(Cli::try_parse_from(["shellguard", "set", "enabled", "on"]).is_err());
    }

    #[test]
    fn test_proxy_port_override() {
        let cli = Cli::parse_from(["shellguard", "proxy", "--port", "0"]);
        assert!(matches!(cli.command, Commands::Proxy { port: Some(0) }));
    }
}
