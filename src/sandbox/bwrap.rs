//! Linux isolation with Bubblewrap.
//!
//! Bubblewrap is a well-audited, minimal sandbox tool that uses Linux
//! namespaces without requiring root. Every namespace is unshared except the
//! network one; outbound traffic is steered through the allowlist proxy via
//! the `HTTP_PROXY` family of variables instead.
//!
//! # Read scopes
//!
//! - **broad**: `/` is bound read-only and only the working directory,
//!   `/tmp` and the allowed write paths are bound read-write. Each denied
//!   path is then covered by an empty tmpfs, on top of those binds.
//! - **restricted**: only `/usr`, `/lib`, `/lib64`, `/bin` and `/sbin` are
//!   visible, plus synthetic `/proc` and `/dev`, a fresh `/tmp`, the working
//!   directory and the configured read/write paths.
//!
//! The environment is cleared and only [`SAFE_ENV_VARS`] are re-exported.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::builder::{BwrapBuilder, join_quoted};
use super::error::SandboxError;
use super::isolator::{FilesystemIsolator, IsolatedCommand, Platform};
use super::options::{PROXY_ENV_VARS, SAFE_ENV_VARS, SandboxOptions, absolute};
use crate::config::ReadScope;

/// System directories visible in restricted scope.
pub const RESTRICTED_SYSTEM_PATHS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/sbin"];

/// Bubblewrap-based isolator.
#[derive(Debug, Clone)]
pub struct BubblewrapIsolator {
    binary: Option<PathBuf>,
    resource_launcher: Option<PathBuf>,
}

impl BubblewrapIsolator {
    /// Probe `PATH` for `bwrap` and `systemd-run`.
    pub fn new() -> Self {
        Self {
            binary: which::which("bwrap").ok(),
            resource_launcher: which::which("systemd-run").ok(),
        }
    }

    /// Isolator with an explicit `bwrap` location (or none).
    pub fn with_binary(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            resource_launcher: None,
        }
    }

    #[cfg(test)]
    fn with_resource_launcher(mut self, launcher: Option<PathBuf>) -> Self {
        self.resource_launcher = launcher;
        self
    }

    /// Location of `bwrap`, if installed.
    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    fn mount_broad(builder: BwrapBuilder, options: &SandboxOptions, cwd: &Path) -> BwrapBuilder {
        let mut builder = builder
            .bind_ro(Path::new("/"), Path::new("/"))
            .bind_rw(cwd, cwd)
            .bind_rw(Path::new("/tmp"), Path::new("/tmp"));

        for path in &options.allowed_write_paths {
            if let Ok(path) = absolute(path) {
                builder = builder.bind_rw_try(&path, &path);
            }
        }

        // Masks go last so a writable bind of a parent (cwd = $HOME) cannot
        // expose them again.
        for denied in &options.denied_read_paths {
            if denied.is_dir() {
                builder = builder.tmpfs(denied);
            } else if denied.exists() {
                // tmpfs can only cover directories
                builder = builder.bind_ro(Path::new("/dev/null"), denied);
            }
        }
        builder
    }

    fn mount_restricted(
        builder: BwrapBuilder,
        options: &SandboxOptions,
        cwd: &Path,
    ) -> BwrapBuilder {
        let mut builder = builder;
        for system in RESTRICTED_SYSTEM_PATHS {
            let system = Path::new(system);
            if system.exists() {
                builder = builder.bind_ro(system, system);
            }
        }

        builder = builder
            .proc_mount(Path::new("/proc"))
            .dev_minimal()
            .tmpfs(Path::new("/tmp"))
            .bind_rw(cwd, cwd);

        for path in &options.allowed_read_paths {
            if let Ok(path) = absolute(path) {
                builder = builder.bind_ro_try(&path, &path);
            }
        }
        for path in &options.allowed_write_paths {
            if let Ok(path) = absolute(path) {
                builder = builder.bind_rw_try(&path, &path);
            }
        }
        builder
    }

    /// Wrap `command` with `systemd-run` resource directives.
    fn limit_resources(&self, command: &str, options: &SandboxOptions) -> String {
        if options.max_memory_mb.is_none() && options.max_cpu_percent.is_none() {
            return command.to_string();
        }
        if self.resource_launcher.is_none() {
            warn!("Resource limits requested but systemd-run is not available; running unlimited");
            return command.to_string();
        }

        let mut args = vec![
            "systemd-run".to_string(),
            "--user".to_string(),
            "--scope".to_string(),
            "--quiet".to_string(),
        ];
        if let Some(mb) = options.max_memory_mb {
            args.push(format!("--property=MemoryMax={}M", mb));
        }
        if let Some(cpu) = options.max_cpu_percent {
            args.push(format!("--property=CPUQuota={}%", cpu));
        }
        args.extend(["--", "/bin/sh", "-c", command].map(String::from));
        join_quoted(&args)
    }
}

impl Default for BubblewrapIsolator {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemIsolator for BubblewrapIsolator {
    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn wrap_command(
        &self,
        command: &str,
        options: &SandboxOptions,
    ) -> Result<IsolatedCommand, SandboxError> {
        let cwd = options.absolute_cwd()?;

        let mut builder = BwrapBuilder::new()
            .unshare_all()
            .share_net()
            .die_with_parent()
            .new_session();

        builder = match options.read_scope {
            ReadScope::Broad => Self::mount_broad(builder, options, &cwd),
            ReadScope::Restricted => Self::mount_restricted(builder, options, &cwd),
        };

        builder = builder.chdir(&cwd).clear_env();
        for var in SAFE_ENV_VARS {
            if let Some(value) = options.lookup_env(var) {
                builder = builder.setenv(var, &value);
            }
        }
        if let Some(proxy) = options.effective_proxy() {
            for var in PROXY_ENV_VARS {
                builder = builder.setenv(var, proxy);
            }
        }

        let inner = self.limit_resources(command, options);
        builder = builder.command("/bin/sh", &["-c".to_string(), inner]);

        let wrapped = builder.to_command_line();
        debug!("Bwrap command: {}", wrapped);

        Ok(IsolatedCommand {
            command: wrapped,
            env: options.env.clone(),
        })
    }
}
