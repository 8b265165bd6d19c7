//! macOS isolation with `sandbox-exec` profiles.
//!
//! Instead of bind mounts, macOS enforces a declarative profile. We render
//! one per wrap call into `<tmp>/shellguard_sandbox/profile_<pid>.sb` and point
//! `sandbox-exec -f` at it. The profile starts from `(deny default)`.
//!
//! CPU quotas have no `sandbox-exec` equivalent and are not applied; a memory
//! cap becomes a `ulimit -v` prefix on the inner command.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::builder::join_quoted;
use super::error::SandboxError;
use super::isolator::{FilesystemIsolator, IsolatedCommand, Platform};
use super::options::{PROXY_ENV_VARS, SandboxOptions, absolute};
use crate::config::ReadScope;

/// Directory name (under the system temp dir) holding generated profiles.
pub const PROFILE_DIR_NAME: &str = "shellguard_sandbox";

/// System paths readable in restricted scope.
pub const SYSTEM_READ_PATHS: &[&str] = &[
    "/usr/lib",
    "/usr/bin",
    "/usr/share",
    "/bin",
    "/sbin",
    "/System/Library",
    "/Library",
    "/private/var/db/timezone",
    "/dev",
];

/// Temp locations writable in both scopes.
pub const TEMP_WRITE_PATHS: &[&str] = &["/tmp", "/private/tmp", "/var/tmp", "/private/var/folders"];

/// Credential directories under `$HOME` that are always denied.
pub const HOME_CREDENTIAL_DIRS: &[&str] = &[".ssh", ".aws", ".config", ".gnupg"];

/// `sandbox-exec` based isolator.
#[derive(Debug, Clone)]
pub struct SandboxExecIsolator {
    binary: Option<PathBuf>,
    profile_dir: PathBuf,
}

impl SandboxExecIsolator {
    /// Probe `PATH` for `sandbox-exec`.
    pub fn new() -> Self {
        Self::with_binary(which::which("sandbox-exec").ok())
    }

    /// Isolator with an explicit `sandbox-exec` location (or none).
    pub fn with_binary(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            profile_dir: std::env::temp_dir().join(PROFILE_DIR_NAME),
        }
    }

    #[cfg(test)]
    fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }

    /// Where this process writes its profile.
    pub fn profile_path(&self) -> PathBuf {
        self.profile_dir
            .join(format!("profile_{}.sb", std::process::id()))
    }

    /// Render the profile for `options`.
    pub fn generate_profile(&self, options: &SandboxOptions) -> Result<String, SandboxError> {
        let cwd = options.absolute_cwd()?;
        let mut profile = String::from(
            "(version 1)\n\
             \n\
             (deny default)\n\
             \n\
             (allow process-exec*)\n\
             (allow process-fork)\n\
             (allow signal)\n\
             (allow sysctl-read)\n\
             (allow mach-lookup)\n\
             (allow ipc-posix-shm)\n\
             \n\
             ;; Outbound traffic is steered through the proxy\n\
             (allow network*)\n\n",
        );

        match options.read_scope {
            ReadScope::Broad => {
                profile.push_str("(allow file-read*)\n\n");
            }
            ReadScope::Restricted => {
                let mut readable: Vec<PathBuf> =
                    SYSTEM_READ_PATHS.iter().map(PathBuf::from).collect();
                readable.push(cwd.clone());
                for path in &options.allowed_read_paths {
                    readable.push(absolute(path)?);
                }
                push_rule(&mut profile, "allow file-read*", &readable);
            }
        }

        let mut writable: Vec<PathBuf> = TEMP_WRITE_PATHS.iter().map(PathBuf::from).collect();
        writable.push(cwd);
        for path in &options.allowed_write_paths {
            writable.push(absolute(path)?);
        }
        push_rule(&mut profile, "allow file*", &writable);

        profile.push_str("(deny file*\n");
        for dir in HOME_CREDENTIAL_DIRS {
            let _ = writeln!(
                profile,
                "    (subpath (string-append (param \"HOME\") \"/{}\"))",
                dir
            );
        }
        if options.read_scope == ReadScope::Broad {
            for path in &options.denied_read_paths {
                let _ = writeln!(profile, "    (subpath {})", sbpl_string(path));
            }
        }
        profile.push_str(")\n");

        Ok(profile)
    }

    fn inner_command(command: &str, options: &SandboxOptions) -> String {
        if options.max_cpu_percent.is_some() {
            warn!("CPU limits are not supported by sandbox-exec; ignoring max_cpu_percent");
        }
        match options.max_memory_mb {
            Some(mb) => format!("ulimit -v {}; {}", u64::from(mb.get()) * 1024, command),
            None => command.to_string(),
        }
    }
}

impl Default for SandboxExecIsolator {
    fn default() -> Self {
        Self::new()
    }
}

fn push_rule(profile: &mut String, rule: &str, paths: &[PathBuf]) {
    let _ = writeln!(profile, "({}", rule);
    for path in paths {
        let _ = writeln!(profile, "    (subpath {})", sbpl_string(path));
    }
    profile.push_str(")\n\n");
}

/// Quote a path as an SBPL string literal.
fn sbpl_string(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

impl FilesystemIsolator for SandboxExecIsolator {
    fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    fn platform(&self) -> Platform {
        Platform::Macos
    }

    fn wrap_command(
        &self,
        command: &str,
        options: &SandboxOptions,
    ) -> Result<IsolatedCommand, SandboxError> {
        let profile = self.generate_profile(options)?;
        let path = self.profile_path();

        fs::create_dir_all(&self.profile_dir)
            .and_then(|_| fs::write(&path, profile))
            .map_err(|source| SandboxError::ProfileWrite {
                path: path.clone(),
                source,
            })?;
        debug!("Wrote sandbox profile to {:?}", path);

        let home = options
            .lookup_env("HOME")
            .or_else(|| dirs::home_dir().map(|h| h.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let args = [
            "sandbox-exec".to_string(),
            "-f".to_string(),
            path.to_string_lossy().into_owned(),
            "-D".to_string(),
            format!("HOME={}", home),
            "/bin/sh".to_string(),
            "-c".to_string(),
            Self::inner_command(command, options),
        ];

        let mut env = options.env.clone();
        if let Some(proxy) = options.effective_proxy() {
            for var in PROXY_ENV_VARS {
                env.insert(var.to_string(), proxy.to_string());
            }
        }

        Ok(IsolatedCommand {
            command: join_quoted(&args),
            env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolator(dir: &Path) -> SandboxExecIsolator {
        SandboxExecIsolator::with_binary(Some(PathBuf::from("/usr/bin/sandbox-exec")))
            .with_profile_dir(dir)
    }

    #[test]
    fn test_broad_profile() {
        let temp = tempdir().unwrap();
        let options = SandboxOptions::new("/work").deny_read("/Users/dev/.kube");
        let profile = isolator(temp.path()).generate_profile(&options).unwrap();

        assert!(profile.starts_with("(version 1)"));
        assert!(profile.contains("(deny default)"));
        assert!(profile.contains("(allow file-read*)\n"));
        assert!(profile.contains("(subpath \"/work\")"));
        assert!(profile.contains("(subpath \"/Users/dev/.kube\")"));
        assert!(profile.contains("(param \"HOME\") \"/.ssh\""));
        assert!(profile.contains("(param \"HOME\") \"/.gnupg\""));
    }

    #[test]
    fn test_restricted_profile() {
        let temp = tempdir().unwrap();
        let options = SandboxOptions::new("/work")
            .read_scope(ReadScope::Restricted)
            .allow_read("/opt/data")
            .allow_write("/tmp/out")
            .deny_read("/Users/dev/.kube");
        let profile = isolator(temp.path()).generate_profile(&options).unwrap();

        assert!(!profile.contains("(allow file-read*)\n"));
        assert!(profile.contains("(allow file-read*\n"));
        assert!(profile.contains("(subpath \"/System/Library\")"));
        assert!(profile.contains("(subpath \"/opt/data\")"));
        assert!(profile.contains("(subpath \"/tmp/out\")"));
        // configured denials only matter when everything else is readable
        assert!(!profile.contains("/Users/dev/.kube"));
    }

    #[test]
    fn test_sbpl_string_escapes() {
        assert_eq!(sbpl_string(Path::new("/a \"b\"")), "\"/a \\\"b\\\"\"");
    }

    #[test]
    fn test_wrap_writes_profile() {
        let temp = tempdir().unwrap();
        let isolator = isolator(temp.path());
        let options = SandboxOptions::new("/work").env_var("HOME", "/Users/dev");
        let wrapped = isolator.wrap_command("ls -la", &options).unwrap();

        let profile_path = isolator.profile_path();
        assert!(profile_path.exists());
        assert!(
            profile_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("profile_")
        );
        assert!(wrapped.command.starts_with("sandbox-exec -f "));
        assert!(wrapped.command.contains("-D HOME=/Users/dev"));
        assert!(wrapped.command.ends_with("/bin/sh -c 'ls -la'"));
    }

    #[test]
    fn test_memory_limit_prefix() {
        let temp = tempdir().unwrap();
        let options = SandboxOptions::new("/work")
            .max_memory_mb(100)
            .max_cpu_percent(50);
        let wrapped = isolator(temp.path()).wrap_command("make", &options).unwrap();
        assert!(wrapped.command.contains("ulimit -v 102400; make"));
        assert!(!wrapped.command.contains("CPUQuota"));
    }

    #[test]
    fn test_proxy_env() {
        let temp = tempdir().unwrap();
        let options = SandboxOptions::new("/work").proxy_url("http://127.0.0.1:9050");
        let wrapped = isolator(temp.path()).wrap_command("curl x", &options).unwrap();
        assert_eq!(
            wrapped.env.get("HTTPS_PROXY"),
            Some(&"http://127.0.0.1:9050".to_string())
        );
        assert_eq!(
            wrapped.env.get("http_proxy"),
            Some(&"http://127.0.0.1:9050".to_string())
        );
    }

    #[test]
    fn test_unwritable_profile_dir() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "").unwrap();
        let isolator = isolator(&blocker.join("nested"));
        let result = isolator.wrap_command("ls", &SandboxOptions::new("/work"));
        assert!(matches!(result, Err(SandboxError::ProfileWrite { .. })));
    }
}
