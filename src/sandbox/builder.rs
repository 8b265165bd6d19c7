//! Assembles a `bwrap` invocation as one shell string.
//!
//! The result is fed to `/bin/sh -c` by the supervisor, so every argument is
//! quoted as it is rendered, never as it is pushed.

use std::borrow::Cow;
use std::path::Path;

/// Quote one argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(arg)).into_owned()
}

/// Quote each argument and join with single spaces.
pub fn join_quoted<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordered `bwrap` arguments. Mount flags are applied by bwrap in the order
/// given, so later binds shadow earlier ones.
#[derive(Debug, Clone, Default)]
pub struct BwrapBuilder {
    args: Vec<String>,
}

impl BwrapBuilder {
    const PROGRAM: &'static str = "bwrap";

    /// Empty invocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a literal argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn flag_paths(self, flag: &str, paths: &[&Path]) -> Self {
        paths
            .iter()
            .fold(self.arg(flag), |b, p| b.arg(p.to_string_lossy().into_owned()))
    }

    /// `--unshare-all`
    pub fn unshare_all(self) -> Self {
        self.arg("--unshare-all")
    }

    /// `--share-net`: the proxy filters traffic, not the namespace.
    pub fn share_net(self) -> Self {
        self.arg("--share-net")
    }

    /// `--clearenv`
    pub fn clear_env(self) -> Self {
        self.arg("--clearenv")
    }

    /// Expose `src` at `dest`, read-only.
    pub fn bind_ro(self, src: &Path, dest: &Path) -> Self {
        self.flag_paths("--ro-bind", &[src, dest])
    }

    /// Like [`bind_ro`](Self::bind_ro) but tolerates a missing source.
    pub fn bind_ro_try(self, src: &Path, dest: &Path) -> Self {
        self.flag_paths("--ro-bind-try", &[src, dest])
    }

    /// Expose `src` at `dest`, writable.
    pub fn bind_rw(self, src: &Path, dest: &Path) -> Self {
        self.flag_paths("--bind", &[src, dest])
    }

    /// Like [`bind_rw`](Self::bind_rw) but tolerates a missing source.
    pub fn bind_rw_try(self, src: &Path, dest: &Path) -> Self {
        self.flag_paths("--bind-try", &[src, dest])
    }

    /// Private, empty, writable directory at `dest`. Also used to hide a
    /// denied directory.
    pub fn tmpfs(self, dest: &Path) -> Self {
        self.flag_paths("--tmpfs", &[dest])
    }

    /// Minimal device nodes under `/dev`.
    pub fn dev_minimal(self) -> Self {
        self.arg("--dev").arg("/dev")
    }

    /// Fresh procfs for the new pid namespace.
    pub fn proc_mount(self, dest: &Path) -> Self {
        self.flag_paths("--proc", &[dest])
    }

    /// Working directory inside the sandbox.
    pub fn chdir(self, path: &Path) -> Self {
        self.flag_paths("--chdir", &[path])
    }

    /// Set one variable; meaningful after [`clear_env`](Self::clear_env).
    pub fn setenv(self, key: &str, value: &str) -> Self {
        self.arg("--setenv").arg(key).arg(value)
    }

    /// `--die-with-parent`
    pub fn die_with_parent(self) -> Self {
        self.arg("--die-with-parent")
    }

    /// `--new-session`, so the sandbox cannot inject input into our tty.
    pub fn new_session(self) -> Self {
        self.arg("--new-session")
    }

    /// Terminate the option list and name the program to run. Call last.
    pub fn command(self, program: &str, args: &[String]) -> Self {
        args.iter()
            .fold(self.arg("--").arg(program), |b, a| b.arg(a.clone()))
    }

    /// Render `bwrap` and its arguments, each quoted.
    pub fn to_command_line(&self) -> String {
        std::iter::once(shell_quote(Self::PROGRAM))
            .chain(self.args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
