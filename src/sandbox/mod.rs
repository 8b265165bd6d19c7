//! Filesystem isolation strategies.
//!
//! A shell command is rewritten into a platform-specific invocation that
//! limits what it can read and write:
//!
//! - **Linux**: Bubblewrap namespaces ([`BubblewrapIsolator`])
//! - **macOS**: `sandbox-exec` profiles ([`SandboxExecIsolator`])
//! - **Anything else**: pass-through ([`NoopIsolator`])
//!
//! # Security Model
//!
//! This is a best-effort, opt-in layer. It keeps an agent's commands away
//! from credentials and out of directories it was not pointed at; it is not a
//! hard boundary against a privileged adversary.
//!
//! # Example
//!
//! ```no_run
//! use shellguard::sandbox::{FilesystemIsolator, Isolator, SandboxOptions};
//!
//! let isolator = Isolator::detect();
//! let options = SandboxOptions::new("/home/dev/project").allow_write("/tmp/out");
//! let wrapped = isolator.wrap_command("make test", &options)?;
//! println!("{}", wrapped.command);
//! # Ok::<(), shellguard::sandbox::SandboxError>(())
//! ```

pub mod builder;
pub mod bwrap;
pub mod error;
pub mod isolator;
pub mod options;
pub mod seatbelt;

pub use builder::{BwrapBuilder, join_quoted, shell_quote};
pub use bwrap::BubblewrapIsolator;
pub use error::SandboxError;
pub use isolator::{FilesystemIsolator, IsolatedCommand, Isolator, NoopIsolator, Platform};
pub use options::{PROXY_ENV_VARS, SAFE_ENV_VARS, SandboxOptions};
pub use seatbelt::SandboxExecIsolator;
