//! Supervised execution of shell commands.
//!
//! Each command runs as the leader of its own process group with its output
//! drained by two reader threads. The calling thread polls for exit, user
//! interrupts and timeouts, and tears the whole group down on the way out:
//!
//! ```text
//!  Pending ──► Confirming ──► Running ──┬──► Completed
//!                  │                    ├──► TimedOut
//!                  │                    ├──► Killed
//!                  └────────────────────┴──► Failed
//! ```

pub mod confirm;
pub mod error;
pub mod interrupt;
pub mod output;
pub mod registry;
pub mod runner;
pub mod terminate;

pub use confirm::{Confirmation, ConfirmationLock, ConfirmationPrompt, StdinPrompt};
pub use error::SupervisorError;
pub use interrupt::InterruptScope;
pub use output::{
    CommandState, MAX_LINE_LENGTH, MAX_OUTPUT_LINES, OutputStream, ShellCommandOutput,
    truncate_line,
};
pub use registry::{ProcessRegistry, Registration};
pub use runner::{
    ABSOLUTE_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT, LineSink, POLL_INTERVAL, ProcessSupervisor,
    RunRequest, TIMEOUT_EXIT_CODE,
};
pub use terminate::{KillSignal, ProcessHandle, signal_group};
