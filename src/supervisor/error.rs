//! Supervisor error types.

use thiserror::Error;

/// Errors raised while launching or controlling a supervised process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The command line was empty or whitespace.
    #[error("Command cannot be empty")]
    EmptyCommand,

    /// The shell could not be spawned.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        /// The command that failed to start.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Sending a signal failed for a reason other than the target being gone.
    #[error("Failed to signal process {pid}: {message}")]
    Signal {
        /// Target process (group) id.
        pid: u32,
        /// Error message.
        message: String,
    },

    /// Another command holds the confirmation prompt.
    #[error("Another command is currently awaiting confirmation")]
    ConfirmationBusy,
}
