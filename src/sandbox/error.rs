//! Error types for sandbox operations.
//!
//! Wrapping a command can fail before anything is spawned: the isolator may be
//! missing, a profile file may not be writable, or a path may not resolve.
//! The orchestrator treats all of these as recoverable unless strict mode is
//! requested.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolation tool is not installed on this host.
    #[error("Isolator '{isolator}' is not available on this host")]
    Unavailable {
        /// Name of the missing isolator.
        isolator: String,
    },

    /// Failed to write the sandbox profile file.
    #[error("Failed to write sandbox profile {path}: {source}")]
    ProfileWrite {
        /// Profile path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A path in the options could not be made absolute.
    #[error("Invalid sandbox path '{path}': {message}")]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
        /// Why it was rejected.
        message: String,
    },
}
