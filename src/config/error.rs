//! Errors surfaced by the policy store.

use std::path::PathBuf;
use thiserror::Error;

/// Why a policy could not be loaded, validated or persisted.
///
/// Read and parse failures are downgraded to defaults by the store; they are
/// still built so the warning carries the path.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy file exists but could not be read.
    #[error("Cannot read {path}: {source}")]
    ReadError {
        /// Policy file location.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The policy file is not valid JSON.
    #[error("{path} is not valid JSON: {source}")]
    ParseError {
        /// Policy file location.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },

    /// The directory or file could not be written.
    #[error("Cannot save policy to {path}: {source}")]
    WriteError {
        /// Policy file location.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A mutation was rejected before touching the file.
    #[error("Rejected {field}: {message}")]
    InvalidValue {
        /// Field being changed.
        field: String,
        /// What was wrong with the value.
        message: String,
    },

    /// No home directory to anchor the default policy location.
    #[error("No home directory for the default policy location")]
    NoHomeDirectory,

    /// The in-memory policy could not be encoded.
    #[error("Cannot encode policy: {0}")]
    SerializeError(#[from] serde_json::Error),
}
