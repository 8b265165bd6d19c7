//! Failures inside the filtering proxy.
//!
//! Most of these never leave the proxy: they are turned into a 4xx/5xx reply
//! for the sandboxed client and a log line for the operator.

use thiserror::Error;

/// Error raised while accepting, filtering or forwarding a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket-level failure.
    #[error("proxy socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the HTTP/1 connection driver.
    #[error("proxy HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The client sent a request without a usable destination.
    #[error("Bad proxy request: {0}")]
    InvalidRequest(String),

    /// The destination is allowed but could not be reached.
    #[error("Upstream {addr} unreachable: {message}")]
    UpstreamConnect {
        /// `host:port` that was dialed.
        addr: String,
        /// Reason reported by the connect attempt.
        message: String,
    },

    /// The client connection could not be taken over for tunneling.
    #[error("CONNECT tunnel not established: {0}")]
    UpgradeFailed(String),

    /// The listener could not be opened.
    #[error("Cannot listen on 127.0.0.1:{port}: {source}")]
    Bind {
        /// Port that was requested, 0 for ephemeral.
        port: u16,
        /// Error from `bind`.
        #[source]
        source: std::io::Error,
    },
}

/// Shorthand used across the proxy module.
pub type ProxyResult<T> = Result<T, ProxyError>;
