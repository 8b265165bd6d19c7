//! Domain-filtering HTTP proxy.
//!
//! Sandboxed commands are pointed at this proxy through `HTTP_PROXY` and
//! friends. It enforces a domain allowlist on both HTTPS (`CONNECT`) and
//! plain HTTP traffic:
//!
//! ```text
//!  sandboxed command ──► 127.0.0.1:<port> ──► allowlist? ──yes──► origin
//!                                                │
//!                                                no
//!                                                ▼
//!                                   approval gate (optional) ──deny──► 403
//! ```
//!
//! TLS is tunnelled, never intercepted. Filtering is cooperative: a program
//! that ignores proxy variables is not stopped here.

pub mod allowlist;
pub mod approval;
pub mod connect;
pub mod error;
pub mod server;

pub use allowlist::DomainAllowlist;
pub use approval::{ApprovalRequest, DEFAULT_APPROVAL_TIMEOUT, DomainApprovalGate};
pub use connect::ProxyContext;
pub use error::{ProxyError, ProxyResult};
pub use server::{ProxyConfig, ProxyServer, ProxyServerBuilder};
