//! shellguard: opt-in isolation and supervision for agent-driven shell commands
//!
//! An assistant that runs shell commands on a developer's machine can read
//! credentials, write outside the project, or talk to arbitrary hosts. This
//! crate narrows that down without getting in the way of legitimate work.
//!
//! # Security Model
//!
//! Sandboxing is **opt-in and fail-open**: when isolation cannot be applied,
//! commands still run (unwrapped) and the fallback is audited. Strict mode
//! turns that fallback into an error.
//!
//! # Architecture
//!
//! - **Config**: Per-user JSON sandbox policy
//! - **Sandbox**: Filesystem isolation via bubblewrap (Linux) or sandbox-exec (macOS)
//! - **Proxy**: Local HTTP/CONNECT proxy enforcing a domain allowlist
//! - **Orchestrator**: Combines policy, isolator and proxy into one wrapping step
//! - **Retry**: Approval-gated unsandboxed re-runs
//! - **Supervisor**: Process groups, timeouts, interrupts and output capture
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod orchestrator;
pub mod proxy;
pub mod retry;
pub mod sandbox;
pub mod supervisor;
pub mod telemetry;
