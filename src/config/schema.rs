//! Policy schema definitions.
//!
//! The policy is persisted as a flat JSON object. Every key below maps
//! one-to-one onto a field of [`Policy`]; keys that this version does not
//! know about are carried separately by the store and written back untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use super::error::ConfigError;

/// Package registries, git hosts and AI API hosts reachable without a prompt.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "pypi.org",
    "files.pythonhosted.org",
    "npmjs.com",
    "registry.npmjs.org",
    "rubygems.org",
    "crates.io",
    "github.com",
    "raw.githubusercontent.com",
    "gitlab.com",
    "bitbucket.org",
    "cdn.jsdelivr.net",
    "unpkg.com",
    "docs.python.org",
    "nodejs.org",
    "api.openai.com",
    "api.anthropic.com",
    "generativelanguage.googleapis.com",
];

/// Credential directories hidden from sandboxed commands by default.
pub const DEFAULT_DENIED_READ_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.aws",
    "~/.gnupg",
    "~/.config/gcloud",
    "~/.kube",
];

/// Commands that are never sandboxed.
///
/// Service managers and container engines need host namespaces to work.
pub const DEFAULT_EXCLUDED_COMMANDS: &[&str] = &["docker", "watchman", "podman", "systemctl"];

/// Default port for the HTTP proxy.
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 9050;

/// Default port reserved for a SOCKS proxy.
pub const DEFAULT_SOCKS_PROXY_PORT: u16 = 9051;

/// How much of the host filesystem a sandboxed command may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadScope {
    /// Everything except the denied paths.
    #[default]
    Broad,
    /// Only system directories plus explicitly allowed paths.
    Restricted,
}

impl fmt::Display for ReadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadScope::Broad => write!(f, "broad"),
            ReadScope::Restricted => write!(f, "restricted"),
        }
    }
}

impl FromStr for ReadScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "broad" => Ok(ReadScope::Broad),
            "restricted" => Ok(ReadScope::Restricted),
            other => Err(ConfigError::InvalidValue {
                field: "read_scope".to_string(),
                message: format!("expected 'broad' or 'restricted', got '{}'", other),
            }),
        }
    }
}

/// The persisted sandbox policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Policy {
    /// Master switch. Sandboxing is opt-in.
    pub enabled: bool,

    /// Wrap commands with the platform isolator.
    pub filesystem_isolation: bool,

    /// Route child traffic through the allowlist proxy.
    pub network_isolation: bool,

    /// Domains reachable without approval. Exact names or `*.suffix`.
    pub allowed_domains: Vec<String>,

    /// Extra read-only paths (restricted scope).
    pub allowed_read_paths: Vec<String>,

    /// Extra read-write paths.
    pub allowed_write_paths: Vec<String>,

    /// Paths hidden in broad scope. `~` is expanded when options are built.
    pub denied_read_paths: Vec<String>,

    /// Read scope.
    pub read_scope: ReadScope,

    /// Ask before letting the proxy reach an unlisted domain.
    pub require_approval_for_new_domains: bool,

    /// Loopback port the HTTP proxy listens on.
    pub http_proxy_port: u16,

    /// Reserved SOCKS port (reported only).
    pub socks_proxy_port: u16,

    /// Leading tokens that always run natively.
    pub excluded_commands: Vec<String>,

    /// Permit an approved unsandboxed re-run after a sandbox-looking failure.
    pub allow_unsandboxed_commands: bool,

    /// Memory cap in MiB.
    pub max_memory_mb: Option<NonZeroU32>,

    /// CPU cap in percent of one core.
    pub max_cpu_percent: Option<NonZeroU32>,

    /// Wall-clock cap in seconds, lowering the supervisor's ceiling.
    pub max_execution_time: Option<NonZeroU32>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: false,
            filesystem_isolation: true,
            network_isolation: true,
            allowed_domains: DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect(),
            allowed_read_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            denied_read_paths: DEFAULT_DENIED_READ_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            read_scope: ReadScope::Broad,
            require_approval_for_new_domains: true,
            http_proxy_port: DEFAULT_HTTP_PROXY_PORT,
            socks_proxy_port: DEFAULT_SOCKS_PROXY_PORT,
            excluded_commands: DEFAULT_EXCLUDED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            allow_unsandboxed_commands: true,
            max_memory_mb: None,
            max_cpu_percent: None,
            max_execution_time: None,
        }
    }
}
