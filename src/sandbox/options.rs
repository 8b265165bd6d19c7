//! Per-invocation sandbox options.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use crate::config::{Policy, ReadScope, expand_tilde};

use super::error::SandboxError;

/// Environment variables re-exported into a Linux sandbox.
pub const SAFE_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL"];

/// Proxy variables injected when network isolation is active.
pub const PROXY_ENV_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Options for a single wrapped command.
///
/// Write access is always limited to `cwd`, temp space and
/// `allowed_write_paths`, whatever the read scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Whether the filesystem should be isolated at all.
    pub filesystem_isolation: bool,
    /// Whether proxy variables should be injected.
    pub network_isolation: bool,
    /// Extra read-only paths.
    pub allowed_read_paths: Vec<PathBuf>,
    /// Extra read-write paths.
    pub allowed_write_paths: Vec<PathBuf>,
    /// Paths hidden in broad scope (already `~`-expanded).
    pub denied_read_paths: Vec<PathBuf>,
    /// Read scope.
    pub read_scope: ReadScope,
    /// Working directory of the command.
    pub cwd: PathBuf,
    /// Caller-supplied environment.
    pub env: HashMap<String, String>,
    /// Proxy URL (`http://127.0.0.1:port`) if one is listening.
    pub proxy_url: Option<String>,
    /// Memory cap in MiB.
    pub max_memory_mb: Option<NonZeroU32>,
    /// CPU cap in percent of one core.
    pub max_cpu_percent: Option<NonZeroU32>,
    /// Wall-clock cap in seconds.
    pub max_execution_time: Option<NonZeroU32>,
}

impl SandboxOptions {
    /// Options for `cwd` with isolation on and nothing else allowed.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            filesystem_isolation: true,
            network_isolation: true,
            allowed_read_paths: Vec::new(),
            allowed_write_paths: Vec::new(),
            denied_read_paths: Vec::new(),
            read_scope: ReadScope::Broad,
            cwd: cwd.into(),
            env: HashMap::new(),
            proxy_url: None,
            max_memory_mb: None,
            max_cpu_percent: None,
            max_execution_time: None,
        }
    }

    /// Build options from the persisted policy.
    pub fn from_policy(policy: &Policy, cwd: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            filesystem_isolation: policy.filesystem_isolation,
            network_isolation: policy.network_isolation,
            allowed_read_paths: policy.allowed_read_paths.iter().map(|p| expand_tilde(p)).collect(),
            allowed_write_paths: policy.allowed_write_paths.iter().map(|p| expand_tilde(p)).collect(),
            denied_read_paths: policy.denied_read_paths.iter().map(|p| expand_tilde(p)).collect(),
            read_scope: policy.read_scope,
            cwd: cwd.into(),
            env,
            proxy_url: None,
            max_memory_mb: policy.max_memory_mb,
            max_cpu_percent: policy.max_cpu_percent,
            max_execution_time: policy.max_execution_time,
        }
    }

    /// Set the read scope.
    pub fn read_scope(mut self, scope: ReadScope) -> Self {
        self.read_scope = scope;
        self
    }

    #[cfg(test)]
    pub(crate) fn allow_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_read_paths.push(path.into());
        self
    }

    /// Add a read-write path.
    pub fn allow_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_write_paths.push(path.into());
        self
    }

    #[cfg(test)]
    pub(crate) fn deny_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.denied_read_paths.push(path.into());
        self
    }

    #[cfg(test)]
    pub(crate) fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the proxy URL.
    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    /// Toggle network isolation.
    pub fn network_isolation(mut self, enabled: bool) -> Self {
        self.network_isolation = enabled;
        self
    }

    /// Set the memory cap.
    pub fn max_memory_mb(mut self, mb: u32) -> Self {
        self.max_memory_mb = NonZeroU32::new(mb);
        self
    }

    /// Set the CPU cap.
    pub fn max_cpu_percent(mut self, percent: u32) -> Self {
        self.max_cpu_percent = NonZeroU32::new(percent);
        self
    }

    /// Absolute form of `cwd`.
    pub fn absolute_cwd(&self) -> Result<PathBuf, SandboxError> {
        absolute(&self.cwd)
    }

    /// Proxy URL to inject, if network isolation is active.
    pub fn effective_proxy(&self) -> Option<&str> {
        if self.network_isolation {
            self.proxy_url.as_deref()
        } else {
            None
        }
    }

    /// Look up a variable in the caller env, then the host env.
    pub(crate) fn lookup_env(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.is_empty())
    }
}

/// Make a path absolute without touching the filesystem.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf, SandboxError> {
    if path.as_os_str().is_empty() {
        return Err(SandboxError::InvalidPath {
            path: path.to_path_buf(),
            message: "empty path".to_string(),
        });
    }
    std::path::absolute(path).map_err(|e| SandboxError::InvalidPath {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
