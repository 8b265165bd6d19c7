//! Sandbox orchestration.
//!
//! Ties the policy store, the filesystem isolator and the network proxy into
//! one `wrap_command` call. The orchestrator decides when a command runs
//! natively (excluded tools, sandboxing disabled, isolation unavailable) and
//! when it is rewritten, and injects the proxy address into the child's
//! environment when network isolation is on.
//!
//! Wrapping failures fall back to the unwrapped command so that a missing
//! `bwrap` never blocks legitimate work. Strict mode turns those fallbacks
//! into errors.

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::{PolicyStore, ReadScope};
use crate::proxy::{
    DomainAllowlist, DomainApprovalGate, ProxyError, ProxyServer, ProxyServerBuilder,
};
use crate::sandbox::{
    FilesystemIsolator, Isolator, PROXY_ENV_VARS, Platform, SandboxError, SandboxOptions,
};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Result of [`SandboxOrchestrator::wrap_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedCommand {
    /// The command line to hand to `/bin/sh -c`.
    pub command: String,
    /// Environment for the child process.
    pub env: HashMap<String, String>,
    /// The leading token matched an excluded command.
    pub was_excluded: bool,
    /// The command was rewritten by an isolator.
    pub sandboxed: bool,
}

impl WrappedCommand {
    fn passthrough(command: &str, env: HashMap<String, String>, was_excluded: bool) -> Self {
        Self {
            command: command.to_string(),
            env,
            was_excluded,
            sandboxed: false,
        }
    }
}

/// Snapshot of sandbox state for display.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    /// Master switch.
    pub enabled: bool,
    /// Filesystem isolation flag.
    pub filesystem_isolation: bool,
    /// Network isolation flag.
    pub network_isolation: bool,
    /// Read scope.
    pub read_scope: ReadScope,
    /// Host platform.
    pub platform: Platform,
    /// Selected isolator.
    pub isolator: String,
    /// Whether the selected isolator can wrap commands.
    pub isolator_available: bool,
    /// Whether the proxy is accepting connections.
    pub proxy_running: bool,
    /// Address the proxy is bound to, if running.
    pub proxy_address: Option<SocketAddr>,
    /// Configured HTTP proxy port.
    pub http_proxy_port: u16,
    /// Configured SOCKS port (stored only).
    pub socks_proxy_port: u16,
    /// Number of allowlisted domains.
    pub allowed_domains: usize,
    /// Extra read-write paths.
    pub allowed_write_paths: Vec<String>,
    /// Extra read-only paths.
    pub allowed_read_paths: Vec<String>,
    /// Paths hidden in broad scope.
    pub denied_read_paths: Vec<String>,
    /// Commands that always run natively.
    pub excluded_commands: Vec<String>,
    /// Whether unknown domains prompt for approval.
    pub require_approval_for_new_domains: bool,
    /// Whether unsandboxed retries may be offered.
    pub allow_unsandboxed_commands: bool,
    /// Where the policy is stored.
    pub config_path: PathBuf,
}

/// Composes policy, isolation and proxy into a single wrapping step.
pub struct SandboxOrchestrator {
    store: Arc<PolicyStore>,
    isolator: OnceLock<Isolator>,
    proxy: Option<Arc<ProxyServer>>,
    strict: bool,
    audit: Arc<AuditLogger>,
}

impl SandboxOrchestrator {
    /// Create an orchestrator over `store`.
    ///
    /// The isolator is detected lazily on first use.
    pub fn new(store: Arc<PolicyStore>, audit: Arc<AuditLogger>) -> Self {
        Self {
            store,
            isolator: OnceLock::new(),
            proxy: None,
            strict: false,
            audit,
        }
    }

    /// Use a specific isolator instead of detecting one.
    pub fn with_isolator(self, isolator: Isolator) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(isolator);
        Self {
            isolator: cell,
            ..self
        }
    }

    /// Attach a proxy server.
    pub fn with_proxy(mut self, proxy: Arc<ProxyServer>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Attach a proxy configured from the current policy.
    ///
    /// The proxy listens on `http_proxy_port`, allows `allowed_domains` and
    /// consults `approval` for anything else when the policy requires it.
    pub fn with_policy_proxy(self, approval: Option<Arc<DomainApprovalGate>>) -> Self {
        let policy = self.store.policy();
        let mut builder = ProxyServerBuilder::new()
            .port(policy.http_proxy_port)
            .require_approval(policy.require_approval_for_new_domains)
            .allowlist(Arc::new(DomainAllowlist::new(&policy.allowed_domains)))
            .audit(self.audit.clone());
        if let Some(gate) = approval {
            builder = builder.approval(gate);
        }
        self.with_proxy(Arc::new(builder.build()))
    }

    /// Fail `wrap_command` instead of falling back to the unwrapped command.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// The policy store.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// The audit logger.
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// The active isolator, detected on first call.
    pub fn isolator(&self) -> &Isolator {
        self.isolator.get_or_init(|| {
            let isolator = Isolator::detect();
            debug!("Selected isolator: {}", isolator.name());
            isolator
        })
    }

    /// The attached proxy, if any.
    pub fn proxy(&self) -> Option<&Arc<ProxyServer>> {
        self.proxy.as_ref()
    }

    /// Start the proxy if one is attached and network isolation is on.
    ///
    /// Returns the bound address when the proxy is running afterwards.
    pub async fn start_network_proxy(&self) -> Result<Option<SocketAddr>, ProxyError> {
        let Some(proxy) = &self.proxy else {
            return Ok(None);
        };
        let policy = self.store.policy();
        if !policy.network_isolation {
            debug!("Network isolation is off; proxy not started");
            return Ok(None);
        }
        self.sync_proxy_allowlist(&policy.allowed_domains);
        proxy.start().await.map(Some)
    }

    /// Push the policy's domains into the attached proxy, so domains allowed
    /// after the proxy was built take effect on the next command.
    fn sync_proxy_allowlist(&self, domains: &[String]) {
        if let Some(proxy) = &self.proxy {
            proxy.allowlist().replace(domains);
        }
    }

    /// Stop the proxy if it is running.
    pub async fn stop_network_proxy(&self) {
        if let Some(proxy) = &self.proxy {
            proxy.stop().await;
        }
    }

    /// Rewrite `command` for sandboxed execution.
    ///
    /// - Excluded commands are returned unchanged with `was_excluded` set,
    ///   whether or not sandboxing is enabled.
    /// - With sandboxing disabled the input comes back unchanged.
    /// - Otherwise the isolator wraps the command. If it is unavailable or
    ///   fails, the unwrapped command is returned (or an error in strict
    ///   mode).
    pub fn wrap_command(
        &self,
        command: &str,
        cwd: &Path,
        env: HashMap<String, String>,
    ) -> Result<WrappedCommand, SandboxError> {
        let policy = self.store.policy();
        self.sync_proxy_allowlist(&policy.allowed_domains);

        if let Some(matched) = match_excluded(command, &policy.excluded_commands) {
            info!("Running excluded command natively ({})", matched);
            self.audit.log(AuditEvent::CommandExcluded {
                command: command.to_string(),
                matched,
            });
            return Ok(WrappedCommand::passthrough(command, env, true));
        }

        if !policy.enabled {
            return Ok(WrappedCommand::passthrough(command, env, false));
        }

        let mut options = SandboxOptions::from_policy(&policy, cwd, env);
        if policy.network_isolation
            && let Some(url) = self.proxy_url()
        {
            options = options.proxy_url(url);
        }

        if !policy.filesystem_isolation {
            let env = with_proxy_env(options.env.clone(), options.effective_proxy());
            return Ok(WrappedCommand::passthrough(command, env, false));
        }

        let isolator = self.isolator();
        let wrapped = if matches!(isolator, Isolator::Noop(_)) || !isolator.is_available() {
            Err(SandboxError::Unavailable {
                isolator: isolator.name().to_string(),
            })
        } else {
            isolator.wrap_command(command, &options)
        };

        match wrapped {
            Ok(isolated) => {
                debug!("Wrapped command with {}", isolator.name());
                self.audit.log(AuditEvent::CommandSandboxed {
                    command: command.to_string(),
                    isolator: isolator.name().to_string(),
                });
                Ok(WrappedCommand {
                    command: isolated.command,
                    env: isolated.env,
                    was_excluded: false,
                    sandboxed: true,
                })
            }
            Err(e) if self.strict => Err(e),
            Err(e) => {
                warn!("Sandboxing failed, running unwrapped: {}", e);
                self.audit.log(AuditEvent::SandboxFallback {
                    command: command.to_string(),
                    reason: e.to_string(),
                });
                let env = with_proxy_env(options.env.clone(), options.effective_proxy());
                Ok(WrappedCommand::passthrough(command, env, false))
            }
        }
    }

    /// Aggregate policy flags, isolator and proxy state.
    pub fn get_status(&self) -> SandboxStatus {
        let policy = self.store.policy();
        let isolator = self.isolator();
        let proxy_address = self.proxy.as_ref().and_then(|p| p.local_addr());

        SandboxStatus {
            enabled: policy.enabled,
            filesystem_isolation: policy.filesystem_isolation,
            network_isolation: policy.network_isolation,
            read_scope: policy.read_scope,
            platform: Platform::host(),
            isolator: isolator.name().to_string(),
            isolator_available: !matches!(isolator, Isolator::Noop(_)) && isolator.is_available(),
            proxy_running: self.proxy.as_ref().is_some_and(|p| p.is_running()),
            proxy_address,
            http_proxy_port: policy.http_proxy_port,
            socks_proxy_port: policy.socks_proxy_port,
            allowed_domains: policy.allowed_domains.len(),
            allowed_write_paths: policy.allowed_write_paths,
            allowed_read_paths: policy.allowed_read_paths,
            denied_read_paths: policy.denied_read_paths,
            excluded_commands: policy.excluded_commands,
            require_approval_for_new_domains: policy.require_approval_for_new_domains,
            allow_unsandboxed_commands: policy.allow_unsandboxed_commands,
            config_path: self.store.path().to_path_buf(),
        }
    }

    fn proxy_url(&self) -> Option<String> {
        self.proxy.as_ref().and_then(|p| p.proxy_url())
    }
}

/// Match the command's leading token against excluded entries.
///
/// A token matches an entry by exact name or as a path ending in
/// `/<entry>`, so `/usr/bin/docker` matches `docker`.
fn match_excluded(command: &str, excluded: &[String]) -> Option<String> {
    let token = command.split_whitespace().next()?;
    excluded
        .iter()
        .find(|entry| {
            !entry.is_empty()
                && (token == entry.as_str()
                    || token
                        .strip_suffix(entry.as_str())
                        .is_some_and(|prefix| prefix.ends_with('/')))
        })
        .cloned()
}

fn with_proxy_env(mut env: HashMap<String, String>, proxy: Option<&str>) -> HashMap<String, String> {
    if let Some(url) = proxy {
        for var in PROXY_ENV_VARS {
            env.insert(var.to_string(), url.to_string());
        }
    }
    env
}
