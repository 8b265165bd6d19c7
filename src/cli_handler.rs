//! Subcommand handling for shellguard.
//!
//! Policy subcommands are thin wrappers over [`PolicyStore`] mutators.
//! `run` and `proxy` build a Tokio runtime for the proxy and, for `run`,
//! drive the supervisor from the calling thread.

use anyhow::{Context, Result, bail};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, Setting};
use crate::config::PolicyStore;
use crate::orchestrator::{SandboxOrchestrator, SandboxStatus};
use crate::proxy::{DEFAULT_APPROVAL_TIMEOUT, DomainAllowlist, DomainApprovalGate, ProxyServerBuilder};
use crate::retry::RetryPolicy;
use crate::sandbox::{FilesystemIsolator, Platform};
use crate::supervisor::{Confirmation, OutputStream, ProcessSupervisor, RunRequest, StdinPrompt};
use crate::telemetry::AuditLogger;

/// Tools `test` reports on.
const ISOLATION_TOOLS: [&str; 3] = ["bwrap", "sandbox-exec", "systemd-run"];

/// Dispatch a parsed command line.
pub fn handle_command(cli: Cli, audit: Arc<AuditLogger>) -> Result<ExitCode> {
    let store = Arc::new(open_store(cli.config.as_deref())?);

    match cli.command {
        Commands::Enable => {
            store.set_enabled(true).context("Failed to enable sandboxing")?;
            let orchestrator = SandboxOrchestrator::new(store.clone(), audit);
            let status = orchestrator.get_status();
            println!("Sandboxing enabled (isolator: {})", status.isolator);
            if !status.isolator_available {
                warn!("No isolator is available; commands will run unwrapped");
            }
        }
        Commands::Disable => {
            store.set_enabled(false).context("Failed to disable sandboxing")?;
            println!("Sandboxing disabled");
        }
        Commands::Status { json } => {
            let status = SandboxOrchestrator::new(store, audit).get_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Test => run_self_test(store, audit)?,
        Commands::AllowDomain { domain } => {
            store
                .add_allowed_domain(&domain)
                .with_context(|| format!("Failed to allow domain '{}'", domain))?;
            println!("Allowed {}", domain.to_lowercase());
        }
        Commands::RemoveDomain { domain } => {
            store
                .remove_allowed_domain(&domain)
                .with_context(|| format!("Failed to remove domain '{}'", domain))?;
            println!("Removed {}", domain.to_lowercase());
        }
        Commands::AllowPath { path } => {
            store
                .add_allowed_write_path(&path)
                .with_context(|| format!("Failed to allow write path '{}'", path))?;
            println!("Writable: {}", path);
        }
        Commands::AllowReadPath { path } => {
            store
                .add_allowed_read_path(&path)
                .with_context(|| format!("Failed to allow read path '{}'", path))?;
            println!("Readable: {}", path);
        }
        Commands::RemovePath { path } => {
            store
                .remove_allowed_write_path(&path)
                .with_context(|| format!("Failed to remove write path '{}'", path))?;
            println!("No longer writable: {}", path);
        }
        Commands::RemoveReadPath { path } => {
            store
                .remove_allowed_read_path(&path)
                .with_context(|| format!("Failed to remove read path '{}'", path))?;
            println!("No longer readable: {}", path);
        }
        Commands::DenyReadPath { path } => {
            store
                .add_denied_read_path(&path)
                .with_context(|| format!("Failed to deny read path '{}'", path))?;
            println!("Hidden: {}", path);
        }
        Commands::Exclude { command } => {
            store
                .add_excluded_command(&command)
                .with_context(|| format!("Failed to exclude '{}'", command))?;
            println!("'{}' will always run natively", command);
        }
        Commands::Include { command } => {
            store
                .remove_excluded_command(&command)
                .with_context(|| format!("Failed to include '{}'", command))?;
            println!("'{}' will be sandboxed", command);
        }
        Commands::ReadScope { scope } => {
            store
                .set_read_scope(scope)
                .context("Failed to set read scope")?;
            println!("Read scope: {}", scope);
        }
        Commands::Set { setting, value } => {
            apply_setting(&store, setting, &value)
                .with_context(|| format!("Failed to set {:?} to '{}'", setting, value))?;
            println!("{:?} = {}", setting, value);
        }
        Commands::Run {
            timeout,
            cwd,
            yes,
            command,
        } => return run_command(store, audit, command.join(" "), cwd, timeout, yes),
        Commands::Proxy { port } => run_proxy(store, audit, port)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn open_store(config: Option<&Path>) -> Result<PolicyStore> {
    match config {
        Some(path) => Ok(PolicyStore::with_path(path)),
        None => PolicyStore::open().context("Failed to locate the policy file"),
    }
}

/// Parse `value` for `setting` and write it to the store.
fn apply_setting(store: &PolicyStore, setting: Setting, value: &str) -> Result<()> {
    match setting {
        Setting::FilesystemIsolation => store.set_filesystem_isolation(parse_switch(value)?)?,
        Setting::NetworkIsolation => store.set_network_isolation(parse_switch(value)?)?,
        Setting::RequireApproval => {
            store.set_require_approval_for_new_domains(parse_switch(value)?)?
        }
        Setting::AllowUnsandboxed => store.set_allow_unsandboxed_commands(parse_switch(value)?)?,
        Setting::HttpProxyPort => store.set_http_proxy_port(value.trim().parse()?)?,
        Setting::SocksProxyPort => store.set_socks_proxy_port(value.trim().parse()?)?,
        Setting::MaxMemoryMb => store.set_max_memory_mb(parse_limit(value)?)?,
        Setting::MaxCpuPercent => store.set_max_cpu_percent(parse_limit(value)?)?,
        Setting::MaxExecutionTime => store.set_max_execution_time(parse_limit(value)?)?,
    }
    Ok(())
}

fn parse_switch(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => bail!("expected on or off, got '{}'", other),
    }
}

/// `none` or `0` clears the limit.
fn parse_limit(value: &str) -> Result<Option<NonZeroU32>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    Ok(NonZeroU32::new(value.parse()?))
}

fn print_status(status: &SandboxStatus) {
    let on_off = |flag: bool| if flag { "on" } else { "off" };
    println!("Sandboxing:          {}", on_off(status.enabled));
    println!("Filesystem isolation: {}", on_off(status.filesystem_isolation));
    println!("Network isolation:   {}", on_off(status.network_isolation));
    println!("Read scope:          {}", status.read_scope);
    println!(
        "Isolator:            {} ({}, {})",
        status.isolator,
        status.platform,
        if status.isolator_available {
            "available"
        } else {
            "unavailable"
        }
    );
    println!(
        "Proxy port:          {} (SOCKS {}, reserved)",
        status.http_proxy_port, status.socks_proxy_port
    );
    println!("Allowed domains:     {}", status.allowed_domains);
    println!("Require approval:    {}", on_off(status.require_approval_for_new_domains));
    println!("Unsandboxed retries: {}", on_off(status.allow_unsandboxed_commands));
    print_list("Writable paths", &status.allowed_write_paths);
    print_list("Readable paths", &status.allowed_read_paths);
    print_list("Hidden paths", &status.denied_read_paths);
    print_list("Excluded commands", &status.excluded_commands);
    println!("Policy file:         {}", status.config_path.display());
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        println!("{}: (none)", label);
    } else {
        println!("{}:", label);
        for item in items {
            println!("  - {}", item);
        }
    }
}

fn run_self_test(store: Arc<PolicyStore>, audit: Arc<AuditLogger>) -> Result<()> {
    let orchestrator = SandboxOrchestrator::new(store.clone(), audit);
    let isolator = orchestrator.isolator();

    println!("Platform: {}", Platform::host());
    for tool in ISOLATION_TOOLS {
        match which::which(tool) {
            Ok(path) => println!("  {:<13} {}", tool, path.display()),
            Err(_) => println!("  {:<13} not found", tool),
        }
    }
    println!(
        "Selected isolator: {} ({})",
        isolator.name(),
        if isolator.is_available() {
            "available"
        } else {
            "unavailable"
        }
    );

    if !store.enabled() {
        println!("Sandboxing is disabled; run `shellguard enable` to wrap commands");
        return Ok(());
    }

    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let sample = "echo hello";
    let wrapped = orchestrator
        .wrap_command(sample, &cwd, std::collections::HashMap::new())
        .context("Failed to wrap the sample command")?;
    println!("Sample: {}", sample);
    println!("Wrapped: {}", wrapped.command);
    if !wrapped.sandboxed {
        println!("(not sandboxed: the command would run unwrapped)");
    }
    Ok(())
}

fn run_command(
    store: Arc<PolicyStore>,
    audit: Arc<AuditLogger>,
    command: String,
    cwd: Option<PathBuf>,
    timeout: u64,
    yes: bool,
) -> Result<ExitCode> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    // Unknown domains are blocked during `run`: stdin belongs to the
    // Ctrl-X listener while the command executes.
    let orchestrator = SandboxOrchestrator::new(store.clone(), audit.clone()).with_policy_proxy(None);
    if store.enabled()
        && let Some(addr) = rt
            .block_on(orchestrator.start_network_proxy())
            .context("Failed to start the network proxy")?
    {
        info!("Network proxy listening on {}", addr);
    }

    let retry = RetryPolicy::new(store, audit.clone());
    // The key listener keeps the terminal in raw mode while the command runs.
    let eol = if std::io::stderr().is_terminal() { "\r\n" } else { "\n" };
    let supervisor = ProcessSupervisor::new(audit)
        .prompt(Box::new(StdinPrompt))
        .auto_approve(yes)
        .on_line(Arc::new(move |stream: OutputStream, line: &str| match stream {
            OutputStream::Stdout => eprint!("{}{}", line, eol),
            OutputStream::Stderr => eprint!("! {}{}", line, eol),
        }));

    let mut request = RunRequest::new(command).inactivity_timeout(Duration::from_secs(timeout));
    if let Some(dir) = cwd {
        request = request.cwd(dir);
    }

    let approve_retry = |command: &str| -> Result<bool> {
        ask(&format!(
            "'{}' failed in a way the sandbox may have caused. Re-run it without isolation? [y/N]: ",
            command
        ))
        .map(|answer| Confirmation::from_answer(&answer).approved)
    };
    let output = supervisor.run_with_retry(&orchestrator, &retry, &request, Some(&approve_retry));

    rt.block_on(orchestrator.stop_network_proxy());

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(if output.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_proxy(store: Arc<PolicyStore>, audit: Arc<AuditLogger>, port: Option<u16>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        let policy = store.policy();
        let prompt_lock = Arc::new(Mutex::new(()));
        let approving_store = store.clone();
        let gate = Arc::new(DomainApprovalGate::from_fn(DEFAULT_APPROVAL_TIMEOUT, move |domain: String| {
            let store = approving_store.clone();
            let prompt_lock = prompt_lock.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let _held = prompt_lock.lock().unwrap_or_else(PoisonError::into_inner);
                    approve_domain(&store, &domain)
                })
                .await
                .unwrap_or(false)
            }
        }));

        let proxy = ProxyServerBuilder::new()
            .port(port.unwrap_or(policy.http_proxy_port))
            .require_approval(policy.require_approval_for_new_domains)
            .allowlist(Arc::new(DomainAllowlist::new(&policy.allowed_domains)))
            .approval(gate.clone())
            .audit(audit)
            .build();

        let addr = proxy.start().await.context("Failed to start the proxy")?;
        eprintln!("Proxy listening on http://{} (Ctrl-C to stop)", addr);

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        let abandoned = gate.pending_domains();
        if !abandoned.is_empty() {
            warn!("Denying unanswered approvals for: {}", abandoned.join(", "));
        }
        proxy.stop().await;
        eprintln!("Proxy stopped");
        Ok(())
    })
}

/// Ask about one domain; `always` also persists it to the policy.
fn approve_domain(store: &PolicyStore, domain: &str) -> bool {
    let answer = match ask(&format!(
        "Allow network access to {}? [y/N/always]: ",
        domain
    )) {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Approval prompt failed: {:#}", e);
            return false;
        }
    };

    let answer = answer.trim().to_ascii_lowercase();
    if answer == "a" || answer == "always" {
        if let Err(e) = store.add_allowed_domain(domain) {
            warn!("Could not save {} to the allowlist: {}", domain, e);
        }
        return true;
    }
    Confirmation::from_answer(&answer).approved
}

fn ask(question: &str) -> Result<String> {
    let mut stderr = std::io::stderr().lock();
    write!(stderr, "{}", question)?;
    stderr.flush()?;
    drop(stderr);

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read from stdin")?;
    Ok(answer)
}
