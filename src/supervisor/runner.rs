//! Runs shell commands under supervision.
//!
//! A run moves through `Pending → Confirming → Running` and ends in exactly
//! one of the [`CommandState`](super::CommandState) values. While running,
//! the child is polled every [`POLL_INTERVAL`] for exit, user interrupts,
//! the absolute ceiling and output inactivity.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::confirm::{ConfirmationLock, ConfirmationPrompt};
use super::interrupt::InterruptScope;
use super::output::{OutputBuffer, OutputClock, OutputStream, ShellCommandOutput};
use super::registry::ProcessRegistry;
use super::terminate::ProcessHandle;
use super::SupervisorError;
use crate::orchestrator::SandboxOrchestrator;
use crate::retry::{RetryApproval, RetryPolicy};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Hard limit on a single command's wall-clock time.
pub const ABSOLUTE_TIMEOUT: Duration = Duration::from_secs(270);

/// How often the child is checked while it runs.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Inactivity limit used when the caller does not pick one.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Exit code reported for commands killed after a timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -9;

const READER_JOIN_AFTER_TIMEOUT: Duration = Duration::from_secs(3);
const READER_JOIN_AFTER_EXIT: Duration = Duration::from_secs(5);
const READER_JOIN_POLL: Duration = Duration::from_millis(20);

/// Receives every output line as it is read.
pub type LineSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// A command to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Shell command line.
    pub command: String,
    /// Working directory; the current directory when unset.
    pub cwd: Option<PathBuf>,
    /// Longest allowed gap between output lines.
    pub inactivity_timeout: Duration,
    /// Child environment; the inherited environment when unset.
    pub env: Option<HashMap<String, String>>,
}

impl RunRequest {
    /// A request with default timeout, cwd and environment.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            env: None,
        }
    }

    /// Set the working directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the inactivity timeout.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Replace the child environment.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    fn resolved_env(&self) -> HashMap<String, String> {
        self.env.clone().unwrap_or_else(inherited_env)
    }
}

/// How the polling loop ended.
enum Outcome {
    Exited(ExitStatus),
    TimedOut { limit: Duration, inactivity: bool },
    WaitFailed(std::io::Error),
}

/// Launches, watches and tears down shell commands.
pub struct ProcessSupervisor {
    registry: Arc<ProcessRegistry>,
    confirm_lock: ConfirmationLock,
    prompt: Option<Box<dyn ConfirmationPrompt>>,
    auto_approve: bool,
    interactive_ui: bool,
    absolute_timeout: Duration,
    line_sink: Option<LineSink>,
    audit: Arc<AuditLogger>,
}

impl ProcessSupervisor {
    /// A supervisor with no confirmation prompt and the default ceiling.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            registry: Arc::new(ProcessRegistry::new(audit.clone())),
            confirm_lock: ConfirmationLock::new(),
            prompt: None,
            auto_approve: false,
            interactive_ui: false,
            absolute_timeout: ABSOLUTE_TIMEOUT,
            line_sink: None,
            audit,
        }
    }

    /// Ask `prompt` before each command.
    pub fn prompt(mut self, prompt: Box<dyn ConfirmationPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Skip confirmation even when a prompt is installed.
    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// A full-screen UI owns the terminal; leave Ctrl-C and Ctrl-X alone.
    pub fn interactive_ui(mut self, interactive_ui: bool) -> Self {
        self.interactive_ui = interactive_ui;
        self
    }

    /// Override the absolute ceiling.
    pub fn absolute_timeout(mut self, timeout: Duration) -> Self {
        self.absolute_timeout = timeout;
        self
    }

    /// Stream output lines to `sink` as they arrive.
    pub fn on_line(mut self, sink: LineSink) -> Self {
        self.line_sink = Some(sink);
        self
    }

    /// The tracked process set.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Confirm and run `request` without sandboxing.
    pub fn run(&self, request: &RunRequest) -> ShellCommandOutput {
        if request.command.trim().is_empty() {
            return empty_command();
        }
        if let Some(refusal) = self.confirmation_refusal(request) {
            return refusal;
        }
        self.execute(
            &request.command,
            &request.command,
            request.cwd.as_deref(),
            request.resolved_env(),
            request.inactivity_timeout,
            self.absolute_timeout,
        )
    }

    /// Confirm, wrap through `orchestrator`, run, and offer an unsandboxed
    /// re-run when the sandboxed run failed in a way the sandbox may cause.
    pub fn run_with_retry(
        &self,
        orchestrator: &SandboxOrchestrator,
        retry: &RetryPolicy,
        request: &RunRequest,
        approve_retry: Option<RetryApproval<'_>>,
    ) -> ShellCommandOutput {
        let command = request.command.as_str();
        if command.trim().is_empty() {
            return empty_command();
        }
        if let Some(refusal) = self.confirmation_refusal(request) {
            return refusal;
        }

        let cwd = match &request.cwd {
            Some(dir) => dir.clone(),
            None => match std::env::current_dir() {
                Ok(dir) => dir,
                Err(e) => {
                    return ShellCommandOutput::failed(
                        command,
                        format!("Cannot determine working directory: {}", e),
                    );
                }
            },
        };
        let env = request.resolved_env();

        let wrapped = match orchestrator.wrap_command(command, &cwd, env.clone()) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                return ShellCommandOutput::failed(command, format!("Sandboxing failed: {}", e));
            }
        };

        let ceiling = self.ceiling(orchestrator.store().max_execution_time());
        let mut output = self.execute(
            command,
            &wrapped.command,
            Some(&cwd),
            wrapped.env,
            request.inactivity_timeout,
            ceiling,
        );
        output.sandboxed = wrapped.sandboxed;

        if !wrapped.sandboxed || output.success || output.timeout || output.user_interrupted {
            return output;
        }
        let Some(exit_code) = output.exit_code else {
            return output;
        };
        if !retry.should_retry_unsandboxed(command, exit_code)
            || !retry.request_unsandboxed_retry(command, exit_code, approve_retry)
        {
            return output;
        }

        info!("Re-running without sandbox: {}", command);
        let mut retried = self.execute(
            command,
            command,
            Some(&cwd),
            env,
            request.inactivity_timeout,
            ceiling,
        );
        retried.retried_unsandboxed = true;
        retried
    }

    /// The absolute ceiling, lowered by a configured execution limit.
    fn ceiling(&self, max_execution_time: Option<NonZeroU32>) -> Duration {
        match max_execution_time {
            Some(secs) => self
                .absolute_timeout
                .min(Duration::from_secs(u64::from(secs.get()))),
            None => self.absolute_timeout,
        }
    }

    /// `None` to proceed, or the failed output to return.
    fn confirmation_refusal(&self, request: &RunRequest) -> Option<ShellCommandOutput> {
        if self.auto_approve {
            return None;
        }
        let prompt = self.prompt.as_ref()?;
        let command = request.command.as_str();

        let _held = match self.confirm_lock.try_acquire() {
            Ok(held) => held,
            Err(e) => return Some(ShellCommandOutput::failed(command, e.to_string())),
        };

        match prompt.confirm(command, request.cwd.as_deref()) {
            Ok(answer) if answer.approved => None,
            Ok(answer) => Some(ShellCommandOutput::rejected(command, answer.feedback)),
            Err(e) => {
                warn!("Confirmation prompt failed: {:#}", e);
                Some(ShellCommandOutput::rejected(command, None))
            }
        }
    }

    /// Spawn `shell_command` and supervise it until it reaches a terminal state.
    ///
    /// `command_line` is the command as the user wrote it; `shell_command` is what
    /// the shell actually runs (possibly wrapped by an isolator).
    fn execute(
        &self,
        command_line: &str,
        shell_command: &str,
        cwd: Option<&Path>,
        env: HashMap<String, String>,
        inactivity: Duration,
        ceiling: Duration,
    ) -> ShellCommandOutput {
        let start = Instant::now();

        let mut cmd = shell(shell_command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(&env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    command: command_line.to_string(),
                    source,
                };
                return ShellCommandOutput::failed(command_line, err.to_string());
            }
        };

        let clock = Arc::new(OutputClock::new(start));
        let stdout = Arc::new(OutputBuffer::new());
        let stderr = Arc::new(OutputBuffer::new());
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().and_then(|pipe| {
                self.spawn_reader(pipe, OutputStream::Stdout, stdout.clone(), clock.clone())
            }),
            child.stderr.take().and_then(|pipe| {
                self.spawn_reader(pipe, OutputStream::Stderr, stderr.clone(), clock.clone())
            }),
        ]
        .into_iter()
        .flatten()
        .collect();

        let handle = Arc::new(ProcessHandle::new(child, command_line));
        let pid = handle.pid();
        debug!("Started pid {}: {}", pid, command_line);

        let registration = self.registry.register(handle.clone());
        let scope = InterruptScope::enter(self.registry.clone(), self.interactive_ui);

        let outcome = loop {
            match handle.try_wait() {
                Ok(Some(status)) => break Outcome::Exited(status),
                Ok(None) => {}
                Err(e) => break Outcome::WaitFailed(e),
            }
            if scope.take_interrupt() {
                warn!("Ctrl-C received, interrupting shell command");
                self.registry.kill_all();
                continue;
            }
            if start.elapsed() >= ceiling {
                break Outcome::TimedOut {
                    limit: ceiling,
                    inactivity: false,
                };
            }
            if clock.idle() >= inactivity {
                break Outcome::TimedOut {
                    limit: inactivity,
                    inactivity: true,
                };
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let exit_status = match &outcome {
            Outcome::Exited(status) => {
                join_readers(readers, READER_JOIN_AFTER_EXIT);
                Some(*status)
            }
            Outcome::TimedOut { .. } => {
                self.audit.log(AuditEvent::ProcessTimeout {
                    pid,
                    command: command_line.to_string(),
                    elapsed_sec: start.elapsed().as_secs(),
                });
                handle.terminate();
                join_readers(readers, READER_JOIN_AFTER_TIMEOUT);
                None
            }
            Outcome::WaitFailed(e) => {
                warn!("Lost track of pid {}: {}", pid, e);
                handle.terminate();
                join_readers(readers, READER_JOIN_AFTER_TIMEOUT);
                None
            }
        };
        drop(scope);
        drop(registration);

        let mut output = ShellCommandOutput {
            command: Some(command_line.to_string()),
            stdout: Some(stdout.render()),
            stderr: Some(stderr.render()),
            exit_code: exit_status.map(exit_code),
            execution_time: Some(start.elapsed().as_secs_f64()),
            ..ShellCommandOutput::default()
        };

        if self.registry.take_user_killed(pid) {
            output.user_interrupted = true;
            output.error = Some("Command interrupted by user".to_string());
            return output;
        }

        match outcome {
            Outcome::Exited(_) => match output.exit_code {
                Some(0) => output.success = true,
                Some(code) => output.error = Some(format!("Command exited with code {}", code)),
                None => output.error = Some("Command exited without a status".to_string()),
            },
            Outcome::TimedOut { limit, inactivity } => {
                warn!("Command timed out after {:?}: {}", limit, command_line);
                output.timeout = true;
                output.exit_code = Some(TIMEOUT_EXIT_CODE);
                output.error = Some(if inactivity {
                    format!(
                        "Command timed out after {} seconds of inactivity",
                        limit.as_secs()
                    )
                } else {
                    format!("Command timed out after {} seconds", limit.as_secs())
                });
            }
            Outcome::WaitFailed(e) => {
                output.error = Some(format!("Failed to wait for command: {}", e));
            }
        }
        output
    }

    fn spawn_reader<R: Read + Send + 'static>(
        &self,
        pipe: R,
        stream: OutputStream,
        buffer: Arc<OutputBuffer>,
        clock: Arc<OutputClock>,
    ) -> Option<JoinHandle<()>> {
        let sink = self.line_sink.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("shellguard-{:?}", stream).to_lowercase())
            .spawn(move || {
                let mut reader = BufReader::new(pipe);
                let mut raw = Vec::new();
                loop {
                    raw.clear();
                    match reader.read_until(b'\n', &mut raw) {
                        Ok(0) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&raw);
                            let line = text.trim_end_matches(['\n', '\r']);
                            buffer.push(line);
                            clock.touch();
                            if let Some(sink) = &sink {
                                sink(stream, line);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("Reading {:?} failed: {}", stream, e);
                            break;
                        }
                    }
                }
            });

        match spawned {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!("Could not start {:?} reader: {}", stream, e);
                None
            }
        }
    }
}

fn empty_command() -> ShellCommandOutput {
    ShellCommandOutput {
        error: Some(SupervisorError::EmptyCommand.to_string()),
        ..ShellCommandOutput::default()
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command).creation_flags(CREATE_NEW_PROCESS_GROUP);
    cmd
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// The parent environment, skipping entries that are not valid UTF-8.
fn inherited_env() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Wait up to `limit` for the readers to drain, then detach the stragglers.
fn join_readers(readers: Vec<JoinHandle<()>>, limit: Duration) {
    let deadline = Instant::now() + limit;
    while readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
        std::thread::sleep(READER_JOIN_POLL);
    }
    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            debug!("Output reader still blocked, detaching");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PolicyStore;
    use crate::sandbox::{Isolator, NoopIsolator};
    use crate::supervisor::{CommandState, Confirmation};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(AuditLogger::new_null())).interactive_ui(true)
    }

    struct FixedPrompt {
        answer: Confirmation,
        asked: AtomicUsize,
    }

    impl FixedPrompt {
        fn boxed(answer: Confirmation) -> Box<Self> {
            Box::new(Self {
                answer,
                asked: AtomicUsize::new(0),
            })
        }
    }

    impl ConfirmationPrompt for FixedPrompt {
        fn confirm(&self, _command: &str, _cwd: Option<&Path>) -> anyhow::Result<Confirmation> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    struct FailingPrompt;

    impl ConfirmationPrompt for FailingPrompt {
        fn confirm(&self, _command: &str, _cwd: Option<&Path>) -> anyhow::Result<Confirmation> {
            anyhow::bail!("terminal closed")
        }
    }

    #[test]
    fn test_successful_command() {
        let out = supervisor().run(&RunRequest::new("echo hello; echo oops >&2"));
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.as_deref(), Some("hello"));
        assert_eq!(out.stderr.as_deref(), Some("oops"));
        assert_eq!(out.state(), CommandState::Completed);
        assert!(out.execution_time.is_some());
    }

    #[test]
    fn test_nonzero_exit() {
        let out = supervisor().run(&RunRequest::new("exit 3"));
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.error.as_deref(), Some("Command exited with code 3"));
        assert_eq!(out.state(), CommandState::Failed);
    }

    #[test]
    fn test_empty_command() {
        let out = supervisor().run(&RunRequest::new("   "));
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("Command cannot be empty"));
    }

    #[test]
    fn test_cwd_and_env() {
        let temp = tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let out = supervisor().run(
            &RunRequest::new("echo $GREETING; pwd")
                .cwd(temp.path())
                .env(env),
        );
        assert!(out.success);
        let stdout = out.stdout.unwrap();
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            temp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_long_lines_truncated() {
        let out = supervisor().run(&RunRequest::new("printf '%0500d\\n' 0"));
        let stdout = out.stdout.unwrap();
        assert!(stdout.ends_with("... [truncated]"));
    }

    #[test]
    fn test_inactivity_timeout() {
        let started = Instant::now();
        let out = supervisor().run(
            &RunRequest::new("sleep 30").inactivity_timeout(Duration::from_millis(300)),
        );
        assert!(out.timeout);
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(out.error.as_deref().unwrap().ends_with("of inactivity"));
        assert_eq!(out.state(), CommandState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_absolute_ceiling_despite_output() {
        let sup = supervisor().absolute_timeout(Duration::from_secs(1));
        let out = sup.run(
            &RunRequest::new("while true; do echo tick; sleep 0.05; done")
                .inactivity_timeout(Duration::from_secs(30)),
        );
        assert!(out.timeout);
        assert_eq!(
            out.error.as_deref(),
            Some("Command timed out after 1 seconds")
        );
        assert!(out.stdout.unwrap().contains("tick"));
    }

    #[test]
    fn test_registry_empty_after_run() {
        let sup = supervisor();
        sup.run(&RunRequest::new("true"));
        sup.run(&RunRequest::new("sleep 30").inactivity_timeout(Duration::from_millis(200)));
        assert_eq!(sup.registry().running_count(), 0);
    }

    #[test]
    fn test_kill_all_interrupts_run() {
        let sup = Arc::new(supervisor());
        let killer = {
            let sup = sup.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    if sup.registry().running_count() > 0 {
                        return sup.registry().kill_all();
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                0
            })
        };

        let out = sup.run(&RunRequest::new("sleep 30"));
        assert_eq!(killer.join().unwrap(), 1);
        assert!(out.user_interrupted);
        assert!(!out.timeout);
        assert_eq!(out.error.as_deref(), Some("Command interrupted by user"));
        assert_eq!(out.state(), CommandState::Killed);
    }

    #[test]
    fn test_line_sink_receives_lines() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: LineSink = {
            let seen = seen.clone();
            Arc::new(move |stream: OutputStream, line: &str| {
                seen.lock().unwrap().push((stream, line.to_string()));
            })
        };
        supervisor().on_line(sink).run(&RunRequest::new("echo one; echo two >&2"));

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(OutputStream::Stdout, "one".to_string())));
        assert!(seen.contains(&(OutputStream::Stderr, "two".to_string())));
    }

    #[test]
    fn test_rejection_with_feedback() {
        let sup = supervisor().prompt(FixedPrompt::boxed(Confirmation::reject(Some(
            "try dry-run first".into(),
        ))));
        let out = sup.run(&RunRequest::new("rm -rf build"));
        assert!(!out.success);
        assert_eq!(out.user_feedback.as_deref(), Some("try dry-run first"));
        assert_eq!(out.error.as_deref(), Some("USER REJECTED: try dry-run first"));
        assert!(out.stdout.is_none());
    }

    #[test]
    fn test_auto_approve_skips_prompt() {
        let prompt = FixedPrompt::boxed(Confirmation::reject(None));
        let sup = supervisor().prompt(prompt).auto_approve(true);
        assert!(sup.run(&RunRequest::new("true")).success);
    }

    #[test]
    fn test_prompt_error_rejects() {
        let sup = supervisor().prompt(Box::new(FailingPrompt));
        let out = sup.run(&RunRequest::new("true"));
        assert_eq!(out.error.as_deref(), Some("User rejected the command!"));
    }

    #[test]
    fn test_confirmation_busy() {
        let sup = supervisor().prompt(FixedPrompt::boxed(Confirmation::approve()));
        let _held = sup.confirm_lock.try_acquire().unwrap();

        let out = sup.run(&RunRequest::new("true"));
        assert_eq!(
            out.error.as_deref(),
            Some("Another command is currently awaiting confirmation")
        );
    }

    #[test]
    fn test_ceiling_lowered_by_policy() {
        let sup = supervisor();
        assert_eq!(sup.ceiling(None), ABSOLUTE_TIMEOUT);
        assert_eq!(
            sup.ceiling(NonZeroU32::new(30)),
            Duration::from_secs(30)
        );
        assert_eq!(sup.ceiling(NonZeroU32::new(10_000)), ABSOLUTE_TIMEOUT);
    }

    fn orchestrator(dir: &Path) -> SandboxOrchestrator {
        let store = Arc::new(PolicyStore::with_path(dir.join("sandbox_config.json")));
        SandboxOrchestrator::new(store, Arc::new(AuditLogger::new_null()))
            .with_isolator(Isolator::Noop(NoopIsolator))
    }

    #[test]
    fn test_run_with_retry_passthrough_when_disabled() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path());
        let retry = RetryPolicy::new(orch.store().clone(), orch.audit().clone());
        let asked = AtomicUsize::new(0);
        let approve = |_: &str| -> anyhow::Result<bool> {
            asked.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        };

        let out = supervisor().run_with_retry(
            &orch,
            &retry,
            &RunRequest::new("exit 1").cwd(temp.path()),
            Some(&approve),
        );
        assert!(!out.sandboxed);
        assert!(!out.retried_unsandboxed);
        assert_eq!(out.exit_code, Some(1));
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_with_retry_strict_failure() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path()).strict(true);
        orch.store().set_enabled(true).unwrap();
        let retry = RetryPolicy::new(orch.store().clone(), orch.audit().clone());

        let out = supervisor().run_with_retry(
            &orch,
            &retry,
            &RunRequest::new("echo hi").cwd(temp.path()),
            None,
        );
        assert!(!out.success);
        assert!(out.error.as_deref().unwrap().starts_with("Sandboxing failed"));
        assert!(out.stdout.is_none());
    }

    #[test]
    fn test_run_with_retry_uses_policy_execution_limit() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path());
        orch.store().set_max_execution_time(NonZeroU32::new(1)).unwrap();
        let retry = RetryPolicy::new(orch.store().clone(), orch.audit().clone());

        let out = supervisor().run_with_retry(
            &orch,
            &retry,
            &RunRequest::new("while true; do echo x; sleep 0.05; done").cwd(temp.path()),
            None,
        );
        assert!(out.timeout);
        assert_eq!(
            out.error.as_deref(),
            Some("Command timed out after 1 seconds")
        );
    }
}
