//! Captured output and the terminal result of a supervised command.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest line kept verbatim; longer lines are cut.
pub const MAX_LINE_LENGTH: usize = 256;

/// Number of trailing lines retained per stream.
pub const MAX_OUTPUT_LINES: usize = 256;

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Cut `line` to [`MAX_LINE_LENGTH`] characters, marking the cut.
pub fn truncate_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_LENGTH) {
        Some((cut, _)) => format!("{}{}", &line[..cut], TRUNCATION_MARKER),
        None => line.to_string(),
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Bounded line buffer filled by a reader thread.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    lines: Mutex<VecDeque<String>>,
}

impl OutputBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, dropping the oldest once the cap is reached.
    pub fn push(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == MAX_OUTPUT_LINES {
            lines.pop_front();
        }
        lines.push_back(truncate_line(line));
    }

    /// Number of retained lines.
    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained lines joined with `\n`, re-truncated.
    pub fn render(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(MAX_OUTPUT_LINES);
        lines
            .iter()
            .skip(skip)
            .map(|l| truncate_line(l))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Time of the most recent output line, relative to process start.
///
/// Written by the reader threads, read by the polling loop.
#[derive(Debug)]
pub struct OutputClock {
    start: Instant,
    last_output_ms: AtomicU64,
}

impl OutputClock {
    /// Start the clock at `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            last_output_ms: AtomicU64::new(0),
        }
    }

    /// Record output now.
    pub fn touch(&self) {
        let ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_output_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Time since the last recorded output (or since start).
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_output_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Terminal state of a supervised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Exited with status 0.
    Completed,
    /// Killed after a timeout.
    TimedOut,
    /// Killed on user request.
    Killed,
    /// Rejected, failed to start, or exited non-zero.
    Failed,
}

/// Result of a supervised command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShellCommandOutput {
    /// Exit status 0 and no timeout or interruption.
    pub success: bool,
    /// The command as the caller wrote it.
    pub command: Option<String>,
    /// Human-readable failure reason.
    pub error: Option<String>,
    /// Last retained stdout lines.
    pub stdout: Option<String>,
    /// Last retained stderr lines.
    pub stderr: Option<String>,
    /// Exit code; `-9` after a forced timeout kill.
    pub exit_code: Option<i32>,
    /// Wall-clock seconds.
    pub execution_time: Option<f64>,
    /// Killed after an inactivity or absolute timeout.
    pub timeout: bool,
    /// Killed on user request.
    pub user_interrupted: bool,
    /// Free-text feedback given when the command was rejected.
    pub user_feedback: Option<String>,
    /// Ran inside an isolator.
    pub sandboxed: bool,
    /// Result of an approved unsandboxed re-run.
    pub retried_unsandboxed: bool,
}

impl ShellCommandOutput {
    /// A failure that never reached the running state.
    pub fn failed(command: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            command: Some(command.to_string()),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// A rejection at the confirmation step.
    pub fn rejected(command: &str, feedback: Option<String>) -> Self {
        let feedback = feedback.filter(|f| !f.trim().is_empty());
        let error = match &feedback {
            Some(text) => format!("USER REJECTED: {}", text),
            None => "User rejected the command!".to_string(),
        };
        Self {
            user_feedback: feedback,
            ..Self::failed(command, error)
        }
    }

    /// The terminal state this output represents.
    pub fn state(&self) -> CommandState {
        if self.user_interrupted {
            CommandState::Killed
        } else if self.timeout {
            CommandState::TimedOut
        } else if self.success {
            CommandState::Completed
        } else {
            CommandState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_line() {
        assert_eq!(truncate_line("hello"), "hello");
        let exact = "a".repeat(MAX_LINE_LENGTH);
        assert_eq!(truncate_line(&exact), exact);
    }

    #[test]
    fn test_truncate_long_line() {
        let long = "b".repeat(MAX_LINE_LENGTH + 10);
        let cut = truncate_line(&long);
        assert!(cut.ends_with("... [truncated]"));
        assert_eq!(cut.len(), MAX_LINE_LENGTH + "... [truncated]".len());
    }

    #[test]
    fn test_truncate_multibyte() {
        let long = "é".repeat(MAX_LINE_LENGTH + 1);
        let cut = truncate_line(&long);
        assert_eq!(
            cut.trim_end_matches("... [truncated]").chars().count(),
            MAX_LINE_LENGTH
        );
    }

    #[test]
    fn test_buffer_keeps_last_lines() {
        let buffer = OutputBuffer::new();
        for i in 0..(MAX_OUTPUT_LINES + 44) {
            buffer.push(&format!("line {}", i));
        }
        assert_eq!(buffer.len(), MAX_OUTPUT_LINES);

        let rendered = buffer.render();
        assert!(rendered.starts_with("line 44\n"));
        assert!(rendered.ends_with(&format!("line {}", MAX_OUTPUT_LINES + 43)));
    }

    #[test]
    fn test_buffer_truncates_on_push() {
        let buffer = OutputBuffer::new();
        buffer.push(&"x".repeat(1000));
        assert!(buffer.render().ends_with("... [truncated]"));
    }

    #[test]
    fn test_clock_idle_resets_on_touch() {
        let clock = OutputClock::new(Instant::now() - Duration::from_secs(5));
        assert!(clock.idle() >= Duration::from_secs(5));
        clock.touch();
        assert!(clock.idle() < Duration::from_secs(1));
    }

    #[test]
    fn test_rejected_with_feedback() {
        let out = ShellCommandOutput::rejected("rm -rf build", Some("use make clean".into()));
        assert!(!out.success);
        assert_eq!(out.user_feedback.as_deref(), Some("use make clean"));
        assert_eq!(out.error.as_deref(), Some("USER REJECTED: use make clean"));
        assert_eq!(out.state(), CommandState::Failed);
    }

    #[test]
    fn test_rejected_without_feedback() {
        let out = ShellCommandOutput::rejected("rm -rf build", Some("  ".into()));
        assert!(out.user_feedback.is_none());
        assert_eq!(out.error.as_deref(), Some("User rejected the command!"));
    }

    #[test]
    fn test_state_precedence() {
        let mut out = ShellCommandOutput {
            timeout: true,
            ..ShellCommandOutput::default()
        };
        assert_eq!(out.state(), CommandState::TimedOut);
        out.user_interrupted = true;
        assert_eq!(out.state(), CommandState::Killed);

        let ok = ShellCommandOutput {
            success: true,
            ..ShellCommandOutput::default()
        };
        assert_eq!(ok.state(), CommandState::Completed);
    }

    #[test]
    fn test_serializes_fields() {
        let out = ShellCommandOutput::failed("ls", "boom");
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"error\":\"boom\""));
        assert!(json.contains("\"user_interrupted\":false"));
    }
}
