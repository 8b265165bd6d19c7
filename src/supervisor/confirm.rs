//! Interactive confirmation before a command runs.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, TryLockError};

use super::SupervisorError;

/// Outcome of asking the user about a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// Whether the command may run.
    pub approved: bool,
    /// Free text the user gave instead of a plain yes or no.
    pub feedback: Option<String>,
}

impl Confirmation {
    /// Plain approval.
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
        }
    }

    /// Rejection, optionally explaining what to do instead.
    pub fn reject(feedback: Option<String>) -> Self {
        Self {
            approved: false,
            feedback,
        }
    }

    /// Interpret one line typed at the prompt.
    ///
    /// `y`/`yes` approve, empty or `n`/`no` reject, anything else rejects
    /// and is passed on as feedback.
    pub fn from_answer(answer: &str) -> Self {
        let trimmed = answer.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "y" | "yes" => Self::approve(),
            "" | "n" | "no" => Self::reject(None),
            _ => Self::reject(Some(trimmed.to_string())),
        }
    }
}

/// Asks whether a command may run.
pub trait ConfirmationPrompt: Send + Sync {
    /// Ask about `command`, to be run in `cwd`.
    fn confirm(&self, command: &str, cwd: Option<&Path>) -> anyhow::Result<Confirmation>;
}

/// Prompts on stderr and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl StdinPrompt {
    fn ask(
        &self,
        command: &str,
        cwd: Option<&Path>,
        input: &mut impl BufRead,
        output: &mut impl Write,
    ) -> anyhow::Result<Confirmation> {
        match cwd {
            Some(dir) => writeln!(output, "\nCommand: {}\n  in {}", command, dir.display())?,
            None => writeln!(output, "\nCommand: {}", command)?,
        }
        write!(output, "Run it? [y/N, or type feedback]: ")?;
        output.flush()?;

        let mut answer = String::new();
        input.read_line(&mut answer)?;
        Ok(Confirmation::from_answer(&answer))
    }
}

impl ConfirmationPrompt for StdinPrompt {
    fn confirm(&self, command: &str, cwd: Option<&Path>) -> anyhow::Result<Confirmation> {
        let stdin = std::io::stdin();
        let stderr = std::io::stderr();
        self.ask(command, cwd, &mut stdin.lock(), &mut stderr.lock())
    }
}

/// Lets at most one command await confirmation at a time.
#[derive(Debug, Default)]
pub struct ConfirmationLock {
    inner: Mutex<()>,
}

impl ConfirmationLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_acquire(&self) -> Result<MutexGuard<'_, ()>, SupervisorError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(SupervisorError::ConfirmationBusy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_answers() {
        assert!(Confirmation::from_answer("y\n").approved);
        assert!(Confirmation::from_answer(" YES ").approved);
        assert_eq!(Confirmation::from_answer("\n"), Confirmation::reject(None));
        assert_eq!(Confirmation::from_answer("no"), Confirmation::reject(None));
        assert_eq!(
            Confirmation::from_answer("use cargo check instead\n"),
            Confirmation::reject(Some("use cargo check instead".to_string()))
        );
    }

    #[test]
    fn test_stdin_prompt_reads_answer() {
        let mut input = Cursor::new(b"yes\n".to_vec());
        let mut output = Vec::new();
        let answer = StdinPrompt
            .ask("make test", Some(Path::new("/work")), &mut input, &mut output)
            .unwrap();

        assert!(answer.approved);
        let shown = String::from_utf8(output).unwrap();
        assert!(shown.contains("make test"));
        assert!(shown.contains("/work"));
    }

    #[test]
    fn test_stdin_prompt_eof_rejects() {
        let mut input = Cursor::new(Vec::new());
        let answer = StdinPrompt
            .ask("ls", None, &mut input, &mut std::io::sink())
            .unwrap();
        assert!(!answer.approved);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let lock = ConfirmationLock::new();
        let held = lock.try_acquire().unwrap();
        assert!(matches!(
            lock.try_acquire(),
            Err(SupervisorError::ConfirmationBusy)
        ));
        drop(held);
        assert!(lock.try_acquire().is_ok());
    }
}
