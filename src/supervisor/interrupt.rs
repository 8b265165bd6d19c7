//! Interrupt handling while a supervised command runs.
//!
//! Two cancellation paths stop only the running shell commands and leave
//! the surrounding session alone:
//!
//! - **Ctrl-C**: the process-wide `SIGINT` action is swapped for one that sets
//!   a flag, which the supervisor's polling loop picks up. The previous
//!   action is put back when the last [`InterruptScope`] is dropped.
//! - **Ctrl-X**: a background thread puts the terminal in raw mode and kills
//!   every tracked command when it reads the key.
//!
//! Raw mode stops the terminal from turning Ctrl-C into a signal, so the
//! listener also treats a Ctrl-C key press as a kill. That is the only Ctrl-C
//! path on Windows, where no signal action is swapped; a console without a
//! TTY on stdin there keeps the host's default Ctrl-C behaviour.
//!
//! Both are skipped when a full-screen UI owns the terminal. The key
//! listener additionally requires stdin to be a TTY.

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::{debug, warn};

use super::registry::ProcessRegistry;

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(50);

static SIGINT_PENDING: AtomicBool = AtomicBool::new(false);

/// Scoped ownership of interrupt handling for the duration of a command.
///
/// Dropping the scope stops the key listener and restores `SIGINT`.
pub struct InterruptScope {
    // Declared first so the listener stops before SIGINT is restored.
    listener: Option<KeyListener>,
    sigint: Option<SigintGuard>,
}

impl InterruptScope {
    /// Take over interrupts unless a full-screen UI is active.
    pub fn enter(registry: Arc<ProcessRegistry>, interactive_ui: bool) -> Self {
        if interactive_ui {
            return Self::inactive();
        }
        let sigint = SigintGuard::install();
        let listener = if std::io::stdin().is_terminal() {
            KeyListener::spawn(registry)
        } else {
            None
        };
        Self { listener, sigint }
    }

    /// A scope that does nothing.
    pub fn inactive() -> Self {
        Self {
            listener: None,
            sigint: None,
        }
    }

    /// Consume a pending Ctrl-C, if one arrived.
    pub fn take_interrupt(&self) -> bool {
        self.sigint.is_some() && SIGINT_PENDING.swap(false, Ordering::SeqCst)
    }
}

#[cfg(unix)]
mod sigint {
    use super::SIGINT_PENDING;
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
    use std::sync::atomic::Ordering;
    use std::sync::{Mutex, PoisonError};
    use tracing::warn;

    struct SigintState {
        depth: usize,
        previous: Option<SigAction>,
    }

    static SIGINT_STATE: Mutex<SigintState> = Mutex::new(SigintState {
        depth: 0,
        previous: None,
    });

    extern "C" fn on_sigint(_: libc::c_int) {
        SIGINT_PENDING.store(true, Ordering::SeqCst);
    }

    /// Holds the swapped `SIGINT` action. Nested guards share one swap.
    pub(super) struct SigintGuard;

    impl SigintGuard {
        pub(super) fn install() -> Option<Self> {
            let mut state = SIGINT_STATE.lock().unwrap_or_else(PoisonError::into_inner);
            if state.depth == 0 {
                SIGINT_PENDING.store(false, Ordering::SeqCst);
                let action = SigAction::new(
                    SigHandler::Handler(on_sigint),
                    SaFlags::SA_RESTART,
                    SigSet::empty(),
                );
                // SAFETY: the handler only stores to an atomic.
                match unsafe { sigaction(Signal::SIGINT, &action) } {
                    Ok(previous) => state.previous = Some(previous),
                    Err(e) => {
                        warn!("Could not take over SIGINT: {}", e);
                        return None;
                    }
                }
            }
            state.depth += 1;
            Some(SigintGuard)
        }
    }

    impl Drop for SigintGuard {
        fn drop(&mut self) {
            let mut state = SIGINT_STATE.lock().unwrap_or_else(PoisonError::into_inner);
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0
                && let Some(previous) = state.previous.take()
            {
                // SAFETY: restores the action that was in place before install.
                if let Err(e) = unsafe { sigaction(Signal::SIGINT, &previous) } {
                    warn!("Could not restore SIGINT handler: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod sigint {
    /// Console Ctrl-C is left to the host on this platform.
    pub(super) struct SigintGuard;

    impl SigintGuard {
        pub(super) fn install() -> Option<Self> {
            None
        }
    }
}

use sigint::SigintGuard;

/// Background key reader.
struct KeyListener {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl KeyListener {
    fn spawn(registry: Arc<ProcessRegistry>) -> Option<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let spawned = std::thread::Builder::new()
            .name("shellguard-keys".to_string())
            .spawn(move || {
                let on_interrupt = |key: char| {
                    warn!("Ctrl-{} detected, interrupting shell command", key.to_ascii_uppercase());
                    registry.kill_all();
                };
                if let Err(e) = listen_for_keys(&flag, on_interrupt) {
                    debug!("Key listener stopped: {}", e);
                }
            });

        match spawned {
            Ok(thread) => Some(Self {
                stop,
                thread: Some(thread),
            }),
            Err(e) => {
                warn!("Could not start key listener: {}", e);
                None
            }
        }
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The letter of a Ctrl-X or Ctrl-C press, if `key` is one.
fn interrupt_key(key: &KeyEvent) -> Option<char> {
    if key.kind != KeyEventKind::Press || !key.modifiers.contains(KeyModifiers::CONTROL) {
        return None;
    }
    match key.code {
        KeyCode::Char(c @ ('x' | 'X' | 'c' | 'C')) => Some(c.to_ascii_lowercase()),
        _ => None,
    }
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Could not restore terminal mode: {}", e);
        }
    }
}

fn listen_for_keys(stop: &AtomicBool, on_interrupt: impl Fn(char)) -> std::io::Result<()> {
    terminal::enable_raw_mode()?;
    let _raw = RawModeGuard;

    while !stop.load(Ordering::SeqCst) {
        if !event::poll(KEY_POLL_INTERVAL)? {
            continue;
        }
        if let Event::Key(key) = event::read()?
            && let Some(c) = interrupt_key(&key)
        {
            on_interrupt(c);
        }
    }
    Ok(())
}
