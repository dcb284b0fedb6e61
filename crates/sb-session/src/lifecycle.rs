//! Shutdown coordination.
//!
//! The supervisor registers whichever shell is currently live. Signal
//! handlers and the supervisor's own unwind path both funnel into
//! [`LifecycleController::cleanup`], which runs its teardown exactly once.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::io::NonBlockingGuard;
use crate::lock_or_recover;
use crate::pty::{PtyChannel, ShellProcess, TerminateOutcome};

/// Shared handles to the shell and PTY of the active session.
#[derive(Debug, Clone)]
pub struct LiveShell {
    pub shell: Arc<Mutex<ShellProcess>>,
    pub pty: Arc<Mutex<PtyChannel>>,
}

impl LiveShell {
    pub fn new(shell: ShellProcess, pty: PtyChannel) -> Self {
        Self {
            shell: Arc::new(Mutex::new(shell)),
            pty: Arc::new(Mutex::new(pty)),
        }
    }

    pub fn pid(&self) -> u32 {
        lock_or_recover(&self.shell, "shell").pid()
    }

    /// Tear down this shell's process group and close its PTY.
    pub fn terminate(&self, grace: Duration) -> TerminateOutcome {
        let outcome = lock_or_recover(&self.shell, "shell").terminate_group(grace);
        lock_or_recover(&self.pty, "pty").close();
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Teardown ran now. Carries the shell outcome if a shell was live.
    Performed(Option<TerminateOutcome>),
    /// An earlier call already ran it.
    AlreadyDone,
}

#[derive(Debug)]
pub struct LifecycleController {
    live: Mutex<Option<LiveShell>>,
    input_guard: Mutex<Option<NonBlockingGuard>>,
    stop_requested: AtomicBool,
    /// Held for the whole teardown so concurrent callers wait for it.
    cleanup_done: Mutex<bool>,
    kill_grace: Duration,
}

impl LifecycleController {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            live: Mutex::new(None),
            input_guard: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            cleanup_done: Mutex::new(false),
            kill_grace,
        }
    }

    /// Make `live` the shell that cleanup will tear down.
    ///
    /// Refused once a stop has been requested; the shell is handed back so
    /// the caller can dispose of it.
    pub fn register(&self, live: LiveShell) -> Result<(), LiveShell> {
        let mut slot = lock_or_recover(&self.live, "live shell");
        if self.stop_requested() {
            return Err(live);
        }
        if slot.is_some() {
            warn!("replacing a live shell that was never released");
        }
        *slot = Some(live);
        Ok(())
    }

    /// Forget the current shell (it exited on its own).
    pub fn release(&self) -> Option<LiveShell> {
        lock_or_recover(&self.live, "live shell").take()
    }

    /// Remember the input descriptor's original flags for cleanup.
    pub fn attach_input_guard(&self, guard: NonBlockingGuard) {
        *lock_or_recover(&self.input_guard, "input guard") = Some(guard);
    }

    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!("stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_cleaned(&self) -> bool {
        *lock_or_recover(&self.cleanup_done, "cleanup flag")
    }

    /// Terminate the live shell's process group, close its PTY and restore
    /// the input descriptor. Runs at most once.
    pub fn cleanup(&self) -> CleanupOutcome {
        let mut done = lock_or_recover(&self.cleanup_done, "cleanup flag");
        if *done {
            return CleanupOutcome::AlreadyDone;
        }
        // Set before taking the slot so a racing register() is refused.
        self.stop_requested.store(true, Ordering::SeqCst);

        let live = lock_or_recover(&self.live, "live shell").take();
        let outcome = live.map(|live| live.terminate(self.kill_grace));

        if let Some(mut guard) = lock_or_recover(&self.input_guard, "input guard").take() {
            guard.restore();
        }

        *done = true;
        info!(?outcome, "session cleaned up");
        CleanupOutcome::Performed(outcome)
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    Hangup,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Hangup => "SIGHUP",
        };
        f.write_str(label)
    }
}

/// Register SIGTERM, SIGINT and SIGHUP handlers.
///
/// Registration happens immediately, so signals delivered after this returns
/// are not lost. The returned future resolves after the first one arrives
/// and cleanup has finished. Must be called inside a Tokio runtime.
pub fn install_signal_handlers(
    controller: Arc<LifecycleController>,
) -> io::Result<impl Future<Output = ShutdownSignal> + Send> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(async move {
        let received = tokio::select! {
            _ = terminate.recv() => ShutdownSignal::Terminate,
            _ = interrupt.recv() => ShutdownSignal::Interrupt,
            _ = hangup.recv() => ShutdownSignal::Hangup,
        };
        info!(signal = %received, "shutdown signal received");
        controller.request_stop();

        let worker = Arc::clone(&controller);
        match tokio::task::spawn_blocking(move || worker.cleanup()).await {
            Ok(outcome) => debug!(?outcome, "signal cleanup finished"),
            Err(e) => warn!(error = %e, "signal cleanup task failed"),
        }
        received
    })
}
