//! Top-level session loop: spawn a shell, relay until it exits, then either
//! restart it or unwind.

use std::io::{self, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sb_core::config::{BridgeConfig, ConfigError, SessionConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::io::{InputChannel, NonBlockingGuard};
use crate::lifecycle::{LifecycleController, LiveShell};
use crate::lock_or_recover;
use crate::multiplexer::{IoMultiplexer, LoopExit, MultiplexerSettings, Session};
use crate::probe::ProcessTreeProbe;
use crate::pty::{PtyChannel, PtyError, ShellLaunch};
use crate::state_machine::{SessionEvent, SessionState, SessionStateMachine, StateMachineError};

/// Written before every automatic restart.
pub const RESTART_NOTICE: &str = "\r\n[Shell terminated. Restarting...]\r\n";

/// Written when the restart limit stops the loop.
pub const FINAL_NOTICE: &str = "\r\n[Shell terminated.]\r\n";

const BACKOFF_SLICE: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("shell startup failed: {0}")]
    Pty(#[from] PtyError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// One shell from spawn to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLifetime {
    pub pid: u32,
    pub program: String,
    /// `None` if the shell could not be reaped.
    pub exit_code: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop was requested (signal or caller).
    Cancelled,
    /// The output channel closed.
    HostGone,
    /// `restart.max_restarts` was reached.
    RestartLimit,
}

// ---------------------------------------------------------------------------
// SessionSupervisor
// ---------------------------------------------------------------------------

pub struct SessionSupervisor<W: Write> {
    session: SessionConfig,
    config: BridgeConfig,
    settings: MultiplexerSettings,
    lifecycle: Arc<LifecycleController>,
    input: InputChannel,
    output: W,
    probe: ProcessTreeProbe,
    machine: SessionStateMachine,
    lifetimes: Vec<ShellLifetime>,
}

impl<W: Write> SessionSupervisor<W> {
    pub fn new(
        session: SessionConfig,
        config: BridgeConfig,
        lifecycle: Arc<LifecycleController>,
        input: InputChannel,
        output: W,
    ) -> Result<Self> {
        session.validate()?;
        config.validate()?;
        Ok(Self {
            settings: MultiplexerSettings::from_config(&config),
            probe: ProcessTreeProbe::from_config(&config.probe),
            session,
            config,
            lifecycle,
            input,
            output,
            machine: SessionStateMachine::new(),
            lifetimes: Vec::new(),
        })
    }

    /// Replace the process-tree probe.
    pub fn with_probe(mut self, probe: ProcessTreeProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Every shell started so far, oldest first.
    pub fn lifetimes(&self) -> &[ShellLifetime] {
        &self.lifetimes
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Run shells until stopped. Returns `Err` only if no shell could be
    /// started or the session state machine was driven out of order.
    pub fn run(&mut self) -> Result<StopReason> {
        match NonBlockingGuard::set(self.input.as_fd()) {
            Ok(guard) => self.lifecycle.attach_input_guard(guard),
            Err(e) => warn!(error = %e, "input channel left in blocking mode"),
        }

        let mut restarts: u32 = 0;
        loop {
            let live = match self.start_shell() {
                Ok(live) => live,
                Err(e) => {
                    warn!(error = %e, "no shell could be started");
                    self.machine.transition(SessionEvent::Fail)?;
                    self.lifecycle.cleanup();
                    return Err(e);
                }
            };

            if let Err(live) = self.lifecycle.register(live.clone()) {
                info!(pid = live.pid(), "stop requested while starting, discarding shell");
                live.terminate(self.lifecycle_grace());
                self.record(&live);
                self.machine.transition(SessionEvent::Stop)?;
                return self.finish(StopReason::Cancelled);
            }
            self.machine.transition(SessionEvent::Spawned)?;

            let mut session = Session::new(
                live.clone(),
                &self.settings,
                self.session.startup_commands.clone(),
                Instant::now(),
            );
            let exit = IoMultiplexer::new(
                &self.settings,
                &mut self.input,
                &mut self.output,
                &self.probe,
                &self.lifecycle,
            )
            .run(&mut session);
            drop(session);

            let code = match exit {
                LoopExit::ShellExited(code) => code,
                LoopExit::Cancelled | LoopExit::HostGone => {
                    let reason = if exit == LoopExit::HostGone {
                        StopReason::HostGone
                    } else {
                        StopReason::Cancelled
                    };
                    self.machine.transition(SessionEvent::Stop)?;
                    let result = self.finish(reason);
                    self.record(&live);
                    return result;
                }
            };

            self.lifecycle.release();
            // Clears out background jobs left in the old group and closes
            // the old PTY before a new one is opened.
            live.terminate(Duration::ZERO);
            self.record(&live);
            self.machine.transition(SessionEvent::ShellExited)?;

            if self.lifecycle.stop_requested() {
                self.machine.transition(SessionEvent::Stop)?;
                return self.finish(StopReason::Cancelled);
            }

            if self
                .config
                .restart
                .max_restarts
                .is_some_and(|max| restarts >= max)
            {
                info!(restarts, code, "restart limit reached");
                self.notify(FINAL_NOTICE);
                self.machine.transition(SessionEvent::Stop)?;
                return self.finish(StopReason::RestartLimit);
            }

            info!(code, restarts, "shell terminated, restarting");
            if !self.notify(RESTART_NOTICE) {
                self.machine.transition(SessionEvent::Stop)?;
                return self.finish(StopReason::HostGone);
            }
            if !self.backoff() {
                self.machine.transition(SessionEvent::Stop)?;
                return self.finish(StopReason::Cancelled);
            }
            restarts += 1;
            self.machine.transition(SessionEvent::Respawn)?;
        }
    }

    fn start_shell(&self) -> Result<LiveShell> {
        let mut pty = PtyChannel::open(self.session.size)?;
        let launch = ShellLaunch {
            candidates: self
                .config
                .shell
                .candidates()
                .into_iter()
                .map(str::to_string)
                .collect(),
            args: self.config.shell.args.clone(),
            working_dir: self.session.working_dir.clone(),
            term: self.config.shell.term.clone(),
            env: self.config.shell.env.clone(),
        };
        let mut shell = pty.spawn_shell(&launch)?;
        if let Err(e) = pty.set_nonblocking() {
            shell.terminate_group(self.lifecycle_grace());
            pty.close();
            return Err(e.into());
        }
        Ok(LiveShell::new(shell, pty))
    }

    fn lifecycle_grace(&self) -> Duration {
        self.config.timing.kill_grace()
    }

    fn record(&mut self, live: &LiveShell) {
        let mut shell = lock_or_recover(&live.shell, "shell");
        self.lifetimes.push(ShellLifetime {
            pid: shell.pid(),
            program: shell.program().to_string(),
            exit_code: shell.try_wait(),
        });
    }

    /// Write a notice to the host. `false` if the host is gone.
    fn notify(&mut self, text: &str) -> bool {
        match self
            .output
            .write_all(text.as_bytes())
            .and_then(|()| self.output.flush())
        {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => false,
            Err(e) => {
                debug!(error = %e, "notice not delivered");
                true
            }
        }
    }

    /// Sleep out the restart backoff. `false` if a stop arrives meanwhile.
    fn backoff(&self) -> bool {
        let deadline = Instant::now() + self.config.timing.restart_backoff();
        loop {
            if self.lifecycle.stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(BACKOFF_SLICE.min(deadline - now));
        }
    }

    fn finish(&mut self, reason: StopReason) -> Result<StopReason> {
        let outcome = self.lifecycle.cleanup();
        debug!(?outcome, ?reason, "supervisor unwinding");
        self.machine.transition(SessionEvent::CleanedUp)?;
        info!(?reason, "session stopped");
        Ok(reason)
    }
}
