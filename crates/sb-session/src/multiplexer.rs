//! The per-shell event loop.
//!
//! One thread, one readiness wait per tick. Each tick checks for shell exit,
//! runs whatever timed work is due (startup commands, agent probe,
//! foreground check, held-text release), then waits on the input channel
//! and the PTY master until the nearest deadline.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use sb_core::config::BridgeConfig;
use sb_core::types::{AgentStatus, StatusEvent};
use tracing::{debug, info, warn};

use crate::decoder::{DecoderOutput, InputDecoder};
use crate::io::{wait_readable, InputChannel};
use crate::lifecycle::{LifecycleController, LiveShell};
use crate::lock_or_recover;
use crate::probe::ProcessTreeProbe;
use crate::reporter;

const READ_BUF_SIZE: usize = 8192;

/// Reads taken from the PTY after the shell exits, to flush its last output.
const DRAIN_LIMIT: usize = 64;

/// The output channel reported a broken pipe.
#[derive(Debug)]
struct HostGone;

/// Why [`IoMultiplexer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shell exited with this code.
    ShellExited(u32),
    /// A stop was requested through the lifecycle controller.
    Cancelled,
    /// The output channel is gone.
    HostGone,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MultiplexerSettings {
    pub poll_timeout: Duration,
    pub startup_delay: Duration,
    pub startup_command_gap: Duration,
    pub probe_interval: Duration,
    pub force_cooldown: Duration,
    pub foreground_interval: Duration,
    pub report_foreground: bool,
    pub escape_hold: Duration,
}

impl MultiplexerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            poll_timeout: config.timing.poll_timeout(),
            startup_delay: config.timing.startup_delay(),
            startup_command_gap: config.timing.startup_command_gap(),
            probe_interval: config.probe.interval(),
            force_cooldown: config.probe.force_cooldown(),
            foreground_interval: config.probe.foreground_interval(),
            report_foreground: config.probe.report_foreground,
            escape_hold: config.timing.escape_hold(),
        }
    }
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

// ---------------------------------------------------------------------------
// StartupInjector
// ---------------------------------------------------------------------------

/// Releases the startup commands one at a time: the first after the boot
/// delay, then one per gap.
#[derive(Debug, Clone)]
pub struct StartupInjector {
    commands: Vec<String>,
    next: usize,
    due: Option<Instant>,
    gap: Duration,
}

impl StartupInjector {
    pub fn new(commands: Vec<String>, spawned_at: Instant, delay: Duration, gap: Duration) -> Self {
        let due = (!commands.is_empty()).then(|| spawned_at + delay);
        Self {
            commands,
            next: 0,
            due,
            gap,
        }
    }

    /// The next command if it is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        let due = self.due?;
        if now < due {
            return None;
        }
        let command = self.commands.get(self.next)?.clone();
        self.next += 1;
        self.due = (self.next < self.commands.len()).then(|| now + self.gap);
        Some(command)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.due
    }

    pub fn is_done(&self) -> bool {
        self.due.is_none()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-lifetime state of one shell. Built fresh on every (re)start.
#[derive(Debug)]
pub struct Session {
    live: LiveShell,
    pid: u32,
    decoder: InputDecoder,
    agent_status: AgentStatus,
    foreground: Option<String>,
    next_probe: Instant,
    next_foreground: Instant,
    startup: StartupInjector,
    input_open: bool,
    pty_open: bool,
}

impl Session {
    pub fn new(
        live: LiveShell,
        settings: &MultiplexerSettings,
        startup_commands: Vec<String>,
        spawned_at: Instant,
    ) -> Self {
        let pid = live.pid();
        Self {
            live,
            pid,
            decoder: InputDecoder::new(settings.force_cooldown, settings.escape_hold),
            agent_status: AgentStatus::inactive(),
            foreground: None,
            next_probe: spawned_at,
            next_foreground: spawned_at,
            startup: StartupInjector::new(
                startup_commands,
                spawned_at,
                settings.startup_delay,
                settings.startup_command_gap,
            ),
            input_open: true,
            pty_open: true,
        }
    }

    fn exit_code(&self) -> Option<u32> {
        lock_or_recover(&self.live.shell, "shell").try_wait()
    }

    fn write_to_pty(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Err(e) = lock_or_recover(&self.live.pty, "pty").write_all(data) {
            debug!(pid = self.pid, error = %e, "pty write failed");
        }
    }

    fn next_deadline(&self, settings: &MultiplexerSettings) -> Instant {
        let mut deadline = self.next_probe;
        if settings.report_foreground {
            deadline = deadline.min(self.next_foreground);
        }
        if let Some(due) = self.startup.deadline() {
            deadline = deadline.min(due);
        }
        if let Some(due) = self.decoder.hold_deadline() {
            deadline = deadline.min(due);
        }
        deadline
    }
}

// ---------------------------------------------------------------------------
// IoMultiplexer
// ---------------------------------------------------------------------------

pub struct IoMultiplexer<'a, W: Write> {
    settings: &'a MultiplexerSettings,
    input: &'a mut InputChannel,
    output: &'a mut W,
    probe: &'a ProcessTreeProbe,
    lifecycle: &'a LifecycleController,
}

impl<'a, W: Write> IoMultiplexer<'a, W> {
    pub fn new(
        settings: &'a MultiplexerSettings,
        input: &'a mut InputChannel,
        output: &'a mut W,
        probe: &'a ProcessTreeProbe,
        lifecycle: &'a LifecycleController,
    ) -> Self {
        Self {
            settings,
            input,
            output,
            probe,
            lifecycle,
        }
    }

    /// Relay until the shell exits, a stop is requested or the host goes away.
    pub fn run(&mut self, session: &mut Session) -> LoopExit {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            if self.lifecycle.stop_requested() {
                return LoopExit::Cancelled;
            }
            if let Some(code) = session.exit_code() {
                info!(pid = session.pid, code, "shell exited");
                return match self.drain_pty(session, &mut buf) {
                    Err(HostGone) => LoopExit::HostGone,
                    Ok(()) => LoopExit::ShellExited(code),
                };
            }

            let now = Instant::now();
            self.run_due_work(session, now);

            let timeout = session
                .next_deadline(self.settings)
                .saturating_duration_since(Instant::now())
                .min(self.settings.poll_timeout);
            let input_fd = session.input_open.then(|| self.input.raw_fd());
            let pty_fd = if session.pty_open {
                lock_or_recover(&session.live.pty, "pty").master_fd()
            } else {
                None
            };

            let ready = match wait_readable(&[input_fd, pty_fd], timeout) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(error = %e, "readiness wait failed");
                    std::thread::sleep(timeout.min(Duration::from_millis(50)));
                    continue;
                }
            };

            if ready[0] {
                self.handle_input(session, &mut buf);
            }
            if ready[1] && self.handle_pty_output(session, &mut buf).is_err() {
                return LoopExit::HostGone;
            }
        }
    }

    fn run_due_work(&mut self, session: &mut Session, now: Instant) {
        if let Some(command) = session.startup.poll(now) {
            debug!(pid = session.pid, %command, "injecting startup command");
            let mut line = command.into_bytes();
            line.push(b'\n');
            session.write_to_pty(&line);
        }

        if now >= session.next_probe {
            self.run_probe(session, now, false);
        }

        if self.settings.report_foreground && now >= session.next_foreground {
            session.next_foreground = now + self.settings.foreground_interval;
            let name = self.probe.foreground_name(session.pid);
            if name != session.foreground {
                if let Some(name) = name.as_ref() {
                    reporter::report(
                        &mut *self.output,
                        &StatusEvent::ForegroundProcess { name: name.clone() },
                    );
                }
                session.foreground = name;
            }
        }

        if let Some(text) = session.decoder.flush_expired(now) {
            session.write_to_pty(text.as_bytes());
        }
    }

    /// Probe for agents. Forced probes answer a host request and always
    /// report; scheduled ones report only a change. Either kind pushes the
    /// next scheduled probe out by a full interval.
    fn run_probe(&mut self, session: &mut Session, now: Instant, forced: bool) {
        let status = self.probe.probe(session.pid);
        session.next_probe = now + self.settings.probe_interval;
        if forced || status != session.agent_status {
            if status != session.agent_status {
                info!(pid = session.pid, from = %session.agent_status, to = %status, "agent status changed");
            }
            session.agent_status = status;
            reporter::report(&mut *self.output, &StatusEvent::CliAgentStatus(status));
        }
    }

    fn handle_input(&mut self, session: &mut Session, buf: &mut [u8]) {
        match self.input.read(buf) {
            Ok(0) => {
                info!(pid = session.pid, "input channel closed");
                session.input_open = false;
                let held = session.decoder.flush();
                session.write_to_pty(held.as_bytes());
            }
            Ok(n) => {
                let now = Instant::now();
                let decoded = session.decoder.feed(&buf[..n], now);
                self.apply_decoded(session, decoded, now);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                warn!(error = %e, "input channel read failed, closing it");
                session.input_open = false;
            }
        }
    }

    fn apply_decoded(&mut self, session: &mut Session, decoded: DecoderOutput, now: Instant) {
        if decoded.force_probe {
            self.run_probe(session, now, true);
        }
        for size in decoded.resizes {
            lock_or_recover(&session.live.pty, "pty").resize(size);
        }
        session.write_to_pty(decoded.text.as_bytes());
    }

    /// Forward one read from the PTY. `Err` means the host is gone.
    fn handle_pty_output(&mut self, session: &mut Session, buf: &mut [u8]) -> Result<(), HostGone> {
        let result = lock_or_recover(&session.live.pty, "pty").read(buf);
        match result {
            Ok(0) => {
                debug!(pid = session.pid, "pty reached end of stream");
                session.pty_open = false;
                Ok(())
            }
            Ok(n) => self.forward(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(()),
            Err(e) => {
                // EIO once the slave side has no more holders.
                debug!(pid = session.pid, error = %e, "pty closed on the shell side");
                session.pty_open = false;
                Ok(())
            }
        }
    }

    fn drain_pty(&mut self, session: &mut Session, buf: &mut [u8]) -> Result<(), HostGone> {
        if !session.pty_open {
            return Ok(());
        }
        for _ in 0..DRAIN_LIMIT {
            let result = lock_or_recover(&session.live.pty, "pty").read(buf);
            match result {
                Ok(0) | Err(_) => break,
                Ok(n) => self.forward(&buf[..n])?,
            }
        }
        Ok(())
    }

    fn forward(&mut self, bytes: &[u8]) -> Result<(), HostGone> {
        match self.output.write_all(bytes).and_then(|()| self.output.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("output channel closed by host");
                Err(HostGone)
            }
            Err(e) => {
                debug!(error = %e, "output write failed");
                Ok(())
            }
        }
    }
}
