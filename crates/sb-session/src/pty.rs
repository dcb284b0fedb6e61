use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use sb_core::types::TerminalSize;
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty open failed: {0}")]
    OpenFailed(String),

    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// How long `write_all` keeps retrying a full PTY buffer before giving up.
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(5);

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pty master is closed")
}

// ---------------------------------------------------------------------------
// PtyChannel
// ---------------------------------------------------------------------------

/// A master/slave pseudo-terminal pair.
///
/// The slave end is only held until a shell has been spawned on it; after
/// that the master is the single descriptor the bridge reads and writes.
pub struct PtyChannel {
    master: Option<Box<dyn MasterPty + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    slave: Option<Box<dyn SlavePty + Send>>,
    master_fd: Option<RawFd>,
    process_group: Option<i32>,
    size: TerminalSize,
}

impl PtyChannel {
    /// Allocate a PTY with the given geometry.
    pub fn open(size: TerminalSize) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        // openpty already applied the size; re-applying is best effort.
        if let Err(e) = pair.master.resize(pty_size(size)) {
            debug!(error = %e, "initial winsize not applied");
        }

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;
        let master_fd = pair.master.as_raw_fd();

        debug!(%size, ?master_fd, "opened pty");

        Ok(Self {
            master: Some(pair.master),
            reader: Some(reader),
            writer: Some(writer),
            slave: Some(pair.slave),
            master_fd,
            process_group: None,
            size,
        })
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        if self.is_open() {
            self.master_fd
        } else {
            None
        }
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Process group that receives window-change notifications.
    pub fn process_group(&self) -> Option<i32> {
        self.process_group
    }

    /// Switch the master descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<()> {
        let fd = self.master_fd().ok_or_else(closed_error)?;
        crate::io::set_nonblocking(fd)?;
        Ok(())
    }

    /// Spawn the first launchable candidate on the slave end.
    ///
    /// On success the parent's slave handle is closed, so the shell holds
    /// the only slave descriptors.
    pub fn spawn_shell(&mut self, launch: &ShellLaunch) -> Result<ShellProcess> {
        let slave = self
            .slave
            .as_ref()
            .ok_or_else(|| PtyError::SpawnFailed("pty slave already consumed".into()))?;

        let mut last_error = String::from("no shell candidates configured");
        for (attempt, program) in launch.candidates.iter().enumerate() {
            let cmd = launch.command_for(program, self.size);
            match slave.spawn_command(cmd) {
                Ok(child) => {
                    let pid = child.process_id().ok_or_else(|| {
                        PtyError::SpawnFailed(format!("{program}: spawned without a pid"))
                    })?;
                    // The child runs setsid() before exec, so its pid is its
                    // process-group id.
                    let pgid = pid as i32;
                    self.process_group = Some(pgid);
                    self.slave = None;
                    if attempt > 0 {
                        warn!(program, "started fallback shell");
                    }
                    info!(program, pid, size = %self.size, "shell spawned");
                    return Ok(ShellProcess::new(child, pid, pgid, program.clone()));
                }
                Err(e) => {
                    warn!(program, error = %e, "shell failed to launch");
                    last_error = format!("{program}: {e}");
                }
            }
        }
        Err(PtyError::SpawnFailed(last_error))
    }

    /// Non-blocking read from the master. `WouldBlock` is passed through.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.as_mut().ok_or_else(closed_error)?.read(buf)
    }

    /// Write all bytes to the master, retrying while the PTY buffer is full.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(closed_error)?;
        let mut written = 0;
        let mut stalled_since: Option<Instant> = None;
        while written < data.len() {
            match writer.write(&data[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    stalled_since = None;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > WRITE_STALL_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "pty write stalled: shell is not reading input",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        writer.flush()
    }

    /// Send a line of text (appends newline).
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Apply new geometry and notify the shell's process group.
    ///
    /// Both steps are best effort; the shell may already be gone. Returns
    /// whether the geometry was applied.
    pub fn resize(&mut self, size: TerminalSize) -> bool {
        let Some(master) = self.master.as_ref() else {
            return false;
        };
        let applied = match master.resize(pty_size(size)) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, %size, "pty resize failed");
                false
            }
        };
        self.size = size;
        if let Some(pgid) = self.process_group {
            // SAFETY: killpg only takes integers.
            if unsafe { libc::killpg(pgid, libc::SIGWINCH) } < 0 {
                debug!(pgid, error = %io::Error::last_os_error(), "SIGWINCH not delivered");
            }
        }
        debug!(%size, applied, "pty resized");
        applied
    }

    /// Release the master (and slave, if still held). Closing twice is a no-op.
    pub fn close(&mut self) -> bool {
        if self.master.is_none() {
            return false;
        }
        self.writer = None;
        self.reader = None;
        self.slave = None;
        self.master = None;
        debug!("pty closed");
        true
    }
}

impl std::fmt::Debug for PtyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyChannel")
            .field("master_fd", &self.master_fd)
            .field("open", &self.is_open())
            .field("process_group", &self.process_group)
            .field("size", &self.size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ShellLaunch
// ---------------------------------------------------------------------------

/// Everything needed to start a shell on a PTY slave.
#[derive(Debug, Clone)]
pub struct ShellLaunch {
    /// Programs tried in order until one launches.
    pub candidates: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub term: String,
    pub env: Vec<(String, String)>,
}

impl ShellLaunch {
    fn command_for(&self, program: &str, size: TerminalSize) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(program);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd.cwd(&self.working_dir);
        cmd.env("TERM", &self.term);
        cmd.env("COLUMNS", size.cols.to_string());
        cmd.env("LINES", size.rows.to_string());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

// ---------------------------------------------------------------------------
// ShellProcess
// ---------------------------------------------------------------------------

/// Result of tearing down a shell's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The shell had already exited; leftover group members got SIGTERM.
    AlreadyExited,
    /// The shell exited within the grace period after SIGTERM.
    Terminated,
    /// The shell outlived the grace period and the group got SIGKILL.
    Killed,
}

/// The shell running on the PTY, leader of its own session and process group.
pub struct ShellProcess {
    child: Box<dyn Child + Send + Sync>,
    pid: u32,
    pgid: i32,
    program: String,
    exit_code: Option<u32>,
}

impl ShellProcess {
    fn new(child: Box<dyn Child + Send + Sync>, pid: u32, pgid: i32, program: String) -> Self {
        Self {
            child,
            pid,
            pgid,
            program,
            exit_code: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Non-blocking exit check. Returns the exit code once the shell is gone.
    pub fn try_wait(&mut self) -> Option<u32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.exit_code());
                debug!(pid = self.pid, code = status.exit_code(), "shell exited");
            }
            Ok(None) => {}
            Err(e) => {
                // ECHILD and friends: nothing left to wait for.
                warn!(pid = self.pid, error = %e, "waitpid failed, treating shell as exited");
                self.exit_code = Some(1);
            }
        }
        self.exit_code
    }

    pub fn is_running(&mut self) -> bool {
        self.try_wait().is_none()
    }

    /// Send `signal` to the whole process group.
    pub fn signal_group(&self, signal: libc::c_int) -> bool {
        // SAFETY: killpg only takes integers.
        let rc = unsafe { libc::killpg(self.pgid, signal) };
        if rc < 0 {
            debug!(pgid = self.pgid, signal, error = %io::Error::last_os_error(), "killpg failed");
        }
        rc == 0
    }

    /// SIGTERM the group, wait up to `grace`, then SIGKILL if the shell is
    /// still alive. Always reaps the shell.
    pub fn terminate_group(&mut self, grace: Duration) -> TerminateOutcome {
        let was_running = self.is_running();
        self.signal_group(libc::SIGTERM);
        if !was_running {
            return TerminateOutcome::AlreadyExited;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                info!(pid = self.pid, "shell terminated");
                return TerminateOutcome::Terminated;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        if !self.is_running() {
            return TerminateOutcome::Terminated;
        }
        warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "shell ignored SIGTERM, killing group");
        self.signal_group(libc::SIGKILL);
        match self.child.wait() {
            Ok(status) => self.exit_code = Some(status.exit_code()),
            Err(e) => {
                debug!(pid = self.pid, error = %e, "wait after SIGKILL failed");
                self.exit_code = Some(1);
            }
        }
        TerminateOutcome::Killed
    }
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("program", &self.program)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
