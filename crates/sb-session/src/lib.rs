//! PTY shell-session bridge for shellbridge.
//!
//! This crate allocates a pseudo-terminal, runs an interactive login shell
//! on it, and relays bytes between the host's I/O channel and the PTY. On
//! top of the relay it strips in-band control directives from the input,
//! watches the shell's process subtree for known agent programs, and keeps
//! the shell alive across unexpected exits.
//!
//! Key components:
//! - [`pty::PtyChannel`] / [`pty::ShellProcess`]: master/slave pair and the shell on it
//! - [`decoder::InputDecoder`]: UTF-8 reassembly and control-directive extraction
//! - [`probe::ProcessTreeProbe`]: bounded breadth-first walk of the shell's descendants
//! - [`reporter`]: OSC 777 status events for the host
//! - [`multiplexer::IoMultiplexer`]: the single-threaded readiness loop
//! - [`lifecycle::LifecycleController`]: signal handling and once-only teardown
//! - [`supervisor::SessionSupervisor`]: spawn, run, restart or stop

pub mod decoder;
pub mod io;
pub mod lifecycle;
pub mod multiplexer;
pub mod probe;
pub mod pty;
pub mod reporter;
pub mod state_machine;
pub mod supervisor;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the inner value if a previous holder panicked.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!(what, "lock was poisoned, recovering");
        e.into_inner()
    })
}
