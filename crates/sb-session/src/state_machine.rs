use std::fmt;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Starting => "Starting",
            SessionState::Running => "Running",
            SessionState::Restarting => "Restarting",
            SessionState::Stopping => "Stopping",
            SessionState::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A shell is up on a fresh PTY.
    Spawned,
    /// The shell exited on its own.
    ShellExited,
    /// Backoff elapsed; spawn again.
    Respawn,
    /// Cancellation, host loss or restart limit.
    Stop,
    /// No shell could be started.
    Fail,
    /// Teardown finished.
    CleanedUp,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEvent::Spawned => "Spawned",
            SessionEvent::ShellExited => "ShellExited",
            SessionEvent::Respawn => "Respawn",
            SessionEvent::Stop => "Stop",
            SessionEvent::Fail => "Fail",
            SessionEvent::CleanedUp => "CleanedUp",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

/// Valid transitions:
/// - Starting   + Spawned     -> Running
/// - Starting   + Stop        -> Stopping
/// - Starting   + Fail        -> Stopped
/// - Running    + ShellExited -> Restarting
/// - Running    + Stop        -> Stopping
/// - Restarting + Respawn     -> Starting
/// - Restarting + Stop        -> Stopping
/// - Stopping   + CleanedUp   -> Stopped
fn next_state(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;
    let next = match (state, event) {
        (S::Starting, E::Spawned) => S::Running,
        (S::Starting, E::Stop) => S::Stopping,
        (S::Starting, E::Fail) => S::Stopped,
        (S::Running, E::ShellExited) => S::Restarting,
        (S::Running, E::Stop) => S::Stopping,
        (S::Restarting, E::Respawn) => S::Starting,
        (S::Restarting, E::Stop) => S::Stopping,
        (S::Stopping, E::CleanedUp) => S::Stopped,
        _ => return None,
    };
    Some(next)
}

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
    history: Vec<(SessionState, SessionEvent, SessionState)>,
}

impl SessionStateMachine {
    /// Create a new state machine starting in `Starting`.
    pub fn new() -> Self {
        Self {
            current: SessionState::Starting,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        &self.history
    }

    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, StateMachineError> {
        let next = next_state(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;
        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "session state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: SessionEvent) -> bool {
        next_state(self.current, event).is_some()
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
