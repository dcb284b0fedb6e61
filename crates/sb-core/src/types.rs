use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// TerminalSize
// ---------------------------------------------------------------------------

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub const DEFAULT_ROWS: u16 = 24;
    pub const DEFAULT_COLS: u16 = 80;

    /// Build a size, rejecting zero in either dimension.
    pub fn new(rows: u16, cols: u16) -> Option<Self> {
        if rows == 0 || cols == 0 {
            None
        } else {
            Some(Self { rows, cols })
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: Self::DEFAULT_ROWS,
            cols: Self::DEFAULT_COLS,
        }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

// ---------------------------------------------------------------------------
// AgentKind / AgentStatus
// ---------------------------------------------------------------------------

/// A recognised long-running agent program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Gemini,
}

impl AgentKind {
    /// Check order used when a single process could match several markers.
    pub const ALL: [AgentKind; 2] = [AgentKind::Claude, AgentKind::Gemini];

    /// Lowercase substring that identifies the agent in a process name or
    /// command line.
    pub fn marker(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Whether a recognised agent is running somewhere under the shell.
///
/// `agent_type` is `None` exactly when `active` is false; it serializes as
/// JSON `null` in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    pub active: bool,
    pub agent_type: Option<AgentKind>,
}

impl AgentStatus {
    pub const fn inactive() -> Self {
        Self {
            active: false,
            agent_type: None,
        }
    }

    pub const fn detected(kind: AgentKind) -> Self {
        Self {
            active: true,
            agent_type: Some(kind),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.agent_type {
            Some(kind) if self.active => write!(f, "active({kind})"),
            _ => f.write_str("inactive"),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

/// Out-of-band event delivered to the host as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    CliAgentStatus(AgentStatus),
    ForegroundProcess { name: String },
}

impl StatusEvent {
    /// The wire name carried in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::CliAgentStatus(_) => "cli_agent_status",
            StatusEvent::ForegroundProcess { .. } => "foreground_process",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_geometry_is_rejected() {
        assert!(TerminalSize::new(0, 80).is_none());
        assert!(TerminalSize::new(24, 0).is_none());
        assert_eq!(
            TerminalSize::new(40, 120),
            Some(TerminalSize { rows: 40, cols: 120 })
        );
    }

    #[test]
    fn default_geometry_is_24_by_80() {
        let size = TerminalSize::default();
        assert_eq!((size.rows, size.cols), (24, 80));
        assert_eq!(size.to_string(), "80x24");
    }

    #[test]
    fn inactive_status_encodes_null_agent() {
        let event = StatusEvent::CliAgentStatus(AgentStatus::inactive());
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"cli_agent_status","data":{"active":false,"agent_type":null}}"#
        );
    }

    #[test]
    fn detected_status_encodes_lowercase_agent() {
        let event = StatusEvent::CliAgentStatus(AgentStatus::detected(AgentKind::Gemini));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"cli_agent_status","data":{"active":true,"agent_type":"gemini"}}"#
        );
    }

    #[test]
    fn foreground_event_shape() {
        let event = StatusEvent::ForegroundProcess {
            name: "vim".into(),
        };
        assert_eq!(event.kind(), "foreground_process");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"foreground_process","data":{"name":"vim"}}"#);
    }

    #[test]
    fn status_equality_drives_transitions() {
        assert_eq!(AgentStatus::default(), AgentStatus::inactive());
        assert_ne!(
            AgentStatus::detected(AgentKind::Claude),
            AgentStatus::detected(AgentKind::Gemini)
        );
        assert_eq!(AgentStatus::detected(AgentKind::Claude).to_string(), "active(claude)");
    }
}
