use std::{fmt, path::PathBuf, time::Duration};

/// Identifier for one launch attempt. A fresh id is minted per `start`
/// so background tasks from an older launch can detect they are stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LaunchId(pub String);

impl LaunchId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to spawn the server process. Built once per
/// `start` call from the dashboard's configuration; never persisted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Child stdout+stderr are appended here. The supervisor only sets
    /// up the redirection; log viewing is someone else's job.
    pub log_file: PathBuf,
}

/// The resolved runtime process. `pid` is the real server process, not
/// the launcher script that spawned it. `pgid` is the process group
/// created at launch, used so one signal reaches the whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub pgid: i32,
    pub started_at_unix_ms: u64,
}

/// RCON connection details, sourced from the managed server's own
/// `server.properties`. Invalid once the server restarts with new
/// credentials.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RconEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl fmt::Debug for RconEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RconEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supervisor lifecycle state. `Killing` is transient: it is only ever
/// observed while a forced termination is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running { ready: bool },
    Stopping,
    Killing,
}

impl SupervisorState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// True for every state in which a `ProcessHandle` exists.
    pub fn is_live(&self) -> bool {
        !self.is_stopped()
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running { ready: true } => write!(f, "running (ready)"),
            Self::Running { ready: false } => write!(f, "running (not ready)"),
            Self::Stopping => write!(f, "stopping"),
            Self::Killing => write!(f, "killing"),
        }
    }
}

/// One resource reading for the resolved pid. A process that no longer
/// exists reports `alive = false` with zeroed counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    pub alive: bool,
    /// 1/100 of a percent, same fixed-point scheme the rest of the
    /// dashboard expects.
    pub cpu_percent_x100: u32,
    pub rss_bytes: u64,
}

/// Derived status served to the web layer, cached for a few seconds to
/// absorb bursts of concurrent polling.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub uptime: String,
    pub cpu_percent_x100: u32,
    pub rss_bytes: u64,
    pub ready: bool,
    pub players: Option<u32>,
    pub max_players: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusSnapshot {
    pub fn stopped(max_players: u32, message: Option<String>) -> Self {
        Self {
            state: SupervisorState::Stopped,
            pid: None,
            uptime_secs: 0,
            uptime: format_uptime(0),
            cpu_percent_x100: 0,
            rss_bytes: 0,
            ready: false,
            players: None,
            max_players,
            message,
        }
    }
}

/// Immediate acknowledgement of a lifecycle request. The caller polls
/// `status()` for completion; long-running work happens in background.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ack {
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn new(state: SupervisorState) -> Self {
        Self {
            state,
            message: None,
        }
    }

    pub fn with_message(state: SupervisorState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("rcon connection failed: {0}")]
    Connection(String),
    #[error("rcon authentication failed")]
    Auth,
    #[error("rcon request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server is not ready for commands")]
    NotReady,
    #[error("rcon protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for RconError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("server process not found within {timeout_ms}ms")]
    ProcessNotFound { timeout_ms: u64 },
    #[error("cannot {requested} while {current}")]
    InvalidState {
        current: SupervisorState,
        requested: &'static str,
    },
    #[error(transparent)]
    Rcon(#[from] RconError),
}

/// Human-readable uptime for the dashboard status card.
pub fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;

    if days > 0 {
        format!("{days} days, {hours} hours")
    } else if hours > 0 {
        format!("{hours} hours, {minutes} minutes")
    } else {
        format!("{minutes} minutes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_id_is_non_empty() {
        let id = LaunchId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn endpoint_debug_redacts_password() {
        let ep = RconEndpoint {
            host: "localhost".to_string(),
            port: 25575,
            password: "hunter2".to_string(),
        };
        let s = format!("{ep:?}");
        assert!(!s.contains("hunter2"));
        assert!(s.contains("<redacted>"));
    }

    #[test]
    fn state_liveness_matches_handle_invariant() {
        assert!(!SupervisorState::Stopped.is_live());
        assert!(SupervisorState::Starting.is_live());
        assert!(SupervisorState::Running { ready: false }.is_live());
        assert!(SupervisorState::Stopping.is_live());
        assert!(SupervisorState::Killing.is_live());
    }

    #[test]
    fn format_uptime_ladder() {
        assert_eq!(format_uptime(0), "0 minutes");
        assert_eq!(format_uptime(59), "0 minutes");
        assert_eq!(format_uptime(61), "1 minutes");
        assert_eq!(format_uptime(3 * 3600 + 120), "3 hours, 2 minutes");
        assert_eq!(format_uptime(2 * 86_400 + 5 * 3600), "2 days, 5 hours");
    }

    #[test]
    fn invalid_state_error_names_both_states() {
        let err = SupervisorError::InvalidState {
            current: SupervisorState::Running { ready: true },
            requested: "start",
        };
        let msg = err.to_string();
        assert!(msg.contains("start"));
        assert!(msg.contains("running (ready)"));
    }
}
