//! Container lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Container state machine.
///
/// `Created → Running → (Paused ↔ Running) → Stopped → Removed`, with
/// `Stopped → Running` for restarts. Removal from `Running` requires an
/// explicit force, which stops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Writable layer allocated, nothing started
    Created,

    /// Filesystem materialized, payload launched
    Running,

    /// Payload suspended
    Paused,

    /// Payload exited, exit status recorded
    Stopped,

    /// Instance destroyed
    Removed,
}

impl ContainerState {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Removed)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Running)
                | (Stopped, Removed)
        )
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopped => "stopped",
            ContainerState::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// Exit status of a stopped container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Process-reported exit code (0 = success)
    Code(i32),

    /// Terminated by forced signal after the grace period expired
    ForceKilled,
}

impl ExitStatus {
    /// Whether the payload ended successfully.
    pub fn success(self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}
