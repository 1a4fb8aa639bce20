//! Task state machine

use serde::{Deserialize, Serialize};

/// Status shared by tasks and their runs
///
/// `Stopping` is a transient overlay applied the moment a stop is requested,
/// before the process confirms exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Set on create, resume and rotation retry
    Running,

    /// Stop requested, waiting for the process to go away
    Stopping,

    /// Stopped by user request
    Stopped,

    /// Agent exited cleanly and reported a thread id
    Completed,

    /// Anything else
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Completed | TaskStatus::Failed
        )
    }

    /// Running or stopping: a process (or its setup) is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Stopping)
    }

    /// Whether `self -> next` is a legal transition
    ///
    /// Terminal states only leave through a new run (`Running`).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Running, Stopping | Stopped | Completed | Failed) => true,
            (Stopping, Stopped | Completed | Failed) => true,
            (Stopped | Completed | Failed, Running) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Get a symbol for the state (for CLI listings)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Running => "⟳",
            TaskStatus::Stopping => "…",
            TaskStatus::Stopped => "⊘",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
