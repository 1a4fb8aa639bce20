//! Task and run records
//!
//! These are the durable source of truth, persisted as camelCase JSON in
//! `tasks/<id>/task.json`.

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;
use yard_foundation::{Error, Result};

/// Unique identifier for a task
///
/// Lowercase hex, safe to embed in paths and container names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..12].to_string())
    }

    /// Parse a caller-supplied id
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(Error::invalid(format!("Invalid task id: {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only reference worktree of another environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRepo {
    pub env_id: String,
    pub path: PathBuf,
}

/// File staged into the task's attachments directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub size: u64,
}

/// File the agent left in a run's artifact directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Relative to the run's artifact directory, `/`-separated
    pub path: String,
    pub size: u64,
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Fresh,
    Resume,
    /// Resume driven by credential rotation
    Rotation,
}

/// One invocation of the agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// `run-NNN`, 1-based
    pub label: String,

    pub kind: RunKind,

    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,

    /// Stdout log, relative to the task's `logs/`
    pub log_file: String,

    /// Stderr log, relative to the task's `logs/`
    pub error_log_file: String,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub used_sidecar: bool,

    /// Credential bound at run start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_label: Option<String>,

    /// Populated at finalization
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Run {
    pub fn label_for(index: usize) -> String {
        format!("run-{:03}", index)
    }

    pub fn new(
        label: impl Into<String>,
        kind: RunKind,
        prompt: impl Into<String>,
        model: Option<String>,
        reasoning_effort: Option<String>,
        used_sidecar: bool,
    ) -> Self {
        let label = label.into();
        Self {
            log_file: format!("{}.out.log", label),
            error_log_file: format!("{}.err.log", label),
            label,
            kind,
            prompt: prompt.into(),
            model,
            reasoning_effort,
            started_at: Utc::now(),
            finished_at: None,
            status: TaskStatus::Running,
            exit_code: None,
            used_sidecar,
            account_id: None,
            account_label: None,
            artifacts: Vec::new(),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }
}

/// One unit of agent work bound to one git environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Environment (bare mirror) the worktree belongs to
    pub env_id: String,

    pub branch: String,

    /// Commit the branch was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,

    pub worktree_path: PathBuf,

    #[serde(default)]
    pub context_repos: Vec<ContextRepo>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,

    /// Give the agent its own nested container engine
    #[serde(default)]
    pub use_sidecar: bool,

    /// Continuation token; never cleared once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    pub status: TaskStatus,

    #[serde(default)]
    pub auto_rotate_count: u32,

    #[serde(default)]
    pub error: Option<String>,

    pub initial_prompt: String,

    pub last_prompt: String,

    #[serde(default)]
    pub runs: Vec<Run>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        env_id: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        let prompt = prompt.into();
        let now = Utc::now();
        Self {
            id,
            env_id: env_id.into(),
            branch: branch.into(),
            base_commit: None,
            worktree_path: worktree_path.into(),
            context_repos: Vec::new(),
            attachments: Vec::new(),
            model: None,
            reasoning_effort: None,
            use_sidecar: false,
            thread_id: None,
            status: TaskStatus::Running,
            auto_rotate_count: 0,
            error: None,
            initial_prompt: prompt.clone(),
            last_prompt: prompt,
            runs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn latest_run(&self) -> Option<&Run> {
        self.runs.last()
    }

    pub fn latest_run_mut(&mut self) -> Option<&mut Run> {
        self.runs.last_mut()
    }

    pub fn run(&self, label: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.label == label)
    }

    pub fn run_mut(&mut self, label: &str) -> Option<&mut Run> {
        self.runs.iter_mut().find(|r| r.label == label)
    }

    pub fn next_run_label(&self) -> String {
        Run::label_for(self.runs.len() + 1)
    }

    /// Record the continuation token; `None` never clears a known one
    pub fn remember_thread_id(&mut self, thread_id: Option<&str>) {
        if let Some(id) = thread_id.filter(|id| !id.is_empty()) {
            self.thread_id = Some(id.to_string());
        }
    }

    /// Move task status, rejecting illegal transitions
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if self.status != next && !self.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "Task {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Whether any run is running or stopping
    pub fn has_run_in_flight(&self) -> bool {
        self.runs.iter().any(Run::is_in_flight)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new(TaskId::new(), "env", "yard/abc", "/tmp/wt", "fix the build")
    }

    #[test]
    fn test_task_id_is_path_safe() {
        let id = TaskId::new();
        assert_eq!(id.as_str().len(), 12);
        assert!(TaskId::parse(id.as_str()).is_ok());
        assert!(TaskId::parse("../etc").is_err());
        assert!(TaskId::parse("").is_err());
    }

    #[test]
    fn test_run_labels_are_zero_padded() {
        let mut task = sample();
        assert_eq!(task.next_run_label(), "run-001");
        task.runs.push(Run::new("run-001", RunKind::Fresh, "p", None, None, false));
        assert_eq!(task.next_run_label(), "run-002");
        assert_eq!(task.runs[0].log_file, "run-001.out.log");
        assert_eq!(Run::label_for(123), "run-123");
    }

    #[test]
    fn test_thread_id_is_never_cleared() {
        let mut task = sample();
        task.remember_thread_id(Some("thr_1"));
        task.remember_thread_id(None);
        task.remember_thread_id(Some(""));
        assert_eq!(task.thread_id.as_deref(), Some("thr_1"));
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut task = sample();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.transition(TaskStatus::Stopping).is_err());
        task.transition(TaskStatus::Running).unwrap();
    }

    #[test]
    fn test_serializes_camel_case() {
        let task = sample();
        let value = serde_json::to_value(&task).unwrap();
        assert!(value.get("initialPrompt").is_some());
        assert!(value.get("autoRotateCount").is_some());
        assert!(value.get("threadId").is_none());
    }
}
