//! Run Finalizer - turns a terminated process into persisted state
//!
//! Classification, in order:
//! 1. `stopped` - user requested, or killed by SIGTERM/SIGKILL
//! 2. `completed` - exit 0 and a continuation token is known
//! 3. `failed` - everything else; usage-limit failures are flagged for rotation

use crate::agent::detect_usage_limit;
use crate::credentials::CredentialStore;
use crate::notify::Notifier;
use crate::state::TaskStatus;
use crate::store::TaskStore;
use crate::supervisor::ProcessOutcome;
use crate::task::{Artifact, Task, TaskId};
use chrono::Utc;
use ignore::WalkBuilder;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use yard_foundation::Result;

pub const STOPPED_MESSAGE: &str = "Stopped by user";
pub const USAGE_LIMIT_MESSAGE: &str = "Usage limit reached";
pub const NO_THREAD_MESSAGE: &str = "Agent exited without reporting a thread id";
pub const INTERRUPTED_MESSAGE: &str = "Interrupted: engine restarted while the run was in flight";

/// Verdict on one finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: TaskStatus,
    /// Short UI-facing message; `None` on success
    pub error: Option<String>,
    pub usage_limit: bool,
}

impl Classification {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Classify a run outcome
///
/// `known_thread` covers a token cached on the task from an earlier run.
pub fn classify(outcome: &ProcessOutcome, stop_requested: bool, known_thread: bool) -> Classification {
    if stop_requested || outcome.killed_by_stop_signal() {
        return Classification {
            status: TaskStatus::Stopped,
            error: Some(STOPPED_MESSAGE.to_string()),
            usage_limit: false,
        };
    }

    if let Some(err) = &outcome.spawn_error {
        return Classification {
            status: TaskStatus::Failed,
            error: Some(format!("Failed to start agent: {}", err)),
            usage_limit: false,
        };
    }

    let has_thread = known_thread || outcome.thread_id.is_some();
    if outcome.exit_code == Some(0) && has_thread {
        return Classification {
            status: TaskStatus::Completed,
            error: None,
            usage_limit: false,
        };
    }

    let usage_limit = detect_usage_limit(&outcome.stdout);
    let error = if usage_limit {
        USAGE_LIMIT_MESSAGE.to_string()
    } else {
        match (outcome.exit_code, outcome.signal) {
            (Some(0), _) => NO_THREAD_MESSAGE.to_string(),
            (Some(code), _) => format!("Agent exited with code {}", code),
            (None, Some(signal)) => format!("Agent terminated by signal {}", signal),
            (None, None) => "Agent exited abnormally".to_string(),
        }
    };

    Classification {
        status: TaskStatus::Failed,
        error: Some(error),
        usage_limit,
    }
}

/// Files under `dir`, relative `/`-separated paths, sorted
pub fn collect_artifacts(dir: &Path) -> Vec<Artifact> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(false)
        .build();

    let mut artifacts: Vec<Artifact> = walker
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(dir).ok()?;
            let path = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            Some(Artifact { path, size })
        })
        .collect();
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts
}

/// Outcome of finalization, input to the rotation decision
#[derive(Debug, Clone)]
pub struct FinalizedRun {
    pub task: Task,
    pub run_label: String,
    pub classification: Classification,
    /// Credential bound when the run started
    pub account_id: Option<String>,
}

/// Persists a finished run
pub struct RunFinalizer {
    store: Arc<TaskStore>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
}

impl RunFinalizer {
    pub fn new(
        store: Arc<TaskStore>,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            credentials,
            notifier,
        }
    }

    /// Called exactly once per run attempt
    pub fn finalize(
        &self,
        task_id: &TaskId,
        run_label: &str,
        outcome: &ProcessOutcome,
        stop_requested: bool,
    ) -> Result<FinalizedRun> {
        let artifacts = collect_artifacts(&self.store.artifacts_dir(task_id, run_label));

        let (task, (classification, account_id)) = self.store.update(task_id, |task| {
            task.remember_thread_id(outcome.thread_id.as_deref());
            let classification = classify(outcome, stop_requested, task.thread_id.is_some());

            let mut account_id = None;
            let mut prompt = None;
            if let Some(run) = task.run_mut(run_label) {
                run.status = classification.status;
                run.exit_code = outcome.exit_code;
                run.finished_at = Some(Utc::now());
                run.artifacts = artifacts;
                account_id = run.account_id.clone();
                prompt = Some(run.prompt.clone());
            }
            if let Some(prompt) = prompt {
                task.last_prompt = prompt;
            }
            task.status = classification.status;
            task.error = classification.error.clone();
            (classification, account_id)
        })?;

        info!(
            task_id = %task_id,
            run = run_label,
            status = %classification.status,
            usage_limit = classification.usage_limit,
            "Run finalized"
        );

        // Bound account, not whatever is active now
        if let Some(account) = account_id.as_deref() {
            match self.credentials.sync_account_from_host(account) {
                Ok(true) => debug!(account, "Credential synced back"),
                Ok(false) => {}
                Err(e) => warn!(account, "Credential sync-back failed: {}", e),
            }
        }

        self.notifier
            .tasks_changed(task_id.as_str(), classification.status.as_str());

        Ok(FinalizedRun {
            task,
            run_label: run_label.to_string(),
            classification,
            account_id,
        })
    }
}
