//! Task store - on-disk layout and record persistence
//!
//! ```text
//! tasks/<taskId>/task.json
//! tasks/<taskId>/worktree/
//! tasks/<taskId>/logs/run-NNN.{out,err}.log
//! tasks/<taskId>/artifacts/run-NNN/
//! tasks/<taskId>/attachments/
//! tasks/<taskId>/context/<envId>/
//! tasks/<taskId>/sidecar/
//! ```

use crate::log::{log_path, LogStream};
use crate::task::{Task, TaskId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::warn;
use yard_foundation::{Error, JsonStore, Result};

pub const TASK_FILE: &str = "task.json";

/// Persists task records; read-modify-write is serialized
pub struct TaskStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Layout
    // ========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, id: &TaskId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn worktree_dir(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join("worktree")
    }

    pub fn logs_dir(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join("logs")
    }

    pub fn log_file(&self, id: &TaskId, run_label: &str, stream: LogStream) -> PathBuf {
        log_path(&self.logs_dir(id), run_label, stream)
    }

    pub fn artifacts_dir(&self, id: &TaskId, run_label: &str) -> PathBuf {
        self.task_dir(id).join("artifacts").join(run_label)
    }

    pub fn attachments_dir(&self, id: &TaskId) -> PathBuf {
        self.task_dir(id).join("attachments")
    }

    pub fn context_dir(&self, id: &TaskId, env_id: &str) -> PathBuf {
        self.task_dir(id).join("context").join(env_id)
    }

    fn json(&self, id: &TaskId) -> JsonStore {
        JsonStore::new(self.task_dir(id))
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub fn exists(&self, id: &TaskId) -> bool {
        self.json(id).exists(TASK_FILE)
    }

    pub fn load(&self, id: &TaskId) -> Result<Task> {
        let _guard = self.lock.lock();
        self.load_unlocked(id)
    }

    fn load_unlocked(&self, id: &TaskId) -> Result<Task> {
        self.json(id)
            .load_optional::<Task>(TASK_FILE)?
            .ok_or_else(|| Error::not_found(format!("Task {}", id)))
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        let _guard = self.lock.lock();
        self.json(&task.id).save(TASK_FILE, task)
    }

    /// Load, mutate and save under the store lock
    pub fn update<R>(&self, id: &TaskId, f: impl FnOnce(&mut Task) -> R) -> Result<(Task, R)> {
        let _guard = self.lock.lock();
        let mut task = self.load_unlocked(id)?;
        let out = f(&mut task);
        task.touch();
        self.json(id).save(TASK_FILE, &task)?;
        Ok((task, out))
    }

    /// All readable tasks, newest first
    pub fn list(&self) -> Result<Vec<Task>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(id) = TaskId::parse(&name) else {
                continue;
            };
            if !entry.path().join(TASK_FILE).is_file() {
                continue;
            }
            match self.load(&id) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(task_id = %id, "Skipping unreadable task: {}", e),
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Delete the whole task directory
    pub fn remove(&self, id: &TaskId) -> Result<()> {
        let _guard = self.lock.lock();
        match std::fs::remove_dir_all(self.task_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
