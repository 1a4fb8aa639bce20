//! Run registry - the one shared mutable structure
//!
//! Maps task id to the handle of its in-flight run. All access goes through
//! methods that keep "at most one active run per task" atomic: reservation
//! fails while a handle exists, release only removes the handle it was given,
//! and rotation swaps old for new without a window where the task looks idle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yard_foundation::{Error, Result};

/// In-memory handle of one run attempt (never persisted)
#[derive(Debug)]
pub struct RunHandle {
    run_label: Mutex<Option<String>>,
    pid: AtomicU32,
    process_group: AtomicBool,
    stop_requested: AtomicBool,
    pending_start: AtomicBool,
    /// Cancelled by stop while setup (sidecar provisioning) is running
    provisioning: CancellationToken,
    /// Cancelled once the process has exited
    exited: CancellationToken,
    /// Forced kill of the direct child
    force_kill: CancellationToken,
}

impl RunHandle {
    fn new() -> Self {
        Self {
            run_label: Mutex::new(None),
            pid: AtomicU32::new(0),
            process_group: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            pending_start: AtomicBool::new(true),
            provisioning: CancellationToken::new(),
            exited: CancellationToken::new(),
            force_kill: CancellationToken::new(),
        }
    }

    pub fn run_label(&self) -> Option<String> {
        self.run_label.lock().clone()
    }

    pub fn set_run_label(&self, label: impl Into<String>) {
        *self.run_label.lock() = Some(label.into());
    }

    /// Record the spawned child; clears `pending_start`
    pub fn mark_spawned(&self, pid: Option<u32>, process_group: bool) {
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        self.process_group.store(process_group, Ordering::SeqCst);
        self.pending_start.store(false, Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn has_process_group(&self) -> bool {
        self.process_group.load(Ordering::SeqCst)
    }

    /// Returns `true` for the first request only
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_pending_start(&self) -> bool {
        self.pending_start.load(Ordering::SeqCst)
    }

    pub fn provisioning(&self) -> &CancellationToken {
        &self.provisioning
    }

    pub fn exited(&self) -> &CancellationToken {
        &self.exited
    }

    pub fn force_kill(&self) -> &CancellationToken {
        &self.force_kill
    }
}

/// Task id -> in-flight run handle
#[derive(Debug)]
pub struct RunRegistry {
    handles: Mutex<HashMap<String, Arc<RunHandle>>>,
    /// Bumped on every release so waiters can re-check
    released: watch::Sender<u64>,
}

impl RunRegistry {
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            handles: Mutex::new(HashMap::new()),
            released,
        }
    }

    /// Claim the task for a new run; `Conflict` if one is in flight
    pub fn try_reserve(&self, task_id: &str) -> Result<Arc<RunHandle>> {
        let mut handles = self.handles.lock();
        if handles.contains_key(task_id) {
            return Err(Error::Conflict(format!(
                "Task {} already has a run in flight",
                task_id
            )));
        }
        let handle = Arc::new(RunHandle::new());
        handles.insert(task_id.to_string(), Arc::clone(&handle));
        debug!(task_id, "Reserved run slot");
        Ok(handle)
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<RunHandle>> {
        self.handles.lock().get(task_id).cloned()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.handles.lock().contains_key(task_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.handles.lock().keys().cloned().collect()
    }

    /// Replace `current` with a fresh handle for the follow-up run
    ///
    /// Returns `None` when `current` is no longer the registered handle.
    pub fn swap(&self, task_id: &str, current: &Arc<RunHandle>) -> Option<Arc<RunHandle>> {
        let mut handles = self.handles.lock();
        match handles.get(task_id) {
            Some(existing) if Arc::ptr_eq(existing, current) => {
                let next = Arc::new(RunHandle::new());
                handles.insert(task_id.to_string(), Arc::clone(&next));
                Some(next)
            }
            _ => None,
        }
    }

    /// Remove `handle` if it is still the registered one
    pub fn release(&self, task_id: &str, handle: &Arc<RunHandle>) -> bool {
        let removed = {
            let mut handles = self.handles.lock();
            match handles.get(task_id) {
                Some(existing) if Arc::ptr_eq(existing, handle) => {
                    handles.remove(task_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            debug!(task_id, "Released run slot");
            self.released.send_modify(|n| *n = n.wrapping_add(1));
        }
        removed
    }

    /// Resolve once the task has no in-flight run
    pub async fn wait_released(&self, task_id: &str) {
        let mut rx = self.released.subscribe();
        loop {
            if !self.is_active(task_id) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}
