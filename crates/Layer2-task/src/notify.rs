//! Change notifications
//!
//! Fire-and-forget: a notifier never fails or blocks the caller.

use std::sync::Arc;
use yard_foundation::{EventBus, TaskEvent};

pub trait Notifier: Send + Sync {
    /// A task or one of its runs changed
    fn tasks_changed(&self, task_id: &str, reason: &str);

    /// The active credential was rotated on behalf of a task
    fn account_rotated(&self, _task_id: &str, _from: Option<&str>, _to: &str) {}
}

/// Default: drops everything
#[derive(Debug, Default, Clone)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn tasks_changed(&self, _task_id: &str, _reason: &str) {}
}

/// Publishes [`TaskEvent`]s onto the foundation [`EventBus`]
#[derive(Clone)]
pub struct BusNotifier {
    bus: Arc<EventBus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl Notifier for BusNotifier {
    fn tasks_changed(&self, task_id: &str, reason: &str) {
        self.bus.publish(TaskEvent::changed(task_id, reason));
    }

    fn account_rotated(&self, task_id: &str, from: Option<&str>, to: &str) {
        self.bus.publish(TaskEvent::rotated(task_id, from, to));
    }
}
