//! Event Bus - 변경 알림 브로드캐스트
//!
//! A `tokio::sync::broadcast` channel plus a bounded history of the most
//! recent events, so a late subscriber can catch up on what it missed.

use super::types::TaskEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// 이벤트 버스 설정
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Slots per receiver before it starts lagging
    pub channel_capacity: usize,

    /// Events kept for [`EventBus::recent`]
    pub history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history_size: 100,
        }
    }
}

/// 이벤트 버스
///
/// `publish` is synchronous and never fails; with no receivers the event
/// only lands in the history.
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
    history: Mutex<VecDeque<TaskEvent>>,
    history_size: usize,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            history_size: config.history_size,
            published: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: TaskEvent) {
        let seq = self.published.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(seq, kind = event.kind(), task_id = event.task_id(), "Publishing event");

        if self.history_size > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.sender.send(event);
    }

    /// Receiver for everything published from now on
    pub fn receiver(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Most recent events for one task, oldest first
    pub fn recent(&self, task_id: &str) -> Vec<TaskEvent> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.task_id() == task_id)
            .cloned()
            .collect()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
