//! Task Events - 엔진이 발행하는 변경 알림

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Change notification for front ends
///
/// Serialized with an internal `type` tag:
///
/// ```text
/// {"type":"tasks_changed","taskId":"a1b2c3","reason":"running","at":"..."}
/// {"type":"account_rotated","taskId":"a1b2c3","from":"a","to":"b","at":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Any meaningful mutation of a task or its runs
    #[serde(rename_all = "camelCase")]
    TasksChanged {
        task_id: String,
        reason: String,
        at: DateTime<Utc>,
    },

    /// The active credential moved on after a usage-limit failure
    #[serde(rename_all = "camelCase")]
    AccountRotated {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        at: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn changed(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        TaskEvent::TasksChanged {
            task_id: task_id.into(),
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn rotated(task_id: impl Into<String>, from: Option<&str>, to: impl Into<String>) -> Self {
        TaskEvent::AccountRotated {
            task_id: task_id.into(),
            from: from.map(str::to_string),
            to: to.into(),
            at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::TasksChanged { task_id, .. } | TaskEvent::AccountRotated { task_id, .. } => {
                task_id
            }
        }
    }

    /// Wire name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::TasksChanged { .. } => "tasks_changed",
            TaskEvent::AccountRotated { .. } => "account_rotated",
        }
    }
}
