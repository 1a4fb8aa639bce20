//! Event System - 변경 알림
//!
//! The engine's notifier publishes a [`TaskEvent`] on every meaningful task
//! mutation; front ends consume them through [`EventBus::receiver`].

mod bus;
mod types;

pub use bus::{EventBus, EventBusConfig};
pub use types::TaskEvent;
