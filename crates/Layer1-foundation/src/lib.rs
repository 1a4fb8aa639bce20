//! # yard-foundation
//!
//! Foundation layer for Yard:
//! - Error: 공통 에러 타입 (taxonomy shared by every layer)
//! - Config: 통합 설정 (YardConfig - agent, sidecar, rotation, probe)
//! - Storage: JsonStore (task records, config, account index)
//! - Event: EventBus (`TaskEvent` change notifications)

pub mod config;
pub mod error;
pub mod event;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AgentConfig, ProbeConfig, RotationConfig, SidecarConfig, YardConfig, YARD_CONFIG_FILE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;

// ============================================================================
// Event (이벤트 시스템)
// ============================================================================
pub use event::{EventBus, EventBusConfig, TaskEvent};
