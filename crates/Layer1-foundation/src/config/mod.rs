//! Config - 통합 설정 관리
//!
//! - `yard.rs` - YardConfig 통합 설정 (agent, sidecar, rotation, probe)

mod yard;

pub use yard::{
    merge_json, AgentConfig, ProbeConfig, RotationConfig, SidecarConfig, YardConfig,
    ENV_YARD_AGENT_BIN, ENV_YARD_HOME, YARD_CONFIG_FILE,
};
