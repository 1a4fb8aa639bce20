//! Yard Config - 통합 설정
//!
//! Engine-wide settings: where task data lives, how the agent binary is
//! invoked, how the per-task sidecar engine is provisioned, and the rotation
//! policy. Files are layered (global, then data dir) and deep-merged, so a
//! later file only needs the keys it overrides.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// 설정 파일명
pub const YARD_CONFIG_FILE: &str = "config.json";

/// Overrides the data directory
pub const ENV_YARD_HOME: &str = "YARD_HOME";

/// Overrides `agent.command`
pub const ENV_YARD_AGENT_BIN: &str = "YARD_AGENT_BIN";

// ============================================================================
// Yard Config (통합)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YardConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root for `tasks/`, `environments/` and `accounts/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for YardConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: None,
            agent: AgentConfig::default(),
            sidecar: SidecarConfig::default(),
            rotation: RotationConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl YardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 데이터 디렉토리 병합 로드, then environment overrides
    pub fn load() -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if let Ok(global) = JsonStore::global() {
            if let Some(value) = global.load_optional::<Value>(YARD_CONFIG_FILE)? {
                merge_json(&mut merged, value);
            }
        }

        let mut config: YardConfig = serde_json::from_value(merged.clone())
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.apply_env_overrides();

        let local = JsonStore::new(config.data_dir());
        if let Some(value) = local.load_optional::<Value>(YARD_CONFIG_FILE)? {
            merge_json(&mut merged, value);
            config = serde_json::from_value(merged)
                .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
            config.apply_env_overrides();
        }

        Ok(config)
    }

    /// Load a single file on top of defaults
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        if let Some(value) = store.load_optional::<Value>(YARD_CONFIG_FILE)? {
            merge_json(&mut merged, value);
        }
        serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        JsonStore::global()?.save(YARD_CONFIG_FILE, self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(home) = std::env::var(ENV_YARD_HOME) {
            if !home.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(home));
            }
        }
        if let Ok(bin) = std::env::var(ENV_YARD_AGENT_BIN) {
            if !bin.trim().is_empty() {
                self.agent.command = bin;
            }
        }
    }

    // ========================================================================
    // Resolved paths
    // ========================================================================

    /// Effective data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("yard")
        })
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir().join("tasks")
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.data_dir().join("environments")
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.data_dir().join("accounts")
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent.command = command.into();
        self
    }
}

fn default_version() -> u32 {
    1
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ============================================================================
// Agent Config
// ============================================================================

/// How the external agent binary is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Agent executable (a wrapper that launches the agent in its container)
    pub command: String,

    /// Arguments placed before everything else on every run
    pub exec_args: Vec<String>,

    /// Arguments inserted before the continuation token on resume
    pub resume_args: Vec<String>,

    pub model_flag: String,

    pub reasoning_flag: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_reasoning_effort: Option<String>,

    /// Host directory the active credential is materialized into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_home: Option<PathBuf>,

    /// Where the credential home appears inside the agent container
    pub credential_target: String,

    /// Seconds between the graceful stop signal and the forced kill
    pub stop_grace_secs: u64,

    /// Per-environment variable overrides, copied verbatim into the agent env
    pub env: HashMap<String, BTreeMap<String, String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            exec_args: vec!["exec".to_string(), "--json".to_string()],
            resume_args: vec!["resume".to_string()],
            model_flag: "--model".to_string(),
            reasoning_flag: "-c".to_string(),
            default_model: None,
            default_reasoning_effort: None,
            credential_home: None,
            credential_target: "/root/.codex".to_string(),
            stop_grace_secs: 5,
            env: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Effective credential home (`~/.codex` unless configured)
    pub fn credential_home(&self) -> PathBuf {
        self.credential_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".codex")
        })
    }

    /// Overrides configured for one environment
    pub fn env_for(&self, env_id: &str) -> BTreeMap<String, String> {
        self.env.get(env_id).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Sidecar Config
// ============================================================================

/// Nested container engine provisioned per task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarConfig {
    pub docker_bin: String,
    pub image: String,
    pub name_prefix: String,
    pub ready_timeout_secs: u64,
    pub poll_interval_millis: u64,
    pub poll_command_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "docker:dind".to_string(),
            name_prefix: "yard-sidecar".to_string(),
            ready_timeout_secs: 60,
            poll_interval_millis: 1000,
            poll_command_timeout_secs: 5,
            command_timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

impl SidecarConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn poll_command_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_command_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ============================================================================
// Rotation Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RotationConfig {
    pub enabled: bool,

    /// Overrides the default cap of `accountCount - 1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_auto_rotations: Option<u32>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_auto_rotations: None,
        }
    }
}

// ============================================================================
// Probe Config
// ============================================================================

/// Rate-limit probe process (line-delimited JSON-RPC over stdio)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    pub command: String,
    pub args: Vec<String>,

    /// Variable pointing the probe at one account's credential home
    pub home_env: String,

    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["app-server".to_string()],
            home_env: "CODEX_HOME".to_string(),
            timeout_secs: 15,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = YardConfig::default();
        assert_eq!(config.agent.stop_grace_secs, 5);
        assert_eq!(config.sidecar.name_prefix, "yard-sidecar");
        assert!(config.rotation.enabled);
        assert!(config.rotation.max_auto_rotations.is_none());
    }

    #[test]
    fn test_merge_json_overlays_nested_keys() {
        let mut base = serde_json::to_value(YardConfig::default()).unwrap();
        merge_json(
            &mut base,
            json!({ "sidecar": { "image": "docker:27-dind" }, "rotation": { "maxAutoRotations": 2 } }),
        );

        let config: YardConfig = serde_json::from_value(base).unwrap();
        assert_eq!(config.sidecar.image, "docker:27-dind");
        assert_eq!(config.sidecar.docker_bin, "docker");
        assert_eq!(config.rotation.max_auto_rotations, Some(2));
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(YARD_CONFIG_FILE),
            r#"{ "agent": { "command": "/opt/agent", "env": { "env-1": { "FOO": "bar" } } } }"#,
        )
        .unwrap();

        let config = YardConfig::load_from(&JsonStore::new(dir.path())).unwrap();
        assert_eq!(config.agent.command, "/opt/agent");
        assert_eq!(config.agent.exec_args, vec!["exec", "--json"]);
        assert_eq!(config.agent.env_for("env-1").get("FOO").map(String::as_str), Some("bar"));
        assert!(config.agent.env_for("other").is_empty());
    }

    #[test]
    fn test_resolved_dirs() {
        let config = YardConfig::default().with_data_dir("/srv/yard");
        assert_eq!(config.tasks_dir(), PathBuf::from("/srv/yard/tasks"));
        assert_eq!(config.accounts_dir(), PathBuf::from("/srv/yard/accounts"));
    }
}
