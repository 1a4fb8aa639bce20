//! Create/resume requests and their validation
//!
//! Everything here runs before any side effect; failures are `InvalidInput`
//! (or `NotFound` for a missing environment).

use crate::git::GitEnvironments;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use yard_foundation::{Error, Result};

pub const REASONING_EFFORTS: &[&str] = &["minimal", "low", "medium", "high", "xhigh"];

fn model_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/-]{0,127}$").expect("valid model pattern")
    })
}

fn file_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._ -]{0,254}$").expect("valid file name pattern")
    })
}

fn branch_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,199}$").expect("valid branch pattern")
    })
}

/// Start a new task
#[derive(Debug, Clone, Default)]
pub struct CreateTaskRequest {
    pub env_id: String,
    pub prompt: String,
    /// Defaults to `yard/<taskId>`
    pub branch: Option<String>,
    /// Defaults to `HEAD` of the mirror
    pub base_ref: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub use_sidecar: bool,
    /// Other environments checked out read-only next to the task
    pub context_envs: Vec<String>,
    /// Host files copied into the task's attachments directory
    pub attachments: Vec<PathBuf>,
}

impl CreateTaskRequest {
    pub fn new(env_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            env_id: env_id.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    pub fn with_sidecar(mut self, use_sidecar: bool) -> Self {
        self.use_sidecar = use_sidecar;
        self
    }

    pub fn with_context_env(mut self, env_id: impl Into<String>) -> Self {
        self.context_envs.push(env_id.into());
        self
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    pub fn validate(&self, git: &dyn GitEnvironments) -> Result<()> {
        validate_prompt(&self.prompt)?;
        validate_model(self.model.as_deref())?;
        validate_reasoning_effort(self.reasoning_effort.as_deref())?;

        if self.env_id.trim().is_empty() {
            return Err(Error::invalid("Environment is required"));
        }
        if !git.environment_exists(&self.env_id) {
            return Err(Error::not_found(format!("Environment {}", self.env_id)));
        }
        if let Some(branch) = self.branch.as_deref() {
            if !branch_pattern().is_match(branch) || branch.contains("..") {
                return Err(Error::invalid(format!("Invalid branch name: {}", branch)));
            }
        }
        if let Some(base) = self.base_ref.as_deref() {
            if base.trim().is_empty() || base.starts_with('-') {
                return Err(Error::invalid(format!("Invalid base ref: {}", base)));
            }
        }

        let mut seen = HashSet::new();
        for env in &self.context_envs {
            if env == &self.env_id {
                return Err(Error::invalid(format!(
                    "Context environment {} is the task's own environment",
                    env
                )));
            }
            if !seen.insert(env.as_str()) {
                return Err(Error::invalid(format!("Duplicate context environment: {}", env)));
            }
            if !git.environment_exists(env) {
                return Err(Error::invalid(format!("Unknown context environment: {}", env)));
            }
        }

        let mut names = HashSet::new();
        for path in &self.attachments {
            let name = attachment_name(path)?;
            if !names.insert(name.clone()) {
                return Err(Error::invalid(format!("Duplicate attachment name: {}", name)));
            }
        }
        Ok(())
    }
}

/// Continue a task from its continuation token
#[derive(Debug, Clone, Default)]
pub struct ResumeTaskRequest {
    pub prompt: String,
    /// Falls back to the task's selection
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub use_sidecar: Option<bool>,
}

impl ResumeTaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_prompt(&self.prompt)?;
        validate_model(self.model.as_deref())?;
        validate_reasoning_effort(self.reasoning_effort.as_deref())
    }
}

fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(Error::invalid("Prompt is required"));
    }
    Ok(())
}

fn validate_model(model: Option<&str>) -> Result<()> {
    match model {
        Some(m) if !model_pattern().is_match(m) => {
            Err(Error::invalid(format!("Invalid model: {}", m)))
        }
        _ => Ok(()),
    }
}

fn validate_reasoning_effort(effort: Option<&str>) -> Result<()> {
    match effort {
        Some(e) if !REASONING_EFFORTS.contains(&e) => Err(Error::invalid(format!(
            "Invalid reasoning effort: {} (expected one of {})",
            e,
            REASONING_EFFORTS.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Name an attachment is stored under; the source must be a regular file
pub fn attachment_name(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .map_err(|_| Error::invalid(format!("Attachment not found: {}", path.display())))?;
    if !meta.is_file() {
        return Err(Error::invalid(format!(
            "Attachment is not a regular file: {}",
            path.display()
        )));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if !file_name_pattern().is_match(&name) {
        return Err(Error::invalid(format!("Unsafe attachment name: {}", name)));
    }
    Ok(name)
}
