//! Git environments
//!
//! An environment is a bare mirror at `environments/<envId>/mirror.git`,
//! shared by every task of that environment. Tasks get worktrees off it.
//! Worktree removal tolerates races with concurrent cleanup.

use crate::command::HostCommand;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use yard_foundation::{Error, Result};

pub const MIRROR_DIR: &str = "mirror.git";

/// git messages that mean the worktree is already gone
const WORKTREE_GONE: &[&str] = &["is not a working tree", "does not exist", "no such file"];

/// Git operations the engine needs from the environment collaborator
#[async_trait]
pub trait GitEnvironments: Send + Sync {
    fn mirror_dir(&self, env_id: &str) -> PathBuf;

    fn environment_exists(&self, env_id: &str) -> bool {
        self.mirror_dir(env_id).is_dir()
    }

    /// Resolve a branch name, tag or commit hash to a commit id
    async fn resolve_ref(&self, env_id: &str, reference: &str) -> Result<String>;

    /// New branch `branch` at `base`, checked out at `path`
    async fn add_worktree(&self, env_id: &str, path: &Path, branch: &str, base: &str) -> Result<()>;

    /// Detached checkout of `reference` at `path`
    async fn add_detached_worktree(&self, env_id: &str, path: &Path, reference: &str) -> Result<()>;

    async fn remove_worktree(&self, env_id: &str, path: &Path) -> Result<()>;
}

/// git CLI against bare mirrors
pub struct GitMirror {
    environments_dir: PathBuf,
    git_bin: String,
    timeout: Duration,
}

impl GitMirror {
    pub fn new(environments_dir: impl Into<PathBuf>) -> Self {
        let git_bin = which::which("git")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "git".to_string());
        Self {
            environments_dir: environments_dir.into(),
            git_bin,
            timeout: Duration::from_secs(300),
        }
    }

    fn git(&self, env_id: &str) -> HostCommand {
        HostCommand::new(&self.git_bin)
            .arg("--git-dir")
            .arg(self.mirror_dir(env_id).display().to_string())
            .timeout(self.timeout)
    }
}

#[async_trait]
impl GitEnvironments for GitMirror {
    fn mirror_dir(&self, env_id: &str) -> PathBuf {
        self.environments_dir.join(env_id).join(MIRROR_DIR)
    }

    async fn resolve_ref(&self, env_id: &str, reference: &str) -> Result<String> {
        if reference.starts_with('-') {
            return Err(Error::invalid(format!("Invalid ref: {}", reference)));
        }
        let out = self
            .git(env_id)
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{}^{{commit}}", reference))
            .run(None)
            .await
            .map_err(|e| match e {
                crate::command::CommandError::Failed { .. } => {
                    Error::invalid(format!("Unknown ref {} in {}", reference, env_id))
                }
                other => other.into(),
            })?;
        Ok(out.stdout_trimmed().to_string())
    }

    async fn add_worktree(&self, env_id: &str, path: &Path, branch: &str, base: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.git(env_id)
            .args(["worktree", "add", "-b", branch])
            .arg(path.display().to_string())
            .arg(base)
            .run(None)
            .await?;
        debug!(env_id, branch, path = %path.display(), "Added worktree");
        Ok(())
    }

    async fn add_detached_worktree(&self, env_id: &str, path: &Path, reference: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.git(env_id)
            .args(["worktree", "add", "--detach"])
            .arg(path.display().to_string())
            .arg(reference)
            .run(None)
            .await?;
        debug!(env_id, path = %path.display(), "Added detached worktree");
        Ok(())
    }

    async fn remove_worktree(&self, env_id: &str, path: &Path) -> Result<()> {
        let result = self
            .git(env_id)
            .args(["worktree", "remove", "--force"])
            .arg(path.display().to_string())
            .run(None)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.stderr_contains(WORKTREE_GONE) => {
                debug!(env_id, path = %path.display(), "Worktree already gone")
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.git(env_id).args(["worktree", "prune"]).run(None).await {
            warn!(env_id, "git worktree prune failed: {}", e);
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
