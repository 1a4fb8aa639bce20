//! Sidecar Controller - per-task nested container engine
//!
//! Each task may own one docker-in-docker container:
//! - container `<prefix>-<taskId>`, privileged
//! - data volume `<prefix>-<taskId>-data` on `/var/lib/docker`
//! - host socket directory `tasks/<taskId>/sidecar/` holding `docker.sock`
//!
//! The sidecar outlives single runs; `stop` keeps volume and socket
//! directory for the next resume, `remove` deletes everything.
//!
//! Every docker invocation carries its own timeout and the caller's
//! cancellation token. A cancelled call reports [`Error::Cancelled`], never
//! a command error.

use crate::command::{CommandError, HostCommand};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yard_foundation::{Error, Result, SidecarConfig};

/// Socket directory mount point inside the sidecar
const SOCKET_MOUNT: &str = "/var/run/dind";

/// Socket file name inside the socket directory
pub const SOCKET_FILE: &str = "docker.sock";

/// docker messages meaning "already gone"
const GONE_MARKERS: &[&str] = &["no such container", "no such volume", "not found"];

/// Per-task sidecar lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarState {
    Absent,
    Creating,
    Ready,
    Stopped,
    Removed,
}

impl SidecarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SidecarState::Absent => "absent",
            SidecarState::Creating => "creating",
            SidecarState::Ready => "ready",
            SidecarState::Stopped => "stopped",
            SidecarState::Removed => "removed",
        }
    }
}

/// Sidecar operations used by the engine
#[async_trait]
pub trait SidecarController: Send + Sync {
    /// Create or start the sidecar and wait until its engine answers;
    /// returns the host socket path
    async fn ensure(&self, task_id: &str, cancel: &CancellationToken) -> Result<PathBuf>;

    /// Stop the container, keeping volume and socket directory
    async fn stop(&self, task_id: &str) -> Result<()>;

    /// Remove container, volume and socket directory
    async fn remove(&self, task_id: &str) -> Result<()>;

    /// Whether the container exists
    async fn exists(&self, task_id: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Last state observed by this controller
    fn state(&self, task_id: &str) -> SidecarState;
}

/// Sidecar backed by the docker CLI
pub struct DockerSidecar {
    config: SidecarConfig,
    /// `tasks/` root; socket directories live under `<root>/<taskId>/sidecar`
    tasks_root: PathBuf,
    states: Mutex<HashMap<String, SidecarState>>,
}

impl DockerSidecar {
    pub fn new(config: SidecarConfig, tasks_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            tasks_root: tasks_root.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn container_name(&self, task_id: &str) -> String {
        format!("{}-{}", self.config.name_prefix, task_id)
    }

    pub fn volume_name(&self, task_id: &str) -> String {
        format!("{}-{}-data", self.config.name_prefix, task_id)
    }

    pub fn socket_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_root.join(task_id).join("sidecar")
    }

    pub fn socket_path(&self, task_id: &str) -> PathBuf {
        self.socket_dir(task_id).join(SOCKET_FILE)
    }

    fn set_state(&self, task_id: &str, state: SidecarState) {
        debug!(task_id, state = state.as_str(), "Sidecar state");
        self.states.lock().insert(task_id.to_string(), state);
    }

    fn docker(&self) -> HostCommand {
        HostCommand::new(&self.config.docker_bin).timeout(self.config.command_timeout())
    }

    /// `Some(running)` when the container exists
    async fn inspect_running(
        &self,
        task_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<bool>> {
        let result = self
            .docker()
            .args(["container", "inspect", "-f", "{{.State.Running}}"])
            .arg(self.container_name(task_id))
            .run(cancel)
            .await;
        match result {
            Ok(out) => Ok(Some(out.stdout_trimmed() == "true")),
            Err(e) if e.stderr_contains(GONE_MARKERS) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_container(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let socket_dir = self.socket_dir(task_id);
        std::fs::create_dir_all(&socket_dir)?;

        info!(task_id, image = %self.config.image, "Creating sidecar");
        self.docker()
            .args(["run", "-d", "--privileged", "--name"])
            .arg(self.container_name(task_id))
            .arg("-v")
            .arg(format!("{}:/var/lib/docker", self.volume_name(task_id)))
            .arg("-v")
            .arg(format!("{}:{}", socket_dir.display(), SOCKET_MOUNT))
            .arg(&self.config.image)
            .arg("dockerd")
            .arg(format!("--host=unix://{}/{}", SOCKET_MOUNT, SOCKET_FILE))
            .run(Some(cancel))
            .await?;
        Ok(())
    }

    /// Poll the nested engine until it answers or the deadline passes
    ///
    /// Each poll has its own shorter timeout so one hung call cannot eat the
    /// whole budget.
    async fn wait_ready(&self, task_id: &str, socket: &Path, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout();
        let mut last_error = String::from("no readiness check completed");
        let mut attempts = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "Sidecar for task {} not ready after {}s ({} attempts): {}",
                    task_id, self.config.ready_timeout_secs, attempts, last_error
                )));
            }

            attempts += 1;
            let poll = HostCommand::new(&self.config.docker_bin)
                .arg("-H")
                .arg(format!("unix://{}", socket.display()))
                .args(["version", "--format", "{{.Server.Version}}"])
                .timeout(self.config.poll_command_timeout().min(remaining));

            match poll.run(Some(cancel)).await {
                Ok(out) => {
                    debug!(task_id, version = out.stdout_trimmed(), attempts, "Sidecar ready");
                    return Ok(());
                }
                Err(CommandError::Cancelled { .. }) => return Err(Error::Cancelled),
                Err(e) => last_error = e.to_string(),
            }

            let pause = self
                .config
                .poll_interval()
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn ensure_inner(&self, task_id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        self.docker()
            .args(["volume", "create"])
            .arg(self.volume_name(task_id))
            .run(Some(cancel))
            .await?;

        match self.inspect_running(task_id, Some(cancel)).await? {
            None => self.create_container(task_id, cancel).await?,
            Some(false) => {
                info!(task_id, "Starting stopped sidecar");
                std::fs::create_dir_all(self.socket_dir(task_id))?;
                self.docker()
                    .arg("start")
                    .arg(self.container_name(task_id))
                    .run(Some(cancel))
                    .await?;
            }
            Some(true) => debug!(task_id, "Sidecar already running"),
        }

        let socket = self.socket_path(task_id);
        self.wait_ready(task_id, &socket, cancel).await?;
        Ok(socket)
    }
}

#[async_trait]
impl SidecarController for DockerSidecar {
    async fn ensure(&self, task_id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        self.set_state(task_id, SidecarState::Creating);
        let socket = self.ensure_inner(task_id, cancel).await?;
        self.set_state(task_id, SidecarState::Ready);
        info!(task_id, socket = %socket.display(), "Sidecar ready");
        Ok(socket)
    }

    async fn stop(&self, task_id: &str) -> Result<()> {
        let grace = self.config.stop_timeout_secs;
        let result = self
            .docker()
            .timeout(self.config.command_timeout() + Duration::from_secs(grace))
            .args(["stop", "-t"])
            .arg(grace.to_string())
            .arg(self.container_name(task_id))
            .run(None)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.stderr_contains(GONE_MARKERS) => {
                debug!(task_id, "Sidecar already gone")
            }
            Err(e) => return Err(e.into()),
        }
        self.set_state(task_id, SidecarState::Stopped);
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        let container = self
            .docker()
            .args(["rm", "-f"])
            .arg(self.container_name(task_id))
            .run(None)
            .await;
        if let Err(e) = container {
            if !e.stderr_contains(GONE_MARKERS) {
                return Err(e.into());
            }
        }

        let volume = self
            .docker()
            .args(["volume", "rm", "-f"])
            .arg(self.volume_name(task_id))
            .run(None)
            .await;
        if let Err(e) = volume {
            if !e.stderr_contains(GONE_MARKERS) {
                warn!(task_id, "Failed to remove sidecar volume: {}", e);
                return Err(e.into());
            }
        }

        match std::fs::remove_dir_all(self.socket_dir(task_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.set_state(task_id, SidecarState::Removed);
        info!(task_id, "Sidecar removed");
        Ok(())
    }

    async fn exists(&self, task_id: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.inspect_running(task_id, Some(cancel)).await?.is_some())
    }

    fn state(&self, task_id: &str) -> SidecarState {
        self.states
            .lock()
            .get(task_id)
            .copied()
            .unwrap_or(SidecarState::Absent)
    }
}
