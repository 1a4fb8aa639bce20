//! Shared fakes for engine integration tests
//!
//! - `FakeGit`: directory-backed environments, worktrees are plain dirs
//! - `FakeSidecar`: in-memory controller with a controllable readiness delay
//! - agent: a shell script; every script logs its argv and touches `spawned`

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use yard_foundation::{Error, Result, YardConfig};
use yard_task::credentials::{ACCOUNTS_INDEX_FILE, AUTH_FILE};
use yard_task::{
    FileCredentialStore, GitEnvironments, Notifier, SidecarController, SidecarState, Task,
    TaskEngine, TaskId,
};

pub const THREAD_ID: &str = "thr_test";

// ============================================================================
// Git
// ============================================================================

pub struct FakeGit {
    environments: PathBuf,
    removed: Mutex<Vec<PathBuf>>,
}

impl FakeGit {
    pub fn new(environments: impl Into<PathBuf>, envs: &[&str]) -> Self {
        let environments = environments.into();
        for env in envs {
            std::fs::create_dir_all(environments.join(env).join("mirror.git")).unwrap();
        }
        Self {
            environments,
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl GitEnvironments for FakeGit {
    fn mirror_dir(&self, env_id: &str) -> PathBuf {
        self.environments.join(env_id).join("mirror.git")
    }

    async fn resolve_ref(&self, _env_id: &str, reference: &str) -> Result<String> {
        if reference == "missing" {
            return Err(Error::invalid(format!("Unknown ref: {}", reference)));
        }
        Ok("4b825dc642cb6eb9a060e54bf8d69288fbee4904".to_string())
    }

    async fn add_worktree(&self, env_id: &str, path: &Path, branch: &str, _base: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join("README.md"), format!("{} on {}\n", env_id, branch))?;
        Ok(())
    }

    async fn add_detached_worktree(&self, env_id: &str, path: &Path, _reference: &str) -> Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join("README.md"), format!("{} (detached)\n", env_id))?;
        Ok(())
    }

    async fn remove_worktree(&self, _env_id: &str, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.removed.lock().push(path.to_path_buf());
        Ok(())
    }
}

// ============================================================================
// Sidecar
// ============================================================================

pub struct FakeSidecar {
    root: PathBuf,
    ready_delay_ms: AtomicU64,
    fail: AtomicBool,
    pub ensure_calls: AtomicUsize,
    live: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, SidecarState>>,
}

impl FakeSidecar {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ready_delay_ms: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            ensure_calls: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            removed: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_ready_delay(&self, delay: Duration) {
        self.ready_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn is_live(&self, task_id: &str) -> bool {
        self.live.lock().contains(task_id)
    }

    fn set_state(&self, task_id: &str, state: SidecarState) {
        self.states.lock().insert(task_id.to_string(), state);
    }
}

#[async_trait]
impl SidecarController for FakeSidecar {
    async fn ensure(&self, task_id: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(task_id.to_string());
        self.set_state(task_id, SidecarState::Creating);

        let delay = Duration::from_millis(self.ready_delay_ms.load(Ordering::SeqCst));
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Timeout(
                "Sidecar not ready after 60s: Cannot connect to the Docker daemon".to_string(),
            ));
        }

        let socket = self.root.join(task_id).join("docker.sock");
        std::fs::create_dir_all(self.root.join(task_id))?;
        std::fs::write(&socket, "")?;
        self.set_state(task_id, SidecarState::Ready);
        Ok(socket)
    }

    async fn stop(&self, task_id: &str) -> Result<()> {
        self.stopped.lock().push(task_id.to_string());
        self.set_state(task_id, SidecarState::Stopped);
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.live.lock().remove(task_id);
        self.removed.lock().push(task_id.to_string());
        self.set_state(task_id, SidecarState::Removed);
        Ok(())
    }

    async fn exists(&self, task_id: &str, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.is_live(task_id))
    }

    fn state(&self, task_id: &str) -> SidecarState {
        self.states
            .lock()
            .get(task_id)
            .copied()
            .unwrap_or(SidecarState::Absent)
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Records every notification as `kind:task:detail`
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn rotations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("rotated:"))
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn tasks_changed(&self, task_id: &str, reason: &str) {
        self.events.lock().push(format!("changed:{}:{}", task_id, reason));
    }

    fn account_rotated(&self, task_id: &str, from: Option<&str>, to: &str) {
        self.events
            .lock()
            .push(format!("rotated:{}:{}->{}", task_id, from.unwrap_or("-"), to));
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub engine: TaskEngine,
    pub git: Arc<FakeGit>,
    pub sidecar: Arc<FakeSidecar>,
    pub credentials: Arc<FileCredentialStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub struct HarnessBuilder {
    body: String,
    accounts: Vec<(String, String)>,
    active: Option<String>,
    configure: Option<Box<dyn FnOnce(&mut YardConfig)>>,
}

impl HarnessBuilder {
    pub fn agent(body: &str) -> Self {
        Self {
            body: body.to_string(),
            accounts: Vec::new(),
            active: None,
            configure: None,
        }
    }

    /// Stored credentials `(id, auth.json content)`; the first is active
    pub fn accounts(mut self, accounts: &[(&str, &str)]) -> Self {
        self.accounts = accounts
            .iter()
            .map(|(id, auth)| (id.to_string(), auth.to_string()))
            .collect();
        self.active = accounts.first().map(|(id, _)| id.to_string());
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut YardConfig) + 'static) -> Self {
        self.configure = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let data = root.join("data");
        let home = root.join("home");

        let agent = root.join("agent.sh");
        let script = AGENT_PRELUDE
            .replace("@ROOT@", &root.display().to_string())
            .replace("@HOME@", &home.display().to_string())
            + &self
                .body
                .replace("@ROOT@", &root.display().to_string())
                .replace("@HOME@", &home.display().to_string());
        std::fs::write(&agent, script).unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = YardConfig::default()
            .with_data_dir(&data)
            .with_agent_command(agent.display().to_string());
        config.agent.credential_home = Some(home.clone());
        config.agent.stop_grace_secs = 2;
        if let Some(configure) = self.configure {
            configure(&mut config);
        }

        write_accounts(&config.accounts_dir(), &self.accounts, self.active.as_deref());

        let git = Arc::new(FakeGit::new(config.environments_dir(), &["web", "api"]));
        let sidecar = Arc::new(FakeSidecar::new(root.join("sidecars")));
        let credentials = Arc::new(FileCredentialStore::new(config.accounts_dir(), &home));

        let notifier = Arc::new(RecordingNotifier::default());

        let engine = TaskEngine::builder(config)
            .git(git.clone())
            .sidecar(sidecar.clone())
            .credentials(credentials.clone())
            .notifier(notifier.clone())
            .build();

        Harness {
            dir,
            engine,
            git,
            sidecar,
            credentials,
            notifier,
        }
    }
}

impl Harness {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn agent_spawned(&self) -> bool {
        self.root().join("spawned").exists()
    }

    pub fn open_gate(&self) {
        std::fs::write(self.root().join("gate"), "").unwrap();
    }

    pub fn stored_auth(&self, account_id: &str) -> Vec<u8> {
        std::fs::read(self.credentials.account_auth_path(account_id)).unwrap()
    }

    pub fn active_account(&self) -> Option<String> {
        use yard_task::CredentialStore;
        self.credentials.active_account().unwrap().map(|a| a.id)
    }

    pub async fn wait_idle(&self, id: &TaskId) -> Task {
        tokio::time::timeout(Duration::from_secs(20), self.engine.wait_idle(id))
            .await
            .expect("task did not go idle")
            .unwrap()
    }

    pub fn stderr_log(&self, id: &TaskId, run: &str) -> String {
        self.engine
            .read_log(id, Some(run), yard_task::LogStream::Stderr, None)
            .unwrap_or_default()
    }
}

fn write_accounts(dir: &Path, accounts: &[(String, String)], active: Option<&str>) {
    if accounts.is_empty() {
        return;
    }
    std::fs::create_dir_all(dir).unwrap();
    let index = serde_json::json!({
        "activeAccountId": active,
        "accounts": accounts
            .iter()
            .map(|(id, _)| serde_json::json!({ "id": id, "label": format!("{}@example.com", id) }))
            .collect::<Vec<_>>(),
    });
    std::fs::write(
        dir.join(ACCOUNTS_INDEX_FILE),
        serde_json::to_vec_pretty(&index).unwrap(),
    )
    .unwrap();
    for (id, auth) in accounts {
        std::fs::create_dir_all(dir.join(id)).unwrap();
        std::fs::write(dir.join(id).join(AUTH_FILE), auth).unwrap();
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ============================================================================
// Agent scripts
// ============================================================================

const AGENT_PRELUDE: &str = r#"#!/bin/sh
echo "args: $*" >&2
echo "docker_host=${DOCKER_HOST:-none}" >&2
echo "rw_paths=${YARD_RW_PATHS:-}" >&2
echo "passthrough=${YARD_ENV_PASSTHROUGH:-}" >&2
touch "@ROOT@/spawned"
case " $* " in
  *" resume "*) resumed=1 ;;
  *) resumed=0 ;;
esac
auth=$(cat "@HOME@/auth.json" 2>/dev/null)
"#;

/// Reports a thread on fresh runs and succeeds
pub const AGENT_OK: &str = r#"
if [ "$resumed" = 0 ]; then
  echo '{"type":"thread.started","thread_id":"thr_test"}'
fi
echo '{"type":"item.completed","item":{"type":"agent_message","text":"done"}}'
exit 0
"#;

/// Fails on a usage limit whenever the applied credential says `exhausted`
pub const AGENT_QUOTA: &str = r#"
echo '{"type":"thread.started","thread_id":"thr_test"}'
case "$auth" in
  *exhausted*)
    echo '{"type":"turn.failed","error":{"message":"You have hit your usage limit. Try again later."}}'
    exit 1
    ;;
esac
exit 0
"#;

/// Reports a thread, then blocks until the test opens the gate
pub const AGENT_GATED: &str = r#"
echo '{"type":"thread.started","thread_id":"thr_test"}'
while [ ! -f "@ROOT@/gate" ]; do sleep 0.05; done
case "$auth" in
  *exhausted*)
    echo '{"type":"error","message":"usage_limit_reached"}'
    exit 1
    ;;
esac
exit 0
"#;
