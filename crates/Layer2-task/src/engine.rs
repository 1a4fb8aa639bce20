//! Task Engine - task lifecycle over injected collaborators
//!
//! Control flow per run attempt:
//!
//! ```text
//! create/resume ─► launch_run ─► (sidecar) ─► credentials ─► mounts ─► Launcher
//!                      ▲                                                   │
//!                      │                                                   ▼
//!                 rotation ◄──────────────── RunFinalizer ◄──────── process exit
//! ```
//!
//! Setup failures surface synchronously from `create`/`resume`; anything
//! after the process is launched is only visible through the task record and
//! the notifier. A task keeps its registry slot from reservation until its
//! last run (including rotation-driven follow-ups) has been finalized.

use crate::agent::{self, Invocation};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::finalizer::{FinalizedRun, RunFinalizer, INTERRUPTED_MESSAGE};
use crate::git::{GitEnvironments, GitMirror};
use crate::log::{append_line, read_tail, LogStream};
use crate::mount::{agent_env, HostMountComposer, MountComposer, MountInputs, RunConfig};
use crate::notify::{NoopNotifier, Notifier};
use crate::registry::{RunHandle, RunRegistry};
use crate::request::{attachment_name, CreateTaskRequest, ResumeTaskRequest};
use crate::rotation::{CappedRoundRobin, RotationContext, RotationDecision, RotationPolicy};
use crate::sidecar::{DockerSidecar, SidecarController};
use crate::state::TaskStatus;
use crate::store::TaskStore;
use crate::supervisor::{Launcher, ProcessOutcome, ProcessSupervisor};
use crate::task::{Attachment, ContextRepo, Run, RunKind, Task, TaskId};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use yard_foundation::{Error, Result, YardConfig};

pub const SIDECAR_TIMEOUT_MESSAGE: &str = "Sidecar did not become ready in time";
pub const SETUP_FAILED_MESSAGE: &str = "Run setup failed; see the run's error log";

/// Base ref used when a create request names none
const DEFAULT_BASE_REF: &str = "HEAD";

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`TaskEngine`]; unset collaborators get the host defaults
pub struct TaskEngineBuilder {
    config: YardConfig,
    git: Option<Arc<dyn GitEnvironments>>,
    sidecar: Option<Arc<dyn SidecarController>>,
    launcher: Option<Arc<dyn Launcher>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    mounts: Option<Arc<dyn MountComposer>>,
    rotation: Option<Arc<dyn RotationPolicy>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl TaskEngineBuilder {
    pub fn new(config: YardConfig) -> Self {
        Self {
            config,
            git: None,
            sidecar: None,
            launcher: None,
            credentials: None,
            mounts: None,
            rotation: None,
            notifier: None,
        }
    }

    pub fn git(mut self, git: Arc<dyn GitEnvironments>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn sidecar(mut self, sidecar: Arc<dyn SidecarController>) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn mounts(mut self, mounts: Arc<dyn MountComposer>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    pub fn rotation(mut self, rotation: Arc<dyn RotationPolicy>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> TaskEngine {
        let config = self.config;
        let store = Arc::new(TaskStore::new(config.tasks_dir()));

        let git = self
            .git
            .unwrap_or_else(|| Arc::new(GitMirror::new(config.environments_dir())));
        let sidecar = self.sidecar.unwrap_or_else(|| {
            Arc::new(DockerSidecar::new(config.sidecar.clone(), config.tasks_dir()))
        });
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessSupervisor::new(config.agent.stop_grace())));
        let credentials = self.credentials.unwrap_or_else(|| {
            Arc::new(FileCredentialStore::new(
                config.accounts_dir(),
                config.agent.credential_home(),
            ))
        });
        let mounts = self.mounts.unwrap_or_else(|| Arc::new(HostMountComposer));
        let rotation = self
            .rotation
            .unwrap_or_else(|| Arc::new(CappedRoundRobin::new(&config.rotation)));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));

        let finalizer = RunFinalizer::new(
            Arc::clone(&store),
            Arc::clone(&credentials),
            Arc::clone(&notifier),
        );

        TaskEngine {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry: Arc::new(RunRegistry::new()),
                git,
                sidecar,
                launcher,
                credentials,
                mounts,
                rotation,
                notifier,
                finalizer,
            }),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    config: YardConfig,
    store: Arc<TaskStore>,
    registry: Arc<RunRegistry>,
    git: Arc<dyn GitEnvironments>,
    sidecar: Arc<dyn SidecarController>,
    launcher: Arc<dyn Launcher>,
    credentials: Arc<dyn CredentialStore>,
    mounts: Arc<dyn MountComposer>,
    rotation: Arc<dyn RotationPolicy>,
    notifier: Arc<dyn Notifier>,
    finalizer: RunFinalizer,
}

/// Parameters of one run attempt
#[derive(Debug, Clone)]
struct LaunchSpec {
    kind: RunKind,
    prompt: String,
    model: Option<String>,
    reasoning_effort: Option<String>,
    use_sidecar: bool,
}

/// Sidecar touched by the current attempt
#[derive(Debug, Clone, Copy)]
struct SidecarLease {
    /// Existed before this attempt; released by stop, not remove
    pre_existing: bool,
}

/// Task run and credential-rotation engine
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Engine with host collaborators
    pub fn new(config: YardConfig) -> Self {
        TaskEngineBuilder::new(config).build()
    }

    pub fn builder(config: YardConfig) -> TaskEngineBuilder {
        TaskEngineBuilder::new(config)
    }

    pub fn config(&self) -> &YardConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.inner.registry
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.credentials
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, task_id: &TaskId) -> Result<Task> {
        self.inner.store.load(task_id)
    }

    /// All tasks, newest first
    pub fn list(&self) -> Result<Vec<Task>> {
        self.inner.store.list()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.inner.registry.is_active(task_id.as_str())
    }

    /// Tail of one run's log; the latest run when `run_label` is `None`
    pub fn read_log(
        &self,
        task_id: &TaskId,
        run_label: Option<&str>,
        stream: LogStream,
        lines: Option<usize>,
    ) -> Result<String> {
        let task = self.inner.store.load(task_id)?;
        let run = match run_label {
            Some(label) => task.run(label),
            None => task.latest_run(),
        }
        .ok_or_else(|| {
            Error::not_found(format!(
                "Run {} of task {}",
                run_label.unwrap_or("(latest)"),
                task_id
            ))
        })?;
        read_tail(&self.inner.store.log_file(task_id, &run.label, stream), lines)
    }

    /// Resolve once the task has no run in flight (including rotations)
    pub async fn wait_idle(&self, task_id: &TaskId) -> Result<Task> {
        self.inner.registry.wait_released(task_id.as_str()).await;
        self.inner.store.load(task_id)
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Validate, build the workspace and launch the first run
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Task> {
        let inner = &self.inner;
        request.validate(inner.git.as_ref())?;

        let id = TaskId::new();
        let base_ref = request.base_ref.as_deref().unwrap_or(DEFAULT_BASE_REF);
        let base_commit = inner.git.resolve_ref(&request.env_id, base_ref).await?;
        let branch = request
            .branch
            .clone()
            .unwrap_or_else(|| format!("yard/{}", id));

        let handle = inner.registry.try_reserve(id.as_str())?;

        let task = match self
            .prepare_workspace(&id, &request, &branch, &base_commit)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                inner.registry.release(id.as_str(), &handle);
                return Err(e);
            }
        };
        if let Err(e) = inner.store.save(&task) {
            self.discard_workspace(&task).await;
            inner.registry.release(id.as_str(), &handle);
            return Err(e);
        }
        info!(task_id = %id, env = %task.env_id, branch = %task.branch, "Task created");

        let spec = LaunchSpec {
            kind: RunKind::Fresh,
            prompt: request.prompt.clone(),
            model: request
                .model
                .clone()
                .or_else(|| inner.config.agent.default_model.clone()),
            reasoning_effort: request
                .reasoning_effort
                .clone()
                .or_else(|| inner.config.agent.default_reasoning_effort.clone()),
            use_sidecar: request.use_sidecar,
        };

        match self.launch_run(handle, &id, spec).await {
            Ok(task) => Ok(task),
            Err(e) => {
                self.discard_workspace(&task).await;
                if let Err(remove_err) = inner.store.remove(&id) {
                    warn!(task_id = %id, "Failed to remove task directory: {}", remove_err);
                }
                inner.notifier.tasks_changed(id.as_str(), "deleted");
                Err(e)
            }
        }
    }

    /// Worktree, context checkouts and attachments; rolled back on failure
    async fn prepare_workspace(
        &self,
        id: &TaskId,
        request: &CreateTaskRequest,
        branch: &str,
        base_commit: &str,
    ) -> Result<Task> {
        let inner = &self.inner;
        let worktree = inner.store.worktree_dir(id);
        let mut task = Task::new(id.clone(), &request.env_id, branch, &worktree, &request.prompt);
        task.base_commit = Some(base_commit.to_string());
        task.model = request.model.clone();
        task.reasoning_effort = request.reasoning_effort.clone();
        task.use_sidecar = request.use_sidecar;

        std::fs::create_dir_all(inner.store.task_dir(id))?;
        if let Err(e) = inner
            .git
            .add_worktree(&request.env_id, &worktree, branch, base_commit)
            .await
        {
            let _ = inner.store.remove(id);
            return Err(e);
        }

        let result = self.populate_workspace(&mut task, request).await;
        if let Err(e) = result {
            self.discard_workspace(&task).await;
            let _ = inner.store.remove(id);
            return Err(e);
        }
        Ok(task)
    }

    async fn populate_workspace(&self, task: &mut Task, request: &CreateTaskRequest) -> Result<()> {
        let inner = &self.inner;
        for env_id in &request.context_envs {
            let path = inner.store.context_dir(&task.id, env_id);
            inner
                .git
                .add_detached_worktree(env_id, &path, DEFAULT_BASE_REF)
                .await?;
            task.context_repos.push(ContextRepo {
                env_id: env_id.clone(),
                path,
            });
        }

        if !request.attachments.is_empty() {
            let dir = inner.store.attachments_dir(&task.id);
            std::fs::create_dir_all(&dir)?;
            for source in &request.attachments {
                let name = attachment_name(source)?;
                let size = std::fs::copy(source, dir.join(&name))?;
                task.attachments.push(Attachment { name, size });
            }
        }
        Ok(())
    }

    /// Best-effort removal of every worktree the task owns
    async fn discard_workspace(&self, task: &Task) {
        let git = &self.inner.git;
        for context in &task.context_repos {
            if let Err(e) = git.remove_worktree(&context.env_id, &context.path).await {
                warn!(task_id = %task.id, env = %context.env_id, "Failed to remove context worktree: {}", e);
            }
        }
        if let Err(e) = git.remove_worktree(&task.env_id, &task.worktree_path).await {
            warn!(task_id = %task.id, "Failed to remove worktree: {}", e);
        }
    }

    // ========================================================================
    // Resume
    // ========================================================================

    /// Continue the task's conversation with a new prompt
    pub async fn resume(&self, task_id: &TaskId, request: ResumeTaskRequest) -> Result<Task> {
        let inner = &self.inner;
        request.validate()?;

        let handle = inner.registry.try_reserve(task_id.as_str())?;
        let task = match inner.store.load(task_id) {
            Ok(task) => task,
            Err(e) => {
                inner.registry.release(task_id.as_str(), &handle);
                return Err(e);
            }
        };
        if task.thread_id.is_none() {
            inner.registry.release(task_id.as_str(), &handle);
            return Err(Error::Conflict(format!(
                "Task {} has no thread id to resume from",
                task_id
            )));
        }

        let spec = LaunchSpec {
            kind: RunKind::Resume,
            prompt: request.prompt,
            model: request.model.or(task.model),
            reasoning_effort: request.reasoning_effort.or(task.reasoning_effort),
            use_sidecar: request.use_sidecar.unwrap_or(task.use_sidecar),
        };
        self.launch_run(handle, task_id, spec).await
    }

    // ========================================================================
    // Stop / Delete
    // ========================================================================

    /// Request a stop; returns once the request is recorded, not on exit
    pub async fn stop(&self, task_id: &TaskId) -> Result<Task> {
        let inner = &self.inner;
        let Some(handle) = inner.registry.get(task_id.as_str()) else {
            return inner.store.load(task_id);
        };

        let first = handle.request_stop();
        let label = handle.run_label();
        let (task, marked) = inner.store.update(task_id, |task| {
            let Some(label) = label.as_deref() else {
                return false;
            };
            let Some(run) = task.latest_run_mut() else {
                return false;
            };
            if run.label != label || run.status != TaskStatus::Running {
                return false;
            }
            run.status = TaskStatus::Stopping;
            task.transition(TaskStatus::Stopping).is_ok()
        })?;

        if first {
            info!(task_id = %task_id, run = ?label, pending_start = handle.is_pending_start(), "Stop requested");
        }
        if marked {
            inner.notifier.tasks_changed(task_id.as_str(), "stopping");
        }

        if handle.is_pending_start() {
            handle.provisioning().cancel();
        } else {
            inner.launcher.terminate(&handle);
        }
        Ok(task)
    }

    /// Remove the task, its worktrees and its sidecar
    pub async fn delete(&self, task_id: &TaskId) -> Result<()> {
        let inner = &self.inner;
        let handle = inner.registry.try_reserve(task_id.as_str()).map_err(|_| {
            Error::Conflict(format!("Task {} has a run in flight; stop it first", task_id))
        })?;

        let result = self.delete_reserved(task_id).await;
        inner.registry.release(task_id.as_str(), &handle);
        result
    }

    async fn delete_reserved(&self, task_id: &TaskId) -> Result<()> {
        let inner = &self.inner;
        let task = inner.store.load(task_id)?;

        if task.use_sidecar || task.runs.iter().any(|r| r.used_sidecar) {
            if let Err(e) = inner.sidecar.remove(task_id.as_str()).await {
                warn!(task_id = %task_id, "Failed to remove sidecar: {}", e);
            }
        }
        self.discard_workspace(&task).await;
        inner.store.remove(task_id)?;

        info!(task_id = %task_id, "Task deleted");
        inner.notifier.tasks_changed(task_id.as_str(), "deleted");
        Ok(())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Fail tasks persisted mid-run that no live handle backs
    pub fn recover_orphaned_runs(&self) -> Result<Vec<TaskId>> {
        let inner = &self.inner;
        let mut recovered = Vec::new();

        for task in inner.store.list()? {
            let orphaned = task.status.is_in_flight() || task.has_run_in_flight();
            if !orphaned || inner.registry.is_active(task.id.as_str()) {
                continue;
            }
            inner.store.update(&task.id, |task| {
                let now = Utc::now();
                for run in task.runs.iter_mut().filter(|r| r.is_in_flight()) {
                    run.status = TaskStatus::Failed;
                    run.finished_at = Some(now);
                }
                task.status = TaskStatus::Failed;
                task.error = Some(INTERRUPTED_MESSAGE.to_string());
            })?;
            warn!(task_id = %task.id, "Recovered orphaned run");
            inner.notifier.tasks_changed(task.id.as_str(), "recovered");
            recovered.push(task.id);
        }
        Ok(recovered)
    }

    // ========================================================================
    // Run launch (fresh, resume, rotation)
    // ========================================================================

    /// Record a new run, run setup, then hand off to the launcher
    ///
    /// Consumes the registry slot held by `handle`: on a setup error or a stop
    /// during setup the slot is released here; otherwise the spawned
    /// supervision task owns it.
    async fn launch_run(
        &self,
        handle: Arc<RunHandle>,
        task_id: &TaskId,
        spec: LaunchSpec,
    ) -> Result<Task> {
        let inner = &self.inner;

        let recorded = inner.store.update(task_id, |task| -> Result<String> {
            task.transition(TaskStatus::Running)?;
            let label = task.next_run_label();
            task.runs.push(Run::new(
                label.clone(),
                spec.kind,
                spec.prompt.clone(),
                spec.model.clone(),
                spec.reasoning_effort.clone(),
                spec.use_sidecar,
            ));
            task.error = None;
            task.model = spec.model.clone();
            task.reasoning_effort = spec.reasoning_effort.clone();
            task.use_sidecar = spec.use_sidecar;
            if spec.kind == RunKind::Rotation {
                task.auto_rotate_count += 1;
            } else {
                task.auto_rotate_count = 0;
            }
            Ok(label)
        });
        let (task, label) = match recorded {
            Ok((task, Ok(label))) => (task, label),
            Ok((_, Err(e))) | Err(e) => {
                inner.registry.release(task_id.as_str(), &handle);
                return Err(e);
            }
        };
        handle.set_run_label(&label);
        inner.notifier.tasks_changed(task_id.as_str(), "running");
        info!(task_id = %task_id, run = %label, kind = ?spec.kind, sidecar = spec.use_sidecar, "Run starting");

        let mut lease = None;
        let prepared = self
            .prepare_run(&handle, &task, &label, &spec, &mut lease)
            .await;
        let prepared = if handle.stop_requested() {
            Err(Error::Cancelled)
        } else {
            prepared
        };

        let config = match prepared {
            Ok(config) => config,
            Err(e) => {
                if let Some(lease) = lease {
                    self.release_sidecar(task_id, lease).await;
                }
                if e.is_cancelled() {
                    return self.resolve_stopped_before_spawn(&handle, task_id, &label);
                }
                return Err(self.fail_setup(&handle, task_id, &label, spec.kind, e));
            }
        };

        let supervision = self.clone().supervise(handle, task_id.clone(), label, config);
        tokio::spawn(supervision);
        Ok(task)
    }

    /// Sidecar, credentials, mounts and argv for one run
    async fn prepare_run(
        &self,
        handle: &Arc<RunHandle>,
        task: &Task,
        label: &str,
        spec: &LaunchSpec,
        lease: &mut Option<SidecarLease>,
    ) -> Result<RunConfig> {
        let inner = &self.inner;
        let id = task.id.as_str();

        let mut sidecar_socket = None;
        if spec.use_sidecar {
            let token = handle.provisioning();
            let pre_existing = match spec.kind {
                RunKind::Fresh => false,
                _ => inner.sidecar.exists(id, token).await?,
            };
            *lease = Some(SidecarLease { pre_existing });
            sidecar_socket = Some(inner.sidecar.ensure(id, token).await?);
        }

        let account = inner.credentials.apply_active_account()?;
        if let Some(account) = &account {
            inner.store.update(&task.id, |task| {
                if let Some(run) = task.run_mut(label) {
                    run.account_id = Some(account.id.clone());
                    run.account_label = Some(account.label.clone());
                }
            })?;
            debug!(task_id = id, run = label, account = %account.id, "Bound account to run");
        }

        let artifacts_dir = inner.store.artifacts_dir(&task.id, label);
        std::fs::create_dir_all(&artifacts_dir)?;

        let agent_config = &inner.config.agent;
        let plan = inner.mounts.compose(&MountInputs {
            worktree: task.worktree_path.clone(),
            artifacts_dir,
            credential_home: Some(inner.credentials.credential_home()),
            credential_target: agent_config.credential_target.clone(),
            context_repos: task.context_repos.iter().map(|c| c.path.clone()).collect(),
            attachments_dir: Some(inner.store.attachments_dir(&task.id)),
            sidecar_socket: sidecar_socket.clone(),
        });
        let env = agent_env(
            &plan,
            &agent_config.env_for(&task.env_id),
            sidecar_socket.is_some(),
        );

        let invocation = match spec.kind {
            RunKind::Fresh => Invocation::Fresh {
                prompt: &spec.prompt,
            },
            RunKind::Resume | RunKind::Rotation => Invocation::Resume {
                thread_id: task.thread_id.as_deref().ok_or_else(|| {
                    Error::Conflict(format!("Task {} has no thread id to resume from", id))
                })?,
                prompt: &spec.prompt,
            },
        };
        let args = agent::build_args(
            agent_config,
            &invocation,
            spec.model.as_deref(),
            spec.reasoning_effort.as_deref(),
        );

        Ok(RunConfig::new(&agent_config.command, &task.worktree_path)
            .with_args(args)
            .with_env(env)
            .with_logs(
                inner.store.log_file(&task.id, label, LogStream::Stdout),
                inner.store.log_file(&task.id, label, LogStream::Stderr),
            ))
    }

    /// Undo this attempt's sidecar: stop a reused one, remove a fresh one
    async fn release_sidecar(&self, task_id: &TaskId, lease: SidecarLease) {
        let sidecar = &self.inner.sidecar;
        let result = if lease.pre_existing {
            sidecar.stop(task_id.as_str()).await
        } else {
            sidecar.remove(task_id.as_str()).await
        };
        if let Err(e) = result {
            warn!(task_id = %task_id, pre_existing = lease.pre_existing, "Sidecar cleanup failed: {}", e);
        }
    }

    /// Stop arrived before the process existed
    fn resolve_stopped_before_spawn(
        &self,
        handle: &Arc<RunHandle>,
        task_id: &TaskId,
        label: &str,
    ) -> Result<Task> {
        let inner = &self.inner;
        info!(task_id = %task_id, run = label, "Stopped before the agent started");
        let finalized = inner
            .finalizer
            .finalize(task_id, label, &ProcessOutcome::not_started(), true);
        inner.registry.release(task_id.as_str(), handle);
        finalized.map(|f| f.task)
    }

    /// Record a setup failure and hand the error back for the caller
    fn fail_setup(
        &self,
        handle: &Arc<RunHandle>,
        task_id: &TaskId,
        label: &str,
        kind: RunKind,
        err: Error,
    ) -> Error {
        let inner = &self.inner;
        warn!(task_id = %task_id, run = label, "Run setup failed: {}", err);

        // A failed create is rolled back entirely by the caller
        if kind != RunKind::Fresh {
            let log = inner.store.log_file(task_id, label, LogStream::Stderr);
            if let Err(e) = append_line(&log, &format!("setup failed: {}", err)) {
                debug!(task_id = %task_id, "Could not write setup failure to log: {}", e);
            }
            let message = match &err {
                Error::Timeout(_) => SIDECAR_TIMEOUT_MESSAGE,
                _ => SETUP_FAILED_MESSAGE,
            };
            let updated = inner.store.update(task_id, |task| {
                let mut prompt = None;
                if let Some(run) = task.run_mut(label) {
                    run.status = TaskStatus::Failed;
                    run.finished_at = Some(Utc::now());
                    prompt = Some(run.prompt.clone());
                }
                if let Some(prompt) = prompt {
                    task.last_prompt = prompt;
                }
                task.status = TaskStatus::Failed;
                task.error = Some(message.to_string());
            });
            if let Err(e) = updated {
                error!(task_id = %task_id, "Failed to record setup failure: {}", e);
            }
            inner.notifier.tasks_changed(task_id.as_str(), "failed");
        }

        inner.registry.release(task_id.as_str(), handle);
        err
    }

    // ========================================================================
    // Supervision, finalization, rotation
    // ========================================================================

    /// Boxed: rotation re-enters `launch_run`, which spawns this again
    fn supervise(
        self,
        handle: Arc<RunHandle>,
        task_id: TaskId,
        label: String,
        config: RunConfig,
    ) -> BoxFuture<'static, ()> {
        async move {
            let outcome = self
                .inner
                .launcher
                .run(config, Arc::clone(&handle))
                .await;
            debug!(
                task_id = %task_id,
                run = %label,
                exit_code = ?outcome.exit_code,
                signal = ?outcome.signal,
                "Agent exited"
            );
            self.complete_run(handle, task_id, label, outcome).await;
        }
        .boxed()
    }

    async fn complete_run(
        &self,
        handle: Arc<RunHandle>,
        task_id: TaskId,
        label: String,
        outcome: ProcessOutcome,
    ) {
        let inner = &self.inner;
        let finalized =
            match inner
                .finalizer
                .finalize(&task_id, &label, &outcome, handle.stop_requested())
            {
                Ok(finalized) => finalized,
                Err(e) => {
                    error!(task_id = %task_id, run = %label, "Finalization failed: {}", e);
                    let used_sidecar = inner
                        .store
                        .load(&task_id)
                        .ok()
                        .and_then(|task| task.run(&label).map(|r| r.used_sidecar))
                        .unwrap_or(false);
                    self.end_supervision(&handle, &task_id, used_sidecar).await;
                    return;
                }
            };
        let used_sidecar = finalized
            .task
            .run(&finalized.run_label)
            .is_some_and(|r| r.used_sidecar);

        if handle.stop_requested() {
            self.end_supervision(&handle, &task_id, used_sidecar).await;
            return;
        }

        match self.decide_rotation(&finalized) {
            RotationDecision::Rotate => self.rotate(handle, &task_id, &finalized).await,
            RotationDecision::Skip(reason) => {
                if finalized.classification.usage_limit {
                    info!(task_id = %task_id, run = %label, %reason, "Not rotating");
                }
                self.end_supervision(&handle, &task_id, used_sidecar).await;
            }
        }
    }

    /// No follow-up run: park the sidecar, then free the slot
    ///
    /// The sidecar is stopped, not removed, so a later resume restarts it with
    /// its state intact. The slot is released last so `wait_idle` observes the
    /// stopped container.
    async fn end_supervision(
        &self,
        handle: &Arc<RunHandle>,
        task_id: &TaskId,
        used_sidecar: bool,
    ) {
        if used_sidecar {
            if let Err(e) = self.inner.sidecar.stop(task_id.as_str()).await {
                warn!(task_id = %task_id, "Failed to stop sidecar after run: {}", e);
            }
        }
        self.inner.registry.release(task_id.as_str(), handle);
    }

    fn decide_rotation(&self, finalized: &FinalizedRun) -> RotationDecision {
        let inner = &self.inner;
        let active = inner.credentials.active_account().unwrap_or_else(|e| {
            warn!("Could not read active account: {}", e);
            None
        });
        let account_count = inner.credentials.count_accounts().unwrap_or(0);
        let run = finalized.task.run(&finalized.run_label);

        inner.rotation.decide(&RotationContext {
            prompt: run.map(|r| r.prompt.as_str()),
            classification: &finalized.classification,
            thread_id: finalized.task.thread_id.as_deref(),
            run_account: finalized.account_id.as_deref(),
            active_account: active.as_ref().map(|a| a.id.as_str()),
            account_count,
            auto_rotate_count: finalized.task.auto_rotate_count,
        })
    }

    /// Switch credentials and resume under a fresh handle
    async fn rotate(&self, handle: Arc<RunHandle>, task_id: &TaskId, finalized: &FinalizedRun) {
        let inner = &self.inner;
        let Some(run) = finalized.task.run(&finalized.run_label) else {
            inner.registry.release(task_id.as_str(), &handle);
            return;
        };

        let next = match inner.credentials.rotate_active_account() {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.end_supervision(&handle, task_id, run.used_sidecar).await;
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, "Credential rotation failed: {}", e);
                self.end_supervision(&handle, task_id, run.used_sidecar).await;
                return;
            }
        };
        info!(
            task_id = %task_id,
            from = ?finalized.account_id,
            to = %next.id,
            attempt = finalized.task.auto_rotate_count + 1,
            "Rotating account after usage limit"
        );
        inner
            .notifier
            .account_rotated(task_id.as_str(), finalized.account_id.as_deref(), &next.id);

        let Some(next_handle) = inner.registry.swap(task_id.as_str(), &handle) else {
            return;
        };
        if handle.stop_requested() {
            self.end_supervision(&next_handle, task_id, run.used_sidecar).await;
            return;
        }

        let spec = LaunchSpec {
            kind: RunKind::Rotation,
            prompt: run.prompt.clone(),
            model: run.model.clone(),
            reasoning_effort: run.reasoning_effort.clone(),
            use_sidecar: run.used_sidecar,
        };
        let used_sidecar = spec.use_sidecar;
        if let Err(e) = self.launch_run(next_handle, task_id, spec).await {
            warn!(task_id = %task_id, "Rotation resume failed: {}", e);
            if used_sidecar {
                if let Err(e) = inner.sidecar.stop(task_id.as_str()).await {
                    warn!(task_id = %task_id, "Failed to stop sidecar after run: {}", e);
                }
            }
        }
    }
}
