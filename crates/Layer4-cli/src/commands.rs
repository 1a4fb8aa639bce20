//! Command handlers over the task engine

use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use yard_foundation::{EventBus, TaskEvent, YardConfig};
use yard_task::{
    BusNotifier, CreateTaskRequest, CredentialStore, FileCredentialStore, LogStream,
    RateLimitProbe, ResumeTaskRequest, Task, TaskEngine, TaskId, TaskStatus,
};

/// Optional flags of `yard run`
#[derive(Debug, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub effort: Option<String>,
    pub sidecar: bool,
    pub contexts: Vec<String>,
    pub attachments: Vec<PathBuf>,
    pub branch: Option<String>,
    pub base: Option<String>,
}

pub struct App {
    config: YardConfig,
    bus: Arc<EventBus>,
    engine: TaskEngine,
}

impl App {
    pub fn new(config: YardConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let engine = TaskEngine::builder(config.clone())
            .notifier(Arc::new(BusNotifier::new(Arc::clone(&bus))))
            .build();
        debug!(data_dir = %config.data_dir().display(), "Engine ready");
        Self {
            config,
            bus,
            engine,
        }
    }

    fn credential_store(&self) -> FileCredentialStore {
        FileCredentialStore::new(
            self.config.accounts_dir(),
            self.config.agent.credential_home(),
        )
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub async fn run(&self, env: String, prompt: String, options: RunOptions) -> anyhow::Result<()> {
        let mut request = CreateTaskRequest::new(env, prompt).with_sidecar(options.sidecar);
        request.model = options.model;
        request.reasoning_effort = options.effort;
        request.branch = options.branch;
        request.base_ref = options.base;
        request.context_envs = options.contexts;
        request.attachments = options.attachments;

        let mut events = self.bus.receiver();
        let task = self.engine.create(request).await?;
        println!("Task {} on branch {}", task.id, task.branch);
        self.follow(&task.id, &mut events).await
    }

    pub async fn resume(
        &self,
        id: &str,
        prompt: String,
        model: Option<String>,
        effort: Option<String>,
        sidecar: Option<bool>,
    ) -> anyhow::Result<()> {
        let task_id = TaskId::parse(id)?;
        let request = ResumeTaskRequest {
            prompt,
            model,
            reasoning_effort: effort,
            use_sidecar: sidecar,
        };

        let mut events = self.bus.receiver();
        self.engine.resume(&task_id, request).await?;
        self.follow(&task_id, &mut events).await
    }

    /// Print progress until the task is idle; the first Ctrl-C stops the run
    async fn follow(
        &self,
        task_id: &TaskId,
        events: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    ) -> anyhow::Result<()> {
        let idle = self.engine.wait_idle(task_id);
        tokio::pin!(idle);
        let mut stopping = false;

        let task = loop {
            tokio::select! {
                task = &mut idle => break task?,
                event = events.recv() => match event {
                    Ok(event) if event.task_id() == task_id.as_str() => {
                        self.print_event(task_id, &event);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break self.engine.wait_idle(task_id).await?,
                },
                signal = tokio::signal::ctrl_c(), if !stopping => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    stopping = true;
                    eprintln!("Stopping task {}...", task_id);
                    self.engine.stop(task_id).await?;
                }
            }
        };

        print_outcome(&task);
        if task.status == TaskStatus::Failed {
            bail!(
                "Task {} failed: {}",
                task.id,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }

    fn print_event(&self, task_id: &TaskId, event: &TaskEvent) {
        match event {
            TaskEvent::AccountRotated { from, to, .. } => {
                println!("  rotated account {} -> {}", from.as_deref().unwrap_or("-"), to);
            }
            TaskEvent::TasksChanged { reason, .. } => {
                if let Ok(task) = self.engine.get(task_id) {
                    let run = task.latest_run().map(|r| r.label.as_str()).unwrap_or("-");
                    println!("  {} {} ({})", task.status.symbol(), run, reason);
                }
            }
        }
    }

    pub fn list(&self) -> anyhow::Result<()> {
        let tasks = self.engine.list()?;
        if tasks.is_empty() {
            println!("No tasks.");
            return Ok(());
        }
        for task in tasks {
            println!(
                "{} {:<12} {:<10} {:<24} {:>3} runs  {}",
                task.status.symbol(),
                task.id.as_str(),
                task.status.as_str(),
                task.branch,
                task.runs.len(),
                truncate(&task.last_prompt, 60)
            );
        }
        Ok(())
    }

    pub fn show(&self, id: &str) -> anyhow::Result<()> {
        let task = self.engine.get(&TaskId::parse(id)?)?;
        println!("{}", serde_json::to_string_pretty(&task)?);
        Ok(())
    }

    pub fn logs(
        &self,
        id: &str,
        run: Option<&str>,
        stderr: bool,
        tail: Option<usize>,
    ) -> anyhow::Result<()> {
        let stream = if stderr {
            LogStream::Stderr
        } else {
            LogStream::Stdout
        };
        let text = self
            .engine
            .read_log(&TaskId::parse(id)?, run, stream, tail)?;
        print!("{}", text);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let task_id = TaskId::parse(id)?;
        self.engine.delete(&task_id).await?;
        println!("Deleted task {}", task_id);
        Ok(())
    }

    pub fn recover(&self) -> anyhow::Result<()> {
        let recovered = self.engine.recover_orphaned_runs()?;
        if recovered.is_empty() {
            println!("No interrupted runs.");
        }
        for id in recovered {
            println!("Marked interrupted run of task {} as failed", id);
        }
        Ok(())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn accounts_list(&self) -> anyhow::Result<()> {
        let store = self.credential_store();
        let active = store.active_account()?.map(|a| a.id);
        let accounts = store.list()?;
        if accounts.is_empty() {
            println!("No stored accounts under {}", self.config.accounts_dir().display());
            return Ok(());
        }
        for account in accounts {
            let marker = if active.as_deref() == Some(account.id.as_str()) {
                "*"
            } else {
                " "
            };
            println!("{} {:<16} {}", marker, account.id, account.label);
        }
        Ok(())
    }

    pub fn accounts_use(&self, id: &str) -> anyhow::Result<()> {
        let account = self.credential_store().activate(id)?;
        println!("Active account: {} ({})", account.id, account.label);
        Ok(())
    }

    pub async fn accounts_limits(&self, id: Option<&str>) -> anyhow::Result<()> {
        let store = self.credential_store();
        let account_id = match id {
            Some(id) => id.to_string(),
            None => match store.active_account()? {
                Some(account) => account.id,
                None => bail!("No active account"),
            },
        };
        let probe = RateLimitProbe::new(self.config.probe.clone());
        let limits = probe
            .read(&store.account_dir(&account_id))
            .await
            .with_context(|| format!("Reading rate limits of account {}", account_id))?;
        println!("{}", serde_json::to_string_pretty(&limits)?);
        Ok(())
    }
}

fn print_outcome(task: &Task) {
    let runs = task.runs.len();
    match task.status {
        TaskStatus::Completed => println!("✓ Task {} completed after {} run(s)", task.id, runs),
        TaskStatus::Stopped => println!("⊘ Task {} stopped", task.id),
        status => println!("{} Task {} is {}", status.symbol(), task.id, status),
    }
    if task.auto_rotate_count > 0 {
        println!("  {} automatic account rotation(s)", task.auto_rotate_count);
    }
}

/// Truncate a string for display
fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_chars {
        s
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
