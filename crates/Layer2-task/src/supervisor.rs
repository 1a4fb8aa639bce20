//! Process Supervisor - runs the agent subprocess to completion
//!
//! Features:
//! - Own process group on unix, so one signal reaches the whole subtree
//! - Line-buffered tee of stdout/stderr into the run's log files
//! - Continuation token detection on stdout
//! - Graceful shutdown with SIGTERM -> SIGKILL escalation

use crate::agent::RecordScanner;
use crate::log::{LogSink, TailBuffer, DEFAULT_TAIL_BYTES};
use crate::mount::RunConfig;
use crate::registry::RunHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long readers may keep draining after the child exited
///
/// A grandchild that inherited the pipes can hold them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Raw result of one agent process
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,

    /// Terminating signal (unix)
    pub signal: Option<i32>,

    /// Tail of stdout, newline-joined
    pub stdout: String,

    /// Tail of stderr, newline-joined
    pub stderr: String,

    /// Continuation token seen on stdout
    pub thread_id: Option<String>,

    /// Set when the process never started
    pub spawn_error: Option<String>,
}

impl ProcessOutcome {
    pub fn spawn_failed(err: impl std::fmt::Display) -> Self {
        Self {
            spawn_error: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// Run resolved before a process existed (stopped during setup)
    pub fn not_started() -> Self {
        Self::default()
    }

    /// Killed by SIGTERM or SIGKILL
    pub fn killed_by_stop_signal(&self) -> bool {
        matches!(self.signal, Some(s) if s == SIGTERM || s == SIGKILL)
    }
}

/// Spawns and terminates agent processes
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn `config` and supervise it until exit
    ///
    /// Never fails: spawn errors come back inside the outcome so the caller
    /// finalizes every attempt the same way.
    async fn run(&self, config: RunConfig, handle: Arc<RunHandle>) -> ProcessOutcome;

    /// Graceful termination, escalating to a forced kill after the grace period
    fn terminate(&self, handle: &Arc<RunHandle>);
}

#[derive(Debug, Default)]
struct Captured {
    stdout: TailBuffer,
    stderr: TailBuffer,
    thread_id: Option<String>,
}

/// Local process launcher
pub struct ProcessSupervisor {
    grace: Duration,
    tail_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Launcher for ProcessSupervisor {
    async fn run(&self, config: RunConfig, handle: Arc<RunHandle>) -> ProcessOutcome {
        let stdout_sink = match LogSink::create(&config.stdout_log).await {
            Ok(sink) => sink,
            Err(e) => return ProcessOutcome::spawn_failed(e),
        };
        let stderr_sink = match LogSink::create(&config.stderr_log).await {
            Ok(sink) => sink,
            Err(e) => return ProcessOutcome::spawn_failed(e),
        };

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.cwd)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        // Stop landed after setup finished but before the process existed
        if handle.stop_requested() {
            info!(run = ?handle.run_label(), "Stop requested before spawn; not starting agent");
            return ProcessOutcome::not_started();
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %config.program, "Failed to spawn agent: {}", e);
                return ProcessOutcome::spawn_failed(e);
            }
        };

        handle.mark_spawned(child.id(), cfg!(unix));
        info!(pid = ?child.id(), run = ?handle.run_label(), "Agent started");

        // Stop that raced with spawn: the stop handler saw pending_start
        if handle.stop_requested() {
            self.terminate(&handle);
        }

        let captured = Arc::new(Mutex::new(Captured {
            stdout: TailBuffer::new(self.tail_bytes),
            stderr: TailBuffer::new(self.tail_bytes),
            thread_id: None,
        }));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                stdout_sink,
                Arc::clone(&captured),
                true,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                stderr_sink,
                Arc::clone(&captured),
                false,
            )));
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = handle.force_kill().cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        handle.exited().cancel();

        let drain = futures::future::join_all(readers);
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Output readers still open after exit; using what was captured");
        }

        let mut outcome = {
            let captured = captured.lock();
            ProcessOutcome {
                stdout: captured.stdout.contents(),
                stderr: captured.stderr.contents(),
                thread_id: captured.thread_id.clone(),
                ..ProcessOutcome::default()
            }
        };

        match status {
            Ok(status) => {
                outcome.exit_code = status.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    outcome.signal = status.signal();
                }
            }
            Err(e) => warn!("Failed to wait for agent: {}", e),
        }

        info!(
            exit_code = ?outcome.exit_code,
            signal = ?outcome.signal,
            "Agent exited"
        );
        outcome
    }

    fn terminate(&self, handle: &Arc<RunHandle>) {
        if handle.is_pending_start() {
            debug!("Stop during setup; cancelling provisioning");
            handle.provisioning().cancel();
            return;
        }
        let Some(pid) = handle.pid() else {
            handle.force_kill().cancel();
            return;
        };

        #[cfg(unix)]
        {
            send_signal(pid, handle.has_process_group(), SIGTERM);
            self.arm_kill_timer(pid, handle);
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            handle.force_kill().cancel();
        }
    }
}

impl ProcessSupervisor {
    /// SIGKILL after the grace period unless the process exits first
    #[cfg(unix)]
    fn arm_kill_timer(&self, pid: u32, handle: &Arc<RunHandle>) {
        let handle = Arc::clone(handle);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.exited().cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    warn!(pid, "Grace period expired - killing agent");
                    send_signal(pid, handle.has_process_group(), SIGKILL);
                    handle.force_kill().cancel();
                }
            }
        });
    }
}

/// Signal the process group, falling back to the child itself
#[cfg(unix)]
fn send_signal(pid: u32, process_group: bool, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    if process_group {
        // SAFETY: kill(2) only takes plain integers.
        if unsafe { libc::kill(-pid, signal) } == 0 {
            return;
        }
        debug!(pid, "Group signal failed: {}", std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::kill(pid, signal) } != 0 {
        debug!(pid, "Signal failed: {}", std::io::Error::last_os_error());
    }
}

/// Tee one stream into its log file and the shared capture
async fn pump<R>(reader: R, mut sink: LogSink, captured: Arc<Mutex<Captured>>, scan: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut scanner = RecordScanner::new();
    let mut sink_ok = true;
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if sink_ok {
                    if let Err(e) = sink.write(&buf).await {
                        warn!(path = %sink.path().display(), "Log write failed: {}", e);
                        sink_ok = false;
                    }
                }

                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                let detected = if scan {
                    scanner.observe(line).map(str::to_string)
                } else {
                    None
                };

                let mut captured = captured.lock();
                if let Some(thread_id) = detected {
                    debug!(thread_id = %thread_id, "Agent reported thread id");
                    captured.thread_id = Some(thread_id);
                }
                if scan {
                    captured.stdout.push(line);
                } else {
                    captured.stderr.push(line);
                }
            }
            Err(e) => {
                warn!("Output read failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = sink.finish().await {
        warn!("Log flush failed: {}", e);
    }
}
