//! Host command runner
//!
//! Every git and container-engine invocation goes through [`HostCommand`]:
//! one place that applies a timeout, honours an optional cancellation token
//! and keeps the two apart in the result.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yard_foundation::Error;

/// Failure of a single host command
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit; `stderr` is the command's own message
    #[error("{}", failed_message(.program, .code, .stderr))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {}s", .after.as_secs_f64())]
    TimedOut { program: String, after: Duration },

    #[error("{program} cancelled")]
    Cancelled { program: String },
}

fn failed_message(program: &str, code: &Option<i32>, stderr: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match code {
        Some(code) => format!("{} exited with code {}", program, code),
        None => format!("{} terminated by signal", program),
    }
}

impl CommandError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandError::Cancelled { .. })
    }

    /// Failed with a message containing any of `needles` (case-insensitive)
    pub fn stderr_contains(&self, needles: &[&str]) -> bool {
        match self {
            CommandError::Failed { stderr, .. } => {
                let lower = stderr.to_lowercase();
                needles.iter().any(|n| lower.contains(&n.to_lowercase()))
            }
            _ => false,
        }
    }
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled { .. } => Error::Cancelled,
            CommandError::TimedOut { .. } => Error::Timeout(err.to_string()),
            other => Error::Infra(other.to_string()),
        }
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// A host command with a timeout
#[derive(Debug, Clone)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Human-readable command line (for logs)
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion
    ///
    /// The child is killed when either the timeout elapses or `cancel` fires;
    /// the two surface as different variants.
    pub async fn run(&self, cancel: Option<&CancellationToken>) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        debug!(command = %self.display(), "Running host command");

        let program = self.program.clone();
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(CommandError::Cancelled { program });
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancelled => return Err(CommandError::Cancelled { program }),
            result = tokio::time::timeout(self.timeout, cmd.output()) => match result {
                Err(_) => {
                    return Err(CommandError::TimedOut {
                        program,
                        after: self.timeout,
                    })
                }
                Ok(Err(source)) => return Err(CommandError::Spawn { program, source }),
                Ok(Ok(output)) => output,
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(CommandError::Failed {
                program,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let out = HostCommand::new("sh")
            .args(["-c", "echo hello"])
            .run(None)
            .await
            .unwrap();
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn test_failure_message_is_stderr_verbatim() {
        let err = HostCommand::new("sh")
            .args(["-c", "echo 'fatal: not a git repository' >&2; exit 128"])
            .run(None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fatal: not a git repository");
        assert!(err.stderr_contains(&["NOT A GIT"]));

        let mapped: Error = err.into();
        assert_eq!(mapped.to_string(), "fatal: not a git repository");
    }

    #[tokio::test]
    async fn test_timeout_and_cancel_are_distinct() {
        let slow = HostCommand::new("sh")
            .args(["-c", "sleep 5"])
            .timeout(Duration::from_millis(100));

        let err = slow.run(None).await.unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(matches!(Error::from(err), Error::Timeout(_)));

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = slow
            .clone()
            .timeout(Duration::from_secs(5))
            .run(Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(Error::from(err).is_cancelled());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_never_spawns() {
        let token = CancellationToken::new();
        token.cancel();
        let err = HostCommand::new("definitely-not-a-binary")
            .run(Some(&token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = HostCommand::new("definitely-not-a-binary-yard")
            .run(None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
