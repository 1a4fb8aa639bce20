//! Rate-limit probe
//!
//! Short-lived app-server process spoken to over line-delimited JSON-RPC:
//! `initialize` request/response, `initialized` notification, then one
//! `account/rateLimits/read` request/response. The whole exchange is bounded
//! by one timeout and runs against a specific credential home.

use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tracing::debug;
use yard_foundation::{Error, ProbeConfig, Result};

const INITIALIZE_ID: u64 = 1;
const RATE_LIMITS_ID: u64 = 2;
pub const RATE_LIMITS_METHOD: &str = "account/rateLimits/read";

pub struct RateLimitProbe {
    config: ProbeConfig,
}

impl RateLimitProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Read rate limits for the credential stored in `home`
    pub async fn read(&self, home: &Path) -> Result<Value> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.exchange(home)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "Rate-limit probe did not answer within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn exchange(&self, home: &Path) -> Result<Value> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env(&self.config.home_env, home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Infra(format!("Failed to start {}: {}", self.config.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("probe stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("probe stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        send(
            &mut stdin,
            json!({
                "id": INITIALIZE_ID,
                "method": "initialize",
                "params": { "clientInfo": { "name": "yard", "version": env!("CARGO_PKG_VERSION") } }
            }),
        )
        .await?;
        await_response(&mut lines, INITIALIZE_ID).await?;

        send(&mut stdin, json!({ "method": "initialized" })).await?;
        send(
            &mut stdin,
            json!({ "id": RATE_LIMITS_ID, "method": RATE_LIMITS_METHOD }),
        )
        .await?;
        let result = await_response(&mut lines, RATE_LIMITS_ID).await?;

        drop(stdin);
        let _ = child.start_kill();
        Ok(result)
    }
}

async fn send(stdin: &mut ChildStdin, message: Value) -> Result<()> {
    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await?;
    Ok(())
}

/// Skip notifications and unrelated messages until the response to `id`
async fn await_response(lines: &mut Lines<BufReader<ChildStdout>>, id: u64) -> Result<Value> {
    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            debug!("Ignoring non-JSON probe output");
            continue;
        };
        if message.get("id").and_then(Value::as_u64) != Some(id) {
            continue;
        }
        if let Some(error) = message.get("error") {
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Infra(format!("Rate-limit probe error: {}", text)));
        }
        return Ok(message.get("result").cloned().unwrap_or(Value::Null));
    }
    Err(Error::Infra(
        "Rate-limit probe exited before responding".to_string(),
    ))
}
