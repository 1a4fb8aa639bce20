//! Agent subprocess protocol
//!
//! The agent prints newline-delimited JSON records on stdout. Two kinds
//! matter here:
//!
//! - `thread.started` carries the continuation token (`thread_id`)
//! - `error` / `turn.failed` carry a human message; only these are inspected
//!   for quota exhaustion

use serde_json::Value;
use yard_foundation::AgentConfig;

/// Markers of quota exhaustion inside a failure record's message
const USAGE_LIMIT_MARKERS: &[&str] = &["usage limit", "usage_limit_reached"];

const THREAD_STARTED: &str = "thread.started";
const ERROR_RECORD: &str = "error";
const TURN_FAILED: &str = "turn.failed";

/// A structured record the engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRecord {
    ThreadStarted { thread_id: String },
    Failure { message: String },
}

/// Parse one stdout line; anything that is not a well-formed record of a
/// known kind yields `None`
pub fn parse_record(line: &str) -> Option<AgentRecord> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    match value.get("type")?.as_str()? {
        THREAD_STARTED => {
            let thread_id = value.get("thread_id")?.as_str()?;
            if thread_id.is_empty() {
                return None;
            }
            Some(AgentRecord::ThreadStarted {
                thread_id: thread_id.to_string(),
            })
        }
        ERROR_RECORD => value
            .get("message")
            .and_then(Value::as_str)
            .map(|m| AgentRecord::Failure {
                message: m.to_string(),
            }),
        TURN_FAILED => value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(|m| AgentRecord::Failure {
                message: m.to_string(),
            }),
        _ => None,
    }
}

pub fn is_usage_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    USAGE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether stdout holds a failure record reporting quota exhaustion
///
/// Free text (including agent messages that merely mention a usage limit)
/// never matches.
pub fn detect_usage_limit(stdout: &str) -> bool {
    stdout.lines().any(|line| {
        matches!(
            parse_record(line),
            Some(AgentRecord::Failure { message }) if is_usage_limit_message(&message)
        )
    })
}

/// Watches stdout lines for the first continuation token
#[derive(Debug, Default)]
pub struct RecordScanner {
    thread_id: Option<String>,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token the first time it appears
    pub fn observe(&mut self, line: &str) -> Option<&str> {
        if self.thread_id.is_some() || !line.contains(THREAD_STARTED) {
            return None;
        }
        if let Some(AgentRecord::ThreadStarted { thread_id }) = parse_record(line) {
            self.thread_id = Some(thread_id);
            return self.thread_id.as_deref();
        }
        None
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

/// What to ask the agent for
#[derive(Debug, Clone)]
pub enum Invocation<'a> {
    Fresh {
        prompt: &'a str,
    },
    Resume {
        thread_id: &'a str,
        prompt: &'a str,
    },
}

/// Build the agent argv (without the program itself)
pub fn build_args(
    agent: &AgentConfig,
    invocation: &Invocation<'_>,
    model: Option<&str>,
    reasoning_effort: Option<&str>,
) -> Vec<String> {
    let mut args = agent.exec_args.clone();

    if let Some(model) = model.filter(|m| !m.is_empty()) {
        args.push(agent.model_flag.clone());
        args.push(model.to_string());
    }
    if let Some(effort) = reasoning_effort.filter(|e| !e.is_empty()) {
        args.push(agent.reasoning_flag.clone());
        args.push(format!("model_reasoning_effort=\"{}\"", effort));
    }

    match invocation {
        Invocation::Fresh { prompt } => args.push(prompt.to_string()),
        Invocation::Resume { thread_id, prompt } => {
            args.extend(agent.resume_args.iter().cloned());
            args.push(thread_id.to_string());
            args.push(prompt.to_string());
        }
    }
    args
}
