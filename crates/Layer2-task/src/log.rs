//! Run Log System - per-run output capture
//!
//! Provides:
//! - Byte-for-byte tee of agent stdout/stderr into `logs/run-NNN.{out,err}.log`
//! - Bounded in-memory tail handed to the finalizer
//! - Tail reads for `read_log`

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use yard_foundation::{Error, Result};

/// Bytes of output kept in memory per stream
pub const DEFAULT_TAIL_BYTES: usize = 4 * 1024 * 1024;

/// Which log of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            LogStream::Stdout => "out.log",
            LogStream::Stderr => "err.log",
        }
    }
}

/// Log file path of one run stream
pub fn log_path(logs_dir: &Path, run_label: &str, stream: LogStream) -> PathBuf {
    logs_dir.join(format!("{}.{}", run_label, stream.suffix()))
}

// ============================================================================
// TailBuffer
// ============================================================================

/// Last `max_bytes` worth of lines
#[derive(Debug)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl TailBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Joined with `\n`
    pub fn contents(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_BYTES)
    }
}

// ============================================================================
// LogSink
// ============================================================================

/// Append-only log file written from a reader task
pub struct LogSink {
    file: File,
    path: PathBuf,
}

impl LogSink {
    /// Create (truncating) the log file and its parent directory
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await.map_err(|e| {
            Error::Storage(format!("Failed to create log {}: {}", path.display(), e))
        })?;
        Ok(Self { file, path })
    }

    pub async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append one diagnostic line (setup failures land here, not in `task.error`)
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Last `lines` lines of a log file (all of it when `None`)
pub fn read_tail(path: &Path, lines: Option<usize>) -> Result<String> {
    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!("Log {}", path.display())))
        }
        Err(e) => return Err(e.into()),
    };
    let Some(n) = lines else {
        return Ok(content);
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(n);
    Ok(all[start..].join("\n"))
}
