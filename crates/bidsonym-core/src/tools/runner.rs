//! Running external tools as child processes.
//!
//! Every tool call is described by a [`ToolInvocation`] and executed by a
//! [`ToolRunner`]. The production runner, [`ProcessRunner`], spawns the
//! executable with `tokio::process`, streams its output into the log, and
//! enforces the invocation's timeout and the run's cancellation token.

use crate::cancel::CancellationToken;
use crate::config::ToolConfig;
use crate::error::ToolFailureKind;
use crate::{BidsonymError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A fully specified external process call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Method or tool name used in logs and errors (`bet`, `pydeface`, ...).
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    /// Image the call operates on, for error context.
    pub image: PathBuf,
    /// Files the tool must have created when it exits successfully.
    pub produces: Vec<PathBuf>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, program: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            image: image.into(),
            produces: Vec::new(),
            timeout: ToolConfig::DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces.push(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable command line for logging.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Wrap a failure kind in an error carrying this call's context.
    pub fn failure(&self, kind: ToolFailureKind) -> BidsonymError {
        BidsonymError::tool(&self.tool, &self.image, kind)
    }

    /// Check that every declared output exists.
    pub fn verify_outputs(&self) -> Result<()> {
        match self.produces.iter().find(|p| !p.is_file()) {
            Some(missing) => Err(self.failure(ToolFailureKind::MissingOutput(missing.clone()))),
            None => Ok(()),
        }
    }
}

/// Executes tool invocations.
///
/// Implementations must return `Cancelled` when the token fires and must
/// not report success unless every declared output exists.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> Result<()>;
}

/// Runs tools as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        info!("Running {}: {}", invocation.tool, invocation.command_line());

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                invocation.failure(ToolFailureKind::Spawn(format!(
                    "{}: {e}",
                    invocation.program.display()
                )))
            })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(stream_lines(invocation.tool.clone(), "stdout", out, 0)));
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(stream_lines(
                invocation.tool.clone(),
                "stderr",
                err,
                ToolConfig::STDERR_TAIL_LINES,
            ))
        });

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = tokio::time::sleep(invocation.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        let status = match outcome {
            WaitOutcome::Exited(status) => status
                .map_err(|e| invocation.failure(ToolFailureKind::Spawn(e.to_string())))?,
            WaitOutcome::TimedOut => {
                warn!("{} exceeded {:?}, killing it", invocation.tool, invocation.timeout);
                child.kill().await.ok();
                return Err(invocation.failure(ToolFailureKind::Timeout(invocation.timeout)));
            }
            WaitOutcome::Cancelled => {
                warn!("Cancelling {}", invocation.tool);
                child.kill().await.ok();
                return Err(BidsonymError::Cancelled);
            }
        };

        if let Some(task) = stdout_task {
            task.await.ok();
        }
        let stderr_tail = match stderr_task {
            Some(task) => task.await.map(|lines| join_tail(&lines)).unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(invocation.failure(ToolFailureKind::ExitStatus {
                code: status.code(),
                stderr_tail,
            }));
        }

        invocation.verify_outputs()?;
        debug!("{} finished on {}", invocation.tool, invocation.image.display());
        Ok(())
    }
}

/// Log every line of a child stream at debug level, keeping the last `keep`.
async fn stream_lines<R>(tool: String, stream: &'static str, reader: R, keep: usize) -> VecDeque<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut tail = VecDeque::with_capacity(keep);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] {}: {}", tool, stream, line);
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {} {}: {}", tool, stream, e);
                break;
            }
        }
    }
    tail
}

fn join_tail(lines: &VecDeque<String>) -> String {
    lines
        .iter()
        .map(|l| l.trim_end())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Directory part of `path`, or `.` for a bare file name.
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
