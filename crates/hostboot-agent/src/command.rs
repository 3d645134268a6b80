//! Shared command execution with captured output
//!
//! Every external tool the agent drives (package manager, docker, nginx,
//! systemctl) goes through [`CommandRunner`], so bootstrap logic can be
//! exercised against a scripted runner in tests.

use anyhow::{Context, Result};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Timeout for setup commands (10 minutes)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Time to wait for output readers to drain after the process exits
const STREAM_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed. Never logged.
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Shell-like rendering for logs and diagnostics
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// `None` if the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, as `2>&1` would capture them
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }

    /// Last non-empty line of stderr (or stdout), for short error messages
    pub fn summary(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        source
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Runs external commands.
///
/// `Ok` means the process ran to completion (successfully or not);
/// `Err` means it could not be spawned or timed out.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

async fn collect_lines<R>(reader: R, program: String, stream: &'static str) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(cmd = %program, stream, "{}", line);
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        info!(
            cmd = %spec.program,
            args = ?spec.args,
            timeout_secs = spec.timeout.as_secs(),
            "Running command"
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", spec.program))?;

        if let Some(input) = &spec.stdin {
            let mut stdin = child.stdin.take().context("Failed to capture stdin")?;
            stdin
                .write_all(input.as_bytes())
                .await
                .context("Failed to write to stdin")?;
            drop(stdin);
        }

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;
        let stdout_handle = tokio::spawn(collect_lines(stdout, spec.program.clone(), "stdout"));
        let stderr_handle = tokio::spawn(collect_lines(stderr, spec.program.clone(), "stderr"));

        let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(e).context("Failed waiting for command"),
            Err(_) => {
                warn!(
                    cmd = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "Command timed out, killing process"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out process");
                }
                anyhow::bail!(
                    "Command '{}' timed out after {}s",
                    spec.display(),
                    spec.timeout.as_secs()
                );
            }
        };

        let stdout = tokio::time::timeout(STREAM_FLUSH_TIMEOUT, stdout_handle)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let stderr = tokio::time::timeout(STREAM_FLUSH_TIMEOUT, stderr_handle)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        debug!(cmd = %spec.program, code = ?status.code(), "Command finished");

        Ok(CommandOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}
