//! System Command Runner
//!
//! Executes external tools with `tokio::process`, optionally inside a chroot,
//! bounded by a per-call timeout. A timed-out child is killed when its future
//! is dropped.

use crate::domain::ports::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs commands on the host
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn build(spec: &CommandSpec) -> Command {
        let mut cmd = match &spec.root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&spec.program);
                cmd
            }
            None => Command::new(&spec.program),
        };

        cmd.args(&spec.args)
            .env("LC_ALL", "C")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, timeout = ?spec.timeout, "Running command");

        let child = Self::build(spec).spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ToolUnavailable {
                tool: spec.program_name().to_string(),
                reason: "not found".into(),
            },
            _ => Error::Io(e),
        })?;

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if !result.success() {
                    debug!(
                        command = %spec,
                        code = ?result.code,
                        stderr = %result.stderr.trim(),
                        "Command exited non-zero"
                    );
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                warn!(command = %spec, timeout = ?spec.timeout, "Command timed out, killed");
                Err(Error::CommandTimeout {
                    program: spec.program_name().to_string(),
                    timeout: spec.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_and_captures_output() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);

        let output = runner.run(&spec).await.unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(50));

        let err = runner.run(&spec).await.unwrap_err();
        assert_matches!(err, Error::CommandTimeout { ref program, .. } if program == "sleep");
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_unavailable() {
        let runner = SystemRunner::new();
        let spec = CommandSpec::new("/nonexistent/zpool-does-not-exist");

        let err = runner.run(&spec).await.unwrap_err();
        assert_matches!(err, Error::ToolUnavailable { .. });
    }
}
