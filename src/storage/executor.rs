//! Command Executor
//!
//! Production implementation of the [`Executor`] port. Runs tools through
//! `tokio::process` so a slow `pvmove` parks only the calling task. No
//! timeout is applied here; callers bound their own retries.

use crate::domain::ports::Executor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Runs commands on the local host
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    /// Optional wrapper prefix, e.g. `nsenter --mount=/proc/1/ns/mnt --`
    prefix: Vec<String>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every command through a wrapper such as nsenter
    pub fn with_prefix(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    fn build(&self, program: &str, args: &[String]) -> Command {
        match self.prefix.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(wrapper_args).arg(program).args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

/// Render a command line for logs and errors
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run_command(&self, program: &str, args: &[String]) -> Result<String> {
        let rendered = render_command(program, args);
        debug!(command = %rendered, "Executing");

        let output = self
            .build(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                command: rendered.clone(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::CommandFailed {
                command: rendered,
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
