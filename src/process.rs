use crate::error::ProcessError;
use std::path::Path;
use tracing::{Level, event};

#[derive(Clone, Debug, Default)]
/// Everything an external tool printed before exiting successfully.
pub(crate) struct ProcessOutput {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

/// `CommandRunner` is the seam between action handlers and the external
/// tools they drive. Handlers only ever spawn processes through it.
pub(crate) trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessError>> + Send;
}

#[derive(Clone, Debug, Default)]
/// Runs tools as child processes on the tokio runtime, optionally
/// bounded by a wall-clock timeout after which the child gets killed.
pub(crate) struct SystemRunner {
    timeout: Option<tokio::time::Duration>,
}

impl SystemRunner {
    pub(crate) fn new(timeout: Option<tokio::time::Duration>) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<ProcessOutput, ProcessError> {
        event!(Level::DEBUG, "Running '{program}' {args:?} in {cwd:?}");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        // Dropping the output future (timeout, worker shutdown) kills the child.
        let output_fut = cmd.output();

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output_fut).await {
                Ok(res) => res,
                Err(_) => {
                    return Err(ProcessError::TimedOut {
                        program: program.to_string(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => output_fut.await,
        }
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            return Ok(ProcessOutput { stdout, stderr });
        }

        // Prefer what the tool wrote to STDERR, then STDOUT, then a generic line.
        let code = output.status.code();
        let message = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            match code {
                Some(c) => format!("{program} exited with code {c}"),
                None => format!("{program} was terminated by a signal"),
            }
        };

        Err(ProcessError::Exited {
            program: program.to_string(),
            code,
            message,
        })
    }
}
