//! Shell flavor of a background task's `fn`. Timeout, output capture and
//! truncation are carried over from the teacher's `BashTool`
//! (`tools/bash.rs`); the difference is that a background task streams its
//! final buffer through `TaskManager` instead of returning a single
//! `ToolOutcome`.

use super::TaskRunError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Builds the closure `TaskManager::launch` expects: run `command` under
/// `cwd` with a hard `timeout`, returning combined stdout/stderr (truncated
/// past `DEFAULT_MAX_OUTPUT_BYTES`) as the task's output.
pub fn shell_task(
    command: String,
    cwd: Option<String>,
    timeout: Duration,
) -> impl FnOnce(CancellationToken) -> super::TaskFuture {
    move |cancel: CancellationToken| {
        Box::pin(async move {
            let mut cmd = tokio::process::Command::new("bash");
            cmd.arg("-c").arg(&command);
            if let Some(cwd) = &cwd {
                cmd.current_dir(cwd);
            }
            cmd.stdout(std::process::Stdio::piped());
            cmd.stderr(std::process::Stdio::piped());

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return (String::new(), Some(TaskRunError::Cancelled));
                }
                _ = tokio::time::sleep(timeout) => {
                    return (String::new(), Some(TaskRunError::Other(format!("timed out after {}s", timeout.as_secs()))));
                }
                result = cmd.output() => result,
            };

            match result {
                Ok(output) => {
                    let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
                    let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    if stdout.len() > DEFAULT_MAX_OUTPUT_BYTES {
                        stdout.truncate(DEFAULT_MAX_OUTPUT_BYTES);
                        stdout.push_str("\n... (output truncated)");
                    }
                    if stderr.len() > DEFAULT_MAX_OUTPUT_BYTES {
                        stderr.truncate(DEFAULT_MAX_OUTPUT_BYTES);
                        stderr.push_str("\n... (output truncated)");
                    }
                    let exit_code = output.status.code().unwrap_or(-1);
                    let text = if stderr.is_empty() {
                        format!("exit code: {exit_code}\n{stdout}")
                    } else {
                        format!("exit code: {exit_code}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")
                    };
                    if exit_code == 0 {
                        (text, None)
                    } else {
                        (text, Some(TaskRunError::Other(format!("command exited with code {exit_code}"))))
                    }
                }
                Err(e) => (String::new(), Some(TaskRunError::Other(format!("failed to execute: {e}")))),
            }
        })
    }
}
