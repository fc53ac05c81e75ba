use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Outcome of one coding run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of one review run.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub passed: bool,
    pub feedback: String,
    pub error_message: Option<String>,
}

/// Contract between the consumer loops and the agent-coder backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a coding task.
    async fn execute(&self, prompt: &str, task_id: &str) -> Result<ExecutionResult>;

    /// Run a code review. Reviewers answer PASS or FAIL first.
    async fn review(&self, prompt: &str, task_id: &str) -> Result<ReviewResult>;
}

pub fn create_executor(
    executor_type: &str,
    workspace_dir: &str,
    executor_cmd: &str,
    timeout_s: u64,
) -> Result<std::sync::Arc<dyn Executor>> {
    match executor_type {
        "claude-code" => Ok(std::sync::Arc::new(
            ClaudeCodeExecutor::new(workspace_dir).with_timeout(timeout_s),
        )),
        "shell" => {
            if executor_cmd.is_empty() {
                bail!("shell executor requires EXECUTOR_CMD");
            }
            Ok(std::sync::Arc::new(ShellExecutor::new(
                workspace_dir,
                executor_cmd,
                timeout_s,
            )))
        }
        other => bail!("unknown executor type {other:?}"),
    }
}

// ── Claude Code CLI ──────────────────────────────────────────────────────

/// Runs the `claude` CLI as a subprocess in the workspace.
pub struct ClaudeCodeExecutor {
    workspace_dir: String,
    timeout_s: u64,
}

impl ClaudeCodeExecutor {
    pub fn new(workspace_dir: impl Into<String>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            timeout_s: 3_600,
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

#[async_trait]
impl Executor for ClaudeCodeExecutor {
    async fn execute(&self, prompt: &str, task_id: &str) -> Result<ExecutionResult> {
        tracing::info!("executing task {task_id} via claude CLI");
        let child = Command::new("claude")
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg("-p")
            .arg(prompt)
            .current_dir(&self.workspace_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_s),
            child,
        )
        .await
        {
            Ok(output) => output.context("spawn claude CLI")?,
            Err(_) => {
                return Ok(ExecutionResult {
                    success: false,
                    output_path: None,
                    error_message: Some(format!(
                        "Execution timed out after {} seconds",
                        self.timeout_s
                    )),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let success = output.status.success();
        Ok(ExecutionResult {
            success,
            output_path: None,
            error_message: if success { None } else { Some(stderr.clone()) },
            stdout,
            stderr,
        })
    }

    async fn review(&self, prompt: &str, task_id: &str) -> Result<ReviewResult> {
        let review_prompt = format!(
            "Please review the following code changes.\n\n{prompt}\n\n\
             Response format:\n- Start with PASS or FAIL\n- Explain the reason\n"
        );
        let result = self.execute(&review_prompt, task_id).await?;

        if !result.success {
            return Ok(ReviewResult {
                passed: false,
                feedback: String::new(),
                error_message: result.error_message,
            });
        }

        let output = result.stdout.trim().to_string();
        let passed = output.to_uppercase().starts_with("PASS");
        Ok(ReviewResult {
            passed,
            feedback: output,
            error_message: None,
        })
    }
}

// ── Shell command ────────────────────────────────────────────────────────

/// Runs an arbitrary command with the prompt on stdin. Useful for wiring
/// up other agent CLIs without a dedicated backend.
pub struct ShellExecutor {
    workspace_dir: String,
    command: String,
    timeout_s: u64,
}

impl ShellExecutor {
    pub fn new(
        workspace_dir: impl Into<String>,
        command: impl Into<String>,
        timeout_s: u64,
    ) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            command: command.into(),
            timeout_s,
        }
    }

    async fn run(&self, prompt: &str) -> Result<ExecutionResult> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn shell executor")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await.ok();
        }

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_s),
            child.wait_with_output(),
        )
        .await
        {
            Ok(output) => output.context("shell executor output")?,
            Err(_) => {
                return Ok(ExecutionResult {
                    success: false,
                    output_path: None,
                    error_message: Some(format!(
                        "Execution timed out after {} seconds",
                        self.timeout_s
                    )),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let success = output.status.success();
        Ok(ExecutionResult {
            success,
            output_path: None,
            error_message: if success { None } else { Some(stderr.clone()) },
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, prompt: &str, _task_id: &str) -> Result<ExecutionResult> {
        self.run(prompt).await
    }

    async fn review(&self, prompt: &str, _task_id: &str) -> Result<ReviewResult> {
        let result = self.run(prompt).await?;
        if !result.success {
            return Ok(ReviewResult {
                passed: false,
                feedback: String::new(),
                error_message: result.error_message,
            });
        }
        let output = result.stdout.trim().to_string();
        Ok(ReviewResult {
            passed: output.to_uppercase().starts_with("PASS"),
            feedback: output,
            error_message: None,
        })
    }
}
