use std::process::Command;

use crate::error::VcsError;

/// VCS side effects of the task lifecycle: one branch per phase, one commit
/// per completed task, revert on reject. Callers must treat failures as
/// non-blocking for task-state progression.
pub trait GitCollaborator: Send + Sync {
    fn create_branch(&self, name: &str) -> Result<(), VcsError>;
    fn commit_task(&self, task_id: &str, title: &str, branch: &str) -> Result<String, VcsError>;
    fn revert(&self, commit_hash: &str) -> Result<(), VcsError>;
    fn merge_phase(&self, branch: &str, target: &str) -> Result<(), VcsError>;
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Subprocess-backed collaborator operating on a single repository.
pub struct ShellGit {
    pub repo_path: String,
}

impl ShellGit {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    fn exec(&self, args: &[&str]) -> Result<ExecResult, VcsError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .map_err(|e| VcsError::new(args.join(" "), e.to_string()))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn run(&self, op: &str, args: &[&str]) -> Result<ExecResult, VcsError> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(VcsError::new(op, result.combined_output()));
        }
        Ok(result)
    }
}

impl GitCollaborator for ShellGit {
    fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.run("create_branch", &["checkout", "-b", name])?;
        Ok(())
    }

    fn commit_task(&self, task_id: &str, title: &str, branch: &str) -> Result<String, VcsError> {
        self.run("commit_task", &["checkout", branch])?;
        self.run("commit_task", &["add", "-A"])?;
        let message = format!("feat(task-{task_id}): {title}");
        self.run("commit_task", &["commit", "-m", &message, "--allow-empty"])?;
        let head = self.run("commit_task", &["rev-parse", "HEAD"])?;
        Ok(head.stdout.trim().to_string())
    }

    fn revert(&self, commit_hash: &str) -> Result<(), VcsError> {
        if commit_hash.is_empty() {
            return Ok(());
        }
        self.run("revert", &["revert", "--no-edit", commit_hash])?;
        Ok(())
    }

    fn merge_phase(&self, branch: &str, target: &str) -> Result<(), VcsError> {
        self.run("merge_phase", &["checkout", target])?;
        self.run("merge_phase", &["merge", branch, "--no-ff"])?;
        Ok(())
    }
}
