use std::process::Command;

use foreman_core::git::{GitCollaborator, ShellGit};

fn run(dir: &std::path::Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// Fresh repository with one commit on `main` and identity configured.
fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), &["init", "-b", "main"]);
    run(dir.path(), &["config", "user.name", "tester"]);
    run(dir.path(), &["config", "user.email", "tester@example.com"]);
    std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
    run(dir.path(), &["add", "."]);
    run(dir.path(), &["commit", "-m", "init"]);
    dir
}

#[test]
fn commit_task_returns_head_hash() {
    let repo = init_repo();
    let git = ShellGit::new(repo.path().to_string_lossy());

    git.create_branch("phase-1-core").unwrap();
    std::fs::write(repo.path().join("lib.rs"), "fn main() {}\n").unwrap();

    let hash = git
        .commit_task("42", "add entry point", "phase-1-core")
        .unwrap();
    assert_eq!(hash.len(), 40);

    let log = Command::new("git")
        .arg("-C")
        .arg(repo.path())
        .args(["log", "-1", "--pretty=%s"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&log.stdout).trim(),
        "feat(task-42): add entry point"
    );
}

#[test]
fn commit_with_no_changes_still_succeeds() {
    let repo = init_repo();
    let git = ShellGit::new(repo.path().to_string_lossy());
    git.create_branch("phase-1-core").unwrap();

    // --allow-empty: completing a task with no tree changes is legal.
    let hash = git.commit_task("7", "no-op task", "phase-1-core").unwrap();
    assert_eq!(hash.len(), 40);
}

#[test]
fn revert_undoes_a_task_commit() {
    let repo = init_repo();
    let git = ShellGit::new(repo.path().to_string_lossy());
    git.create_branch("phase-1-core").unwrap();

    std::fs::write(repo.path().join("feature.rs"), "pub fn f() {}\n").unwrap();
    let hash = git.commit_task("1", "add feature", "phase-1-core").unwrap();
    assert!(repo.path().join("feature.rs").exists());

    git.revert(&hash).unwrap();
    assert!(!repo.path().join("feature.rs").exists());

    // Empty hash is a no-op, not an error.
    git.revert("").unwrap();
}

#[test]
fn merge_phase_lands_branch_on_target() {
    let repo = init_repo();
    let git = ShellGit::new(repo.path().to_string_lossy());
    git.create_branch("phase-1-core").unwrap();

    std::fs::write(repo.path().join("feature.rs"), "pub fn f() {}\n").unwrap();
    git.commit_task("1", "add feature", "phase-1-core").unwrap();

    git.merge_phase("phase-1-core", "main").unwrap();
    assert!(repo.path().join("feature.rs").exists());
}

#[test]
fn operations_outside_a_repo_fail_with_vcs_error() {
    let dir = tempfile::tempdir().unwrap();
    let git = ShellGit::new(dir.path().to_string_lossy());
    let err = git.create_branch("nope").unwrap_err();
    assert_eq!(err.op, "create_branch");
}
