//! Git operations for worktree isolation and merge steps.
//!
//! Thin wrappers over the `git` CLI. Worktree mutations and merges on
//! the shared repository serialise on a process-wide lock; per-worktree
//! operations (status, commit) run against the worktree path and need no
//! coordination beyond the worktree's single-owner rule.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict in: {}", .0.join(", "))]
    MergeConflict(Vec<String>),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Serialises worktree add/remove/prune and merges on the shared repo.
static REPO_LOCK: Mutex<()> = Mutex::new(());

fn repo_guard() -> std::sync::MutexGuard<'static, ()> {
    match REPO_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new("git").args(args).current_dir(cwd).output()?)
}

fn git_ok(cwd: &Path, args: &[&str]) -> Result<Output> {
    let output = git(cwd, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(output)
}

fn stdout_string(output: &Output) -> Result<String> {
    String::from_utf8(output.stdout.clone())
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Check whether `path` is inside a git work tree.
pub fn is_repo(path: &Path) -> bool {
    git(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Ensure `path` is a git repository.
pub fn ensure_repo(path: &Path) -> Result<()> {
    if is_repo(path) {
        Ok(())
    } else {
        Err(GitError::NotARepo(path.display().to_string()))
    }
}

/// Detect the default branch for a repository.
///
/// Tries `git symbolic-ref refs/remotes/origin/HEAD` first (tracks remote
/// default), then local `main`, then `master`.
pub fn detect_default_branch(repo: &Path) -> Result<String> {
    let output = git(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if output.status.success() {
        let full_ref = stdout_string(&output)?;
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = git(
            repo,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = git(
        repo,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

/// Create a worktree at `worktree_path` on `branch`, creating the branch
/// from `base` if needed.
pub fn worktree_add(repo: &Path, worktree_path: &Path, branch: &str, base: &str) -> Result<()> {
    let _guard = repo_guard();

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path_str = worktree_path.to_string_lossy();
    if branch_exists(repo, branch)? {
        git_ok(repo, &["worktree", "add", path_str.as_ref(), branch])?;
    } else {
        git_ok(
            repo,
            &["worktree", "add", "-b", branch, path_str.as_ref(), base],
        )?;
    }
    Ok(())
}

/// Remove a worktree and prune the registry. Forced: task worktrees may
/// hold uncommitted scratch when a workflow is cancelled.
pub fn worktree_remove(repo: &Path, worktree_path: &Path) -> Result<()> {
    let _guard = repo_guard();

    let path_str = worktree_path.to_string_lossy();
    let output = git(repo, &["worktree", "remove", "--force", path_str.as_ref()])?;
    if !output.status.success() {
        // Registry may be stale (directory deleted out from under git).
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
    }
    git_ok(repo, &["worktree", "prune"])?;
    Ok(())
}

/// Paths of registered worktrees, excluding the main checkout.
pub fn worktree_list(repo: &Path) -> Result<Vec<PathBuf>> {
    let output = git_ok(repo, &["worktree", "list", "--porcelain"])?;
    let text = stdout_string(&output)?;
    let mut paths: Vec<PathBuf> = text
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect();
    // The first entry is the main checkout.
    if !paths.is_empty() {
        paths.remove(0);
    }
    Ok(paths)
}

/// Delete a local branch, ignoring absence.
pub fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    let _guard = repo_guard();
    let _ = git(repo, &["branch", "-D", branch])?;
    Ok(())
}

/// Current HEAD commit of a checkout.
pub fn current_commit(checkout: &Path) -> Result<String> {
    let output = git_ok(checkout, &["rev-parse", "HEAD"])?;
    stdout_string(&output)
}

/// Whether the checkout has uncommitted changes (staged, unstaged, or
/// untracked).
pub fn has_uncommitted_changes(checkout: &Path) -> Result<bool> {
    let output = git_ok(checkout, &["status", "--porcelain"])?;
    Ok(!output.stdout.is_empty())
}

/// Stage everything and commit. Returns the new commit hash, or `None`
/// when there was nothing to commit.
pub fn commit_all(checkout: &Path, message: &str) -> Result<Option<String>> {
    if !has_uncommitted_changes(checkout)? {
        return Ok(None);
    }
    git_ok(checkout, &["add", "-A"])?;
    git_ok(checkout, &["commit", "-m", message])?;
    current_commit(checkout).map(Some)
}

/// Merge `branch` into `target` inside the main checkout.
///
/// On conflict the merge is aborted and the conflicting paths are
/// returned in [`GitError::MergeConflict`].
pub fn merge_branch(repo: &Path, target: &str, branch: &str, message: &str) -> Result<String> {
    let _guard = repo_guard();

    git_ok(repo, &["checkout", target])?;
    let output = git(repo, &["merge", "--no-ff", "-m", message, branch])?;
    if output.status.success() {
        return current_commit(repo);
    }

    let conflicts = conflicting_paths(repo)?;
    let _ = git(repo, &["merge", "--abort"])?;
    if conflicts.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(GitError::CommandFailed(format!(
            "git merge {branch}: {} {}",
            stdout.trim(),
            stderr.trim()
        )));
    }
    Err(GitError::MergeConflict(conflicts))
}

/// Paths with merge conflicts in the checkout.
fn conflicting_paths(checkout: &Path) -> Result<Vec<String>> {
    let output = git(checkout, &["diff", "--name-only", "--diff-filter=U"])?;
    if !output.status.success() {
        return Ok(Vec::new());
    }
    let text = stdout_string(&output)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(dir: &Path, args: &[&str]) {
        let out = Command::new(args[0])
            .args(&args[1..])
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "{:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["git", "init", "-b", "main"]);
        run(dir.path(), &["git", "config", "user.email", "test@test.com"]);
        run(dir.path(), &["git", "config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        run(dir.path(), &["git", "add", "."]);
        run(dir.path(), &["git", "commit", "-m", "initial"]);
        dir
    }

    #[test]
    fn detects_repositories() {
        let dir = setup_repo();
        assert!(is_repo(dir.path()));
        assert!(ensure_repo(dir.path()).is_ok());

        let empty = TempDir::new().unwrap();
        assert!(!is_repo(empty.path()));
        assert!(matches!(
            ensure_repo(empty.path()),
            Err(GitError::NotARepo(_))
        ));
    }

    #[test]
    fn detects_default_branch() {
        let dir = setup_repo();
        assert_eq!(detect_default_branch(dir.path()).unwrap(), "main");
    }

    #[test]
    fn worktree_add_list_remove() {
        let dir = setup_repo();
        let wt = dir.path().join(".coven/worktrees/cv-1");

        worktree_add(dir.path(), &wt, "coven/cv-1", "main").unwrap();
        assert!(wt.exists());
        assert!(branch_exists(dir.path(), "coven/cv-1").unwrap());

        let listed = worktree_list(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with(".coven/worktrees/cv-1") || listed[0] == wt);

        worktree_remove(dir.path(), &wt).unwrap();
        assert!(!wt.exists());
        assert!(worktree_list(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn worktree_add_reuses_existing_branch() {
        let dir = setup_repo();
        run(dir.path(), &["git", "branch", "coven/cv-2"]);
        let wt = dir.path().join(".coven/worktrees/cv-2");
        worktree_add(dir.path(), &wt, "coven/cv-2", "main").unwrap();
        assert!(wt.exists());
    }

    #[test]
    fn commit_all_and_dirty_detection() {
        let dir = setup_repo();
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
        assert!(commit_all(dir.path(), "noop").unwrap().is_none());

        std::fs::write(dir.path().join("new.txt"), "content").unwrap();
        assert!(has_uncommitted_changes(dir.path()).unwrap());
        let commit = commit_all(dir.path(), "add new.txt").unwrap();
        assert!(commit.is_some());
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn merge_fast_path() {
        let dir = setup_repo();
        let wt = dir.path().join(".coven/worktrees/cv-3");
        worktree_add(dir.path(), &wt, "coven/cv-3", "main").unwrap();
        std::fs::write(wt.join("feature.txt"), "feature").unwrap();
        commit_all(&wt, "feature work").unwrap();

        let merged = merge_branch(dir.path(), "main", "coven/cv-3", "merge cv-3").unwrap();
        assert!(!merged.is_empty());
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_conflict_reports_paths_and_aborts() {
        let dir = setup_repo();
        let wt = dir.path().join(".coven/worktrees/cv-4");
        worktree_add(dir.path(), &wt, "coven/cv-4", "main").unwrap();

        // Diverge the same file on both sides.
        std::fs::write(wt.join("README.md"), "# worktree version\n").unwrap();
        commit_all(&wt, "worktree change").unwrap();
        std::fs::write(dir.path().join("README.md"), "# main version\n").unwrap();
        commit_all(dir.path(), "main change").unwrap();

        let err = merge_branch(dir.path(), "main", "coven/cv-4", "merge cv-4").unwrap_err();
        let GitError::MergeConflict(paths) = err else {
            panic!("expected merge conflict, got: {err:?}");
        };
        assert_eq!(paths, vec!["README.md".to_string()]);

        // The merge was aborted; the checkout is clean again.
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn delete_branch_is_idempotent() {
        let dir = setup_repo();
        run(dir.path(), &["git", "branch", "doomed"]);
        delete_branch(dir.path(), "doomed").unwrap();
        delete_branch(dir.path(), "doomed").unwrap();
        assert!(!branch_exists(dir.path(), "doomed").unwrap());
    }
}
