//! Per-bead git worktree management.
//!
//! Every workflow gets a dedicated worktree under
//! `<repo>/.coven/worktrees/<bead>` on branch `coven/<bead>`, both
//! derived deterministically from the sanitised bead id. Creation and
//! removal are idempotent; worktrees left behind by a previous daemon
//! lifetime are found by the orphan sweep.

use crate::git::{self, GitError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bead id sanitises to nothing: {0:?}")]
    EmptyBeadId(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Location of one bead's worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub bead_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Replace characters git refuses in refs and paths.
///
/// Whitespace and any of `~ ^ : ? * [ \` become `-`; consecutive dots
/// collapse to a single `-`; runs of `-` collapse.
pub fn sanitize_bead_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_dot = false;
    for c in raw.chars() {
        let mapped = match c {
            c if c.is_whitespace() => '-',
            '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '/' => '-',
            '.' => {
                if prev_dot {
                    // ".." is not a valid ref component.
                    out.pop();
                    '-'
                } else {
                    '.'
                }
            }
            c => c,
        };
        prev_dot = mapped == '.';
        out.push(mapped);
    }

    // Collapse dash runs and trim edge dashes/dots.
    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    collapsed.trim_matches(['-', '.']).to_string()
}

/// Worktree manager for one repository.
#[derive(Debug)]
pub struct WorktreeManager {
    repo: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        let repo = repo.into();
        let base_dir = repo.join(".coven/worktrees");
        Self { repo, base_dir }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn info_for(&self, bead_id: &str) -> Result<WorktreeInfo> {
        let slug = sanitize_bead_id(bead_id);
        if slug.is_empty() {
            return Err(WorktreeError::EmptyBeadId(bead_id.to_string()));
        }
        Ok(WorktreeInfo {
            bead_id: bead_id.to_string(),
            path: self.base_dir.join(&slug),
            branch: format!("coven/{slug}"),
        })
    }

    /// The worktree path a bead would use.
    pub fn path_for(&self, bead_id: &str) -> Result<PathBuf> {
        Ok(self.info_for(bead_id)?.path)
    }

    /// The branch a bead's worktree uses.
    pub fn branch_for(&self, bead_id: &str) -> Result<String> {
        Ok(self.info_for(bead_id)?.branch)
    }

    pub fn exists(&self, bead_id: &str) -> bool {
        self.info_for(bead_id)
            .map(|info| info.path.exists())
            .unwrap_or(false)
    }

    /// Create the worktree for a bead. Returns the existing info when it
    /// is already present.
    pub fn create(&self, bead_id: &str) -> Result<WorktreeInfo> {
        let info = self.info_for(bead_id)?;
        if info.path.exists() {
            return Ok(info);
        }

        let base = git::detect_default_branch(&self.repo)?;
        git::worktree_add(&self.repo, &info.path, &info.branch, &base)?;
        info!(bead = bead_id, path = %info.path.display(), branch = %info.branch, "worktree created");
        Ok(info)
    }

    /// Remove a bead's worktree. A no-op when it is already gone.
    pub fn remove(&self, bead_id: &str) -> Result<()> {
        let info = self.info_for(bead_id)?;
        if !info.path.exists() {
            return Ok(());
        }
        git::worktree_remove(&self.repo, &info.path)?;
        info!(bead = bead_id, path = %info.path.display(), "worktree removed");
        Ok(())
    }

    /// Info for an existing worktree.
    pub fn get(&self, bead_id: &str) -> Option<WorktreeInfo> {
        self.info_for(bead_id)
            .ok()
            .filter(|info| info.path.exists())
    }

    /// All worktrees currently on disk under the managed directory.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(slug) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            found.push(WorktreeInfo {
                bead_id: slug.clone(),
                path: entry.path(),
                branch: format!("coven/{slug}"),
            });
        }
        found.sort_by(|a, b| a.bead_id.cmp(&b.bead_id));
        Ok(found)
    }

    /// Worktrees on disk whose bead is not in the active set.
    pub fn detect_orphans(&self, active: &HashSet<String>) -> Result<Vec<WorktreeInfo>> {
        let sanitised_active: HashSet<String> =
            active.iter().map(|id| sanitize_bead_id(id)).collect();
        Ok(self
            .list()?
            .into_iter()
            .filter(|info| !sanitised_active.contains(&info.bead_id))
            .collect())
    }

    /// Remove orphaned worktrees. Failures are logged per orphan and do
    /// not stop the sweep.
    pub fn cleanup_orphans(&self, orphans: &[WorktreeInfo]) -> usize {
        let mut removed = 0;
        for orphan in orphans {
            match git::worktree_remove(&self.repo, &orphan.path) {
                Ok(()) => {
                    info!(path = %orphan.path.display(), "orphan worktree removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %orphan.path.display(), error = %e, "orphan cleanup failed");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "initial"]] {
            let out = Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        dir
    }

    #[test]
    fn sanitises_awkward_ids() {
        assert_eq!(sanitize_bead_id("cv-12"), "cv-12");
        assert_eq!(sanitize_bead_id("a b\tc"), "a-b-c");
        assert_eq!(sanitize_bead_id("x~y^z:w"), "x-y-z-w");
        assert_eq!(sanitize_bead_id("a?*[\\b"), "a-b");
        assert_eq!(sanitize_bead_id("v1..2"), "v1-2");
        assert_eq!(sanitize_bead_id("a...b"), "a-.b");
        assert_eq!(sanitize_bead_id("  spaced  "), "spaced");
        assert_eq!(sanitize_bead_id("dir/sub"), "dir-sub");
    }

    #[test]
    fn empty_sanitisation_is_rejected() {
        let mgr = WorktreeManager::new("/nonexistent");
        assert!(matches!(
            mgr.path_for("???"),
            Err(WorktreeError::EmptyBeadId(_))
        ));
    }

    #[test]
    fn deterministic_paths_and_branches() {
        let mgr = WorktreeManager::new("/repo");
        assert_eq!(
            mgr.path_for("cv-7").unwrap(),
            PathBuf::from("/repo/.coven/worktrees/cv-7")
        );
        assert_eq!(mgr.branch_for("cv-7").unwrap(), "coven/cv-7");
    }

    #[test]
    fn create_is_idempotent() {
        let dir = setup_repo();
        let mgr = WorktreeManager::new(dir.path());

        let first = mgr.create("cv-1").unwrap();
        assert!(first.path.exists());

        let second = mgr.create("cv-1").unwrap();
        assert_eq!(first, second);
        assert!(mgr.exists("cv-1"));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = setup_repo();
        let mgr = WorktreeManager::new(dir.path());
        mgr.create("cv-2").unwrap();

        mgr.remove("cv-2").unwrap();
        assert!(!mgr.exists("cv-2"));
        mgr.remove("cv-2").unwrap();
    }

    #[test]
    fn list_reports_created_worktrees() {
        let dir = setup_repo();
        let mgr = WorktreeManager::new(dir.path());
        assert!(mgr.list().unwrap().is_empty());

        mgr.create("cv-a").unwrap();
        mgr.create("cv-b").unwrap();
        let listed = mgr.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].bead_id, "cv-a");
        assert_eq!(listed[1].branch, "coven/cv-b");
    }

    #[test]
    fn orphan_detection_and_cleanup() {
        let dir = setup_repo();
        let mgr = WorktreeManager::new(dir.path());
        mgr.create("cv-a").unwrap();
        mgr.create("cv-b").unwrap();
        mgr.create("cv-c").unwrap();

        let active: HashSet<String> = ["cv-a".to_string()].into_iter().collect();
        let orphans = mgr.detect_orphans(&active).unwrap();
        let names: Vec<&str> = orphans.iter().map(|o| o.bead_id.as_str()).collect();
        assert_eq!(names, vec!["cv-b", "cv-c"]);

        let removed = mgr.cleanup_orphans(&orphans);
        assert_eq!(removed, 2);
        assert!(mgr.exists("cv-a"));
        assert!(!mgr.exists("cv-b"));
        assert!(!mgr.exists("cv-c"));
    }

    #[test]
    fn get_returns_none_for_missing() {
        let dir = setup_repo();
        let mgr = WorktreeManager::new(dir.path());
        assert!(mgr.get("cv-ghost").is_none());
        mgr.create("cv-real").unwrap();
        assert_eq!(mgr.get("cv-real").unwrap().branch, "coven/cv-real");
    }
}
