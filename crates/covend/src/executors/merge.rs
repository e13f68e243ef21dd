//! Merge step executor.
//!
//! Commits the worktree's outstanding changes, then either suspends the
//! workflow for review (`require_review: true`, the default) or merges
//! the task branch into the target branch directly. Merge conflicts
//! block the workflow with the conflicting paths recorded.

use super::{fail_record, ExecEnv, StepOutcome, StepSignal};
use crate::git::{self, GitError};
use coven_core::{MergeReview, StepAction, StepRecord};
use std::time::Instant;
use tracing::{info, warn};

pub async fn run(env: &ExecEnv, name: &str, require_review: bool) -> StepOutcome {
    let started = Instant::now();

    let target = match resolve_target(env) {
        Ok(target) => target,
        Err(e) => {
            return StepOutcome::from_record(fail_record(
                name,
                "merge_failed",
                format!("cannot resolve merge target: {e}"),
                StepAction::Block,
                started.elapsed().as_millis() as u64,
            ));
        }
    };

    // Outstanding work is committed first so the review (or merge) sees
    // everything the agents produced.
    let commit = match git::commit_all(
        &env.worktree.path,
        &format!("coven: finish work for {}", env.bead_id),
    ) {
        Ok(commit) => commit,
        Err(e) => {
            return StepOutcome::from_record(fail_record(
                name,
                "merge_failed",
                format!("failed to commit worktree changes: {e}"),
                StepAction::Block,
                started.elapsed().as_millis() as u64,
            ));
        }
    };

    if require_review {
        info!(workflow = %env.workflow_id, bead = %env.bead_id, target, "merge awaiting review");
        let review = MergeReview {
            target_branch: target,
            commit,
            approved: None,
            reason: None,
            conflicts: Vec::new(),
        };
        return StepOutcome {
            record: StepRecord {
                name: name.to_string(),
                success: true,
                output: "awaiting merge review".to_string(),
                outputs: None,
                exit_code: None,
                status: "pending_review".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                action: StepAction::Continue,
            },
            signal: StepSignal::PendingMerge,
            merge_review: Some(review),
            nested_records: Vec::new(),
        };
    }

    perform(env, name, &target, started)
}

/// Merge the task branch into the target. Shared by the direct path and
/// the approve-merge control call.
pub fn perform(env: &ExecEnv, name: &str, target: &str, started: Instant) -> StepOutcome {
    let message = format!("coven: merge {} for {}", env.worktree.branch, env.bead_id);
    match git::merge_branch(&env.repo, target, &env.worktree.branch, &message) {
        Ok(commit) => {
            info!(workflow = %env.workflow_id, bead = %env.bead_id, target, commit = %commit, "merged");
            StepOutcome {
                record: StepRecord {
                    name: name.to_string(),
                    success: true,
                    output: format!("merged into {target} at {commit}"),
                    outputs: None,
                    exit_code: None,
                    status: "merged".to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    action: StepAction::Continue,
                },
                signal: StepSignal::None,
                merge_review: Some(MergeReview {
                    target_branch: target.to_string(),
                    commit: Some(commit),
                    approved: None,
                    reason: None,
                    conflicts: Vec::new(),
                }),
                nested_records: Vec::new(),
            }
        }
        Err(GitError::MergeConflict(conflicts)) => {
            warn!(workflow = %env.workflow_id, bead = %env.bead_id, ?conflicts, "merge conflict");
            StepOutcome {
                record: StepRecord {
                    name: name.to_string(),
                    success: false,
                    output: format!("merge conflict in: {}", conflicts.join(", ")),
                    outputs: None,
                    exit_code: None,
                    status: "merge_conflict".to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    action: StepAction::Block,
                },
                signal: StepSignal::None,
                merge_review: Some(MergeReview {
                    target_branch: target.to_string(),
                    commit: None,
                    approved: None,
                    reason: None,
                    conflicts,
                }),
                nested_records: Vec::new(),
            }
        }
        Err(e) => StepOutcome::from_record(fail_record(
            name,
            "merge_failed",
            e.to_string(),
            StepAction::Block,
            started.elapsed().as_millis() as u64,
        )),
    }
}

fn resolve_target(env: &ExecEnv) -> crate::git::Result<String> {
    if env.config.merge_target.is_empty() {
        git::detect_default_branch(&env.repo)
    } else {
        Ok(env.config.merge_target.clone())
    }
}
