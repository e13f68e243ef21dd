//! Step executors: one per step kind.
//!
//! Executors translate a grimoire step plus the workflow context into a
//! [`StepRecord`]. They never propagate errors upward; every failure
//! mode becomes a record with an action the engine applies (`continue`,
//! `exit_loop`, `block`, `fail`). Each executor returns within its
//! timeout.

pub mod agent;
pub mod loops;
pub mod merge;
pub mod script;

use crate::process::ProcessManager;
use crate::spellbook::Spellbook;
use crate::state::StateStore;
use crate::worktree::WorktreeInfo;
use coven_core::{Config, Context, Id, MergeReview, Step, StepKind, StepRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything an executor may touch, owned by the workflow engine.
#[derive(Clone)]
pub struct ExecEnv {
    pub workflow_id: Id,
    pub bead_id: String,
    pub repo: PathBuf,
    pub worktree: WorktreeInfo,
    pub config: Config,
    pub spellbook: Arc<Spellbook>,
    pub processes: Arc<ProcessManager>,
    pub state: Arc<StateStore>,
    pub cancel: CancellationToken,
    /// Workflow-level timeout steps inherit when they declare none.
    pub grimoire_timeout: Option<Duration>,
}

impl std::fmt::Debug for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEnv")
            .field("workflow_id", &self.workflow_id)
            .field("bead_id", &self.bead_id)
            .finish()
    }
}

/// Extra control flow a record alone cannot express.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StepSignal {
    #[default]
    None,
    /// A merge step wants human review before merging.
    PendingMerge,
}

/// What an executor hands back to the engine.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub record: StepRecord,
    pub signal: StepSignal,
    /// Merge gate metadata (target, commit, conflicts).
    pub merge_review: Option<MergeReview>,
    /// Records of nested steps a loop executed, in execution order.
    pub nested_records: Vec<StepRecord>,
}

impl StepOutcome {
    pub fn from_record(record: StepRecord) -> Self {
        Self {
            record,
            signal: StepSignal::None,
            merge_review: None,
            nested_records: Vec::new(),
        }
    }
}

/// Effective timeout for a step: its own, else the kind default, else
/// the workflow-level inheritance for loops.
pub fn effective_timeout(env: &ExecEnv, step: &Step) -> Duration {
    if let Some(timeout) = step.timeout {
        return timeout;
    }
    match &step.kind {
        StepKind::Agent { .. } => env.config.agent_timeout(),
        StepKind::Script { .. } => env.config.script_timeout(),
        StepKind::Merge { .. } => env.config.script_timeout(),
        StepKind::Loop { .. } => env
            .grimoire_timeout
            .unwrap_or_else(|| env.config.process_timeout()),
    }
}

/// Dispatch a step to its executor.
///
/// `in_loop` tells script steps whether `on_success: exit_loop` applies.
pub async fn execute(env: &ExecEnv, step: &Step, ctx: &mut Context, in_loop: bool) -> StepOutcome {
    match &step.kind {
        StepKind::Script {
            command,
            on_fail,
            on_success,
        } => script::run(env, &step.name, command, *on_fail, *on_success, step, in_loop).await,
        StepKind::Agent { spell, input } => {
            agent::run(env, &step.name, spell, input, step, ctx).await
        }
        StepKind::Loop {
            max_iterations,
            on_max_iterations,
            steps,
        } => {
            // Nested steps carry their own deadlines; the loop as a whole
            // still has to return within its own.
            let limit = effective_timeout(env, step);
            let body = loops::run(env, &step.name, *max_iterations, *on_max_iterations, steps, ctx);
            match tokio::time::timeout(limit, body).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // An agent mid-step would otherwise outlive the loop.
                    let _ = env.processes.stop(&env.bead_id).await;
                    StepOutcome::from_record(fail_record(
                        &step.name,
                        "timeout",
                        format!("loop timed out after {}s", limit.as_secs()),
                        coven_core::StepAction::Fail,
                        limit.as_millis() as u64,
                    ))
                }
            }
        }
        StepKind::Merge { require_review, .. } => {
            merge::run(env, &step.name, *require_review).await
        }
    }
}

/// Build a failure record with a uniform shape.
pub(crate) fn fail_record(
    name: &str,
    status: &str,
    error: impl Into<String>,
    action: coven_core::StepAction,
    duration_ms: u64,
) -> StepRecord {
    StepRecord {
        name: name.to_string(),
        success: false,
        output: error.into(),
        outputs: None,
        exit_code: None,
        status: status.to_string(),
        duration_ms,
        action,
    }
}
