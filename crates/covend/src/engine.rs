//! Workflow engine: drives one grimoire against one bead.
//!
//! The engine owns the workflow record. It creates the worktree, seeds
//! the context with the bead snapshot, walks the step sequence with
//! `when` gates, persists the full workflow state atomically after every
//! step boundary, and appends a JSONL execution log. Blocked and
//! pending-merge workflows park on disk; `retry` and `approve-merge`
//! relaunch the engine from the persisted record, which re-enters at the
//! first unexecuted step so no step ever runs twice.

use crate::beads::BeadSource;
use crate::executors::{self, merge as merge_exec, ExecEnv, StepSignal};
use crate::process::ProcessManager;
use crate::spellbook::Spellbook;
use crate::state::{write_json_atomic, StateStore};
use crate::worktree::WorktreeManager;
use chrono::Utc;
use coven_core::events::{
    StepCompletedPayload, StepStartedPayload, WorkflowBlockedPayload, WorkflowEndedPayload,
    WorkflowPendingMergePayload, WorkflowStartedPayload,
};
use coven_core::{
    Bead, BeadStatus, Config, Context, EventName, EventPayload, Grimoire, Id, MergeReview,
    Renderer, Step, StepAction, StepKind, StepRecord, Workflow, WorkflowStatus,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared components the engine borrows from the daemon.
#[derive(Clone)]
pub struct EngineParams {
    pub repo: PathBuf,
    pub coven_dir: PathBuf,
    pub config: Config,
    pub spellbook: Arc<Spellbook>,
    pub processes: Arc<ProcessManager>,
    pub state: Arc<StateStore>,
    pub worktrees: Arc<WorktreeManager>,
    pub beads: Arc<dyn BeadSource>,
}

impl std::fmt::Debug for EngineParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineParams")
            .field("repo", &self.repo)
            .finish()
    }
}

impl EngineParams {
    /// Path of a workflow's persisted state file.
    pub fn workflow_file(&self, id: &Id) -> PathBuf {
        self.coven_dir.join("state/workflows").join(format!("{id}.json"))
    }

    /// Path of a workflow's JSONL execution log.
    pub fn workflow_log(&self, id: &Id) -> PathBuf {
        self.coven_dir.join("logs/workflows").join(format!("{id}.jsonl"))
    }
}

/// One engine execution, fresh or resumed.
pub struct WorkflowEngine {
    params: EngineParams,
    grimoire: Grimoire,
    bead: Bead,
    workflow: Workflow,
    cancel: CancellationToken,
    fresh: bool,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflow", &self.workflow.id)
            .field("bead", &self.bead.id)
            .finish()
    }
}

impl WorkflowEngine {
    /// Engine for a newly launched workflow.
    pub fn start(
        params: EngineParams,
        bead: Bead,
        grimoire: Grimoire,
        cancel: CancellationToken,
    ) -> Self {
        let workflow = Workflow {
            id: Id::new(),
            bead_id: bead.id.clone(),
            grimoire_name: grimoire.name.clone(),
            worktree_path: String::new(),
            status: WorkflowStatus::Running,
            current_step: 0,
            completed_steps: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            merge_review: None,
        };
        Self {
            params,
            grimoire,
            bead,
            workflow,
            cancel,
            fresh: true,
        }
    }

    /// Engine resuming a persisted workflow (daemon restart, retry, or
    /// merge approval).
    pub fn resume(
        params: EngineParams,
        workflow: Workflow,
        bead: Bead,
        grimoire: Grimoire,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            params,
            grimoire,
            bead,
            workflow,
            cancel,
            fresh: false,
        }
    }

    pub fn workflow_id(&self) -> Id {
        self.workflow.id.clone()
    }

    /// Drive the workflow until it completes, blocks, suspends for merge
    /// review, fails, or is cancelled. Returns the final record.
    pub async fn run(mut self) -> Workflow {
        self.setup();

        let worktree = match self.params.worktrees.create(&self.bead.id) {
            Ok(info) => info,
            Err(e) => {
                self.finish(WorkflowStatus::Failed, Some(format!("worktree: {e}")));
                return self.workflow;
            }
        };
        self.workflow.worktree_path = worktree.path.display().to_string();
        self.persist();

        let env = ExecEnv {
            workflow_id: self.workflow.id.clone(),
            bead_id: self.bead.id.clone(),
            repo: self.params.repo.clone(),
            worktree,
            config: self.params.config.clone(),
            spellbook: Arc::clone(&self.params.spellbook),
            processes: Arc::clone(&self.params.processes),
            state: Arc::clone(&self.params.state),
            cancel: self.cancel.clone(),
            grimoire_timeout: self.grimoire.timeout,
        };

        let mut ctx = self.rebuild_context();

        let steps = self.grimoire.steps.clone();
        let total = steps.len();
        while self.workflow.current_step < total {
            if self.cancel.is_cancelled() {
                self.cancelled().await;
                return self.workflow;
            }

            let idx = self.workflow.current_step;
            let step = &steps[idx];
            self.log_event(serde_json::json!({
                "event": "step_start",
                "step": step.name,
                "index": idx,
                "kind": step.kind.kind_name(),
            }));
            self.publish(
                EventName::WorkflowStepStarted,
                EventPayload::StepStarted(StepStartedPayload {
                    workflow_id: self.workflow.id.clone(),
                    step: step.name.clone(),
                    step_index: idx,
                }),
            );

            // `when` gate.
            if let Some(when) = &step.when {
                let renderer = Renderer::new(self.params.spellbook.as_ref());
                match renderer.render_condition(when, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        let record = StepRecord::skipped(&step.name);
                        self.record_step(step, record, &mut ctx);
                        continue;
                    }
                    Err(e) => {
                        self.blocked(&step.name, format!("condition error: {e}"));
                        return self.workflow;
                    }
                }
            }

            // A merge step resumed after approval performs the merge
            // directly instead of gating again.
            let outcome = if let (StepKind::Merge { .. }, Some(review)) =
                (&step.kind, self.approved_review())
            {
                merge_exec::perform(&env, &step.name, &review.target_branch, Instant::now())
            } else {
                executors::execute(&env, step, &mut ctx, false).await
            };

            if self.cancel.is_cancelled() {
                self.cancelled().await;
                return self.workflow;
            }

            // Loop iterations surface their nested records in order.
            for nested in &outcome.nested_records {
                self.log_event(serde_json::json!({
                    "event": "loop_iteration_step",
                    "loop": step.name,
                    "step": nested.name,
                    "success": nested.success,
                    "action": nested.action.as_str(),
                }));
                self.workflow.completed_steps.push(nested.clone());
            }

            if let Some(review) = &outcome.merge_review {
                self.workflow.merge_review = Some(review.clone());
            }

            if outcome.signal == StepSignal::PendingMerge {
                self.pending_merge();
                return self.workflow;
            }

            match outcome.record.action {
                StepAction::Continue => {
                    self.record_step(step, outcome.record, &mut ctx);
                }
                StepAction::ExitLoop => {
                    // Only valid inside a loop; a top-level occurrence is
                    // a definition error.
                    self.finish(
                        WorkflowStatus::Failed,
                        Some(format!("step {}: exit_loop outside a loop", step.name)),
                    );
                    return self.workflow;
                }
                StepAction::Block => {
                    self.blocked(&step.name, outcome.record.output.clone());
                    return self.workflow;
                }
                StepAction::Fail => {
                    self.finish(WorkflowStatus::Failed, Some(outcome.record.output.clone()));
                    return self.workflow;
                }
            }
        }

        self.completed();
        self.workflow
    }

    /// First-run bookkeeping: register, announce, move the bead.
    fn setup(&mut self) {
        if self.fresh {
            info!(
                workflow = %self.workflow.id,
                bead = %self.bead.id,
                grimoire = %self.grimoire.name,
                "workflow starting"
            );
            self.log_event(serde_json::json!({
                "event": "workflow_start",
                "bead": self.bead.id,
                "grimoire": self.grimoire.name,
            }));
            self.update_bead(BeadStatus::InProgress);
        } else {
            info!(
                workflow = %self.workflow.id,
                bead = %self.bead.id,
                step = self.workflow.current_step,
                "workflow resuming"
            );
            self.log_event(serde_json::json!({
                "event": "workflow_resume",
                "step": self.workflow.current_step,
            }));
            self.workflow.status = WorkflowStatus::Running;
            self.workflow.error = None;
        }
        self.persist();
        self.publish(
            EventName::WorkflowStarted,
            EventPayload::WorkflowStarted(WorkflowStartedPayload {
                workflow_id: self.workflow.id.clone(),
                bead_id: self.bead.id.clone(),
                grimoire: self.grimoire.name.clone(),
                worktree: self.workflow.worktree_path.clone(),
            }),
        );
    }

    /// Rebuild the render context from the persisted step records.
    fn rebuild_context(&self) -> Context {
        let mut ctx = Context::with_bead(self.bead.clone());
        let mut previous = None;
        for record in &self.workflow.completed_steps {
            ctx.upsert_step(&record.name, record.clone());
            previous = Some(record.clone());
        }
        if let Some(record) = previous {
            ctx.set_previous(record);
        }
        // Re-apply output aliases from the definition.
        for step in &self.grimoire.steps {
            apply_alias(&mut ctx, step);
        }
        ctx
    }

    /// Store a finished step: context, record list, cursor, persistence,
    /// events.
    fn record_step(&mut self, step: &Step, record: StepRecord, ctx: &mut Context) {
        if let Err(e) = ctx.insert_step(&step.name, record.clone()) {
            // Re-recording a step is a programmer error; surface loudly
            // but keep the workflow consistent by overwriting nothing.
            error!(workflow = %self.workflow.id, step = %step.name, error = %e, "duplicate step record");
        }
        if let Some(alias) = &step.output {
            ctx.upsert_step(alias, record.clone());
        }
        ctx.set_previous(record.clone());

        let idx = self.workflow.current_step;
        self.log_event(serde_json::json!({
            "event": "step_end",
            "step": step.name,
            "index": idx,
            "success": record.success,
            "status": record.status,
            "action": record.action.as_str(),
            "duration_ms": record.duration_ms,
        }));
        self.publish(
            EventName::WorkflowStepCompleted,
            EventPayload::StepCompleted(StepCompletedPayload {
                workflow_id: self.workflow.id.clone(),
                step: step.name.clone(),
                step_index: idx,
                record: record.clone(),
            }),
        );

        self.workflow.completed_steps.push(record);
        self.workflow.current_step = idx + 1;
        self.persist();
    }

    fn approved_review(&self) -> Option<MergeReview> {
        self.workflow
            .merge_review
            .clone()
            .filter(|r| r.approved == Some(true))
    }

    fn blocked(&mut self, step: &str, error: String) {
        warn!(workflow = %self.workflow.id, step, error = %error, "workflow blocked");
        self.workflow.status = WorkflowStatus::Blocked;
        self.workflow.error = Some(error.clone());
        self.persist();
        self.update_bead(BeadStatus::Blocked);
        self.log_event(serde_json::json!({
            "event": "workflow_blocked",
            "step": step,
            "error": error,
        }));
        self.publish(
            EventName::WorkflowBlocked,
            EventPayload::WorkflowBlocked(WorkflowBlockedPayload {
                workflow_id: self.workflow.id.clone(),
                step: step.to_string(),
                error,
            }),
        );
    }

    fn pending_merge(&mut self) {
        let target = self
            .workflow
            .merge_review
            .as_ref()
            .map(|r| r.target_branch.clone())
            .unwrap_or_default();
        info!(workflow = %self.workflow.id, target, "workflow pending merge review");
        self.workflow.status = WorkflowStatus::PendingMerge;
        self.persist();
        self.update_bead(BeadStatus::PendingMerge);
        self.log_event(serde_json::json!({
            "event": "workflow_pending_merge",
            "target": target,
        }));
        self.publish(
            EventName::WorkflowPendingMerge,
            EventPayload::WorkflowPendingMerge(WorkflowPendingMergePayload {
                workflow_id: self.workflow.id.clone(),
                target_branch: target,
            }),
        );
    }

    fn completed(&mut self) {
        info!(workflow = %self.workflow.id, bead = %self.bead.id, "workflow completed");
        self.finish(WorkflowStatus::Completed, None);
        self.update_bead(BeadStatus::Closed);

        // The worktree's purpose ends with a successful workflow.
        if let Err(e) = self.params.worktrees.remove(&self.bead.id) {
            warn!(workflow = %self.workflow.id, error = %e, "worktree removal failed");
        }
        self.params.processes.cleanup(&self.bead.id);
    }

    async fn cancelled(&mut self) {
        info!(workflow = %self.workflow.id, bead = %self.bead.id, "workflow cancelled");
        // Any agent for this bead dies with the workflow.
        if let Err(e) = self.params.processes.stop(&self.bead.id).await {
            warn!(workflow = %self.workflow.id, error = %e, "agent stop during cancel failed");
        }
        let before_first_step = self.workflow.completed_steps.is_empty();
        self.finish(WorkflowStatus::Cancelled, None);

        // Untouched worktrees are removed eagerly; anything with work in
        // it is left for the orphan sweep (and manual salvage).
        if before_first_step {
            if let Err(e) = self.params.worktrees.remove(&self.bead.id) {
                warn!(workflow = %self.workflow.id, error = %e, "worktree removal failed");
            }
        }
        self.params.processes.cleanup(&self.bead.id);
    }

    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.workflow.status = status;
        self.workflow.ended_at = Some(Utc::now());
        if error.is_some() {
            self.workflow.error = error;
        }
        self.persist();
        self.log_event(serde_json::json!({
            "event": "workflow_end",
            "status": status.as_str(),
            "error": self.workflow.error,
        }));
        let name = match status {
            WorkflowStatus::Cancelled => EventName::WorkflowCancelled,
            _ => EventName::WorkflowCompleted,
        };
        self.publish(
            name,
            EventPayload::WorkflowEnded(WorkflowEndedPayload {
                workflow_id: self.workflow.id.clone(),
                bead_id: self.bead.id.clone(),
                status: status.as_str().to_string(),
                error: self.workflow.error.clone(),
            }),
        );
    }

    /// Persist the workflow record atomically and mirror it in the store.
    fn persist(&self) {
        self.params.state.put_workflow(self.workflow.clone());
        let path = self.params.workflow_file(&self.workflow.id);
        if let Err(e) = write_json_atomic(&path, &self.workflow) {
            // Advancing without durable state would break resume; the
            // next boundary retries, and the store still has the record.
            error!(workflow = %self.workflow.id, error = %e, "workflow persist failed");
        }
    }

    fn update_bead(&self, status: BeadStatus) {
        if let Err(e) = self.params.beads.update_status(&self.bead.id, status) {
            warn!(bead = %self.bead.id, error = %e, "bead status update failed");
        }
        self.params.state.update_bead_status(&self.bead.id, status);
    }

    fn publish(&self, name: EventName, payload: EventPayload) {
        self.params.state.broker().publish(name, payload);
    }

    /// Append one record to the workflow's JSONL execution log.
    fn log_event(&self, mut value: serde_json::Value) {
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "ts".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
            obj.insert(
                "workflow".to_string(),
                serde_json::Value::String(self.workflow.id.to_string()),
            );
        }
        let path = self.params.workflow_log(&self.workflow.id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{value}"));
        if let Err(e) = result {
            warn!(workflow = %self.workflow.id, error = %e, "workflow log append failed");
        }
    }
}

fn apply_alias(ctx: &mut Context, step: &Step) {
    if let Some(alias) = &step.output {
        if let Ok(value) = ctx.get_path(&step.name) {
            if let coven_core::Value::StepView(record) = value {
                ctx.upsert_step(alias, record);
            }
        }
    }
    if let StepKind::Loop { steps, .. } = &step.kind {
        for nested in steps {
            apply_alias(ctx, nested);
        }
    }
}

/// Load all persisted workflow records from `<coven>/state/workflows`.
pub fn load_persisted_workflows(params: &EngineParams) -> Vec<Workflow> {
    let dir = params.coven_dir.join("state/workflows");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut workflows = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Workflow>(&text).map_err(|e| e.to_string()))
        {
            Ok(workflow) => workflows.push(workflow),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable workflow file"),
        }
    }
    workflows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    workflows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::StaticBeadSource;
    use crate::broker::Broker;
    use tempfile::TempDir;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        std::fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "initial"]] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
            assert!(out.status.success());
        }
        dir
    }

    fn bead(id: &str) -> Bead {
        Bead {
            id: id.to_string(),
            title: format!("bead {id}"),
            body: String::new(),
            bead_type: "feature".to_string(),
            priority: 0,
            labels: Vec::new(),
            status: BeadStatus::Open,
        }
    }

    fn params(dir: &TempDir, source: Arc<StaticBeadSource>) -> EngineParams {
        let coven_dir = dir.path().join(".coven");
        let broker = Arc::new(Broker::with_defaults());
        let state = Arc::new(
            crate::state::StateStore::load_or_default(coven_dir.join("state.json"), broker)
                .unwrap(),
        );
        EngineParams {
            repo: dir.path().to_path_buf(),
            coven_dir,
            config: Config::default(),
            spellbook: Arc::new(Spellbook::builtin_only().unwrap()),
            processes: Arc::new(ProcessManager::with_defaults()),
            state,
            worktrees: Arc::new(WorktreeManager::new(dir.path())),
            beads: source,
        }
    }

    fn grimoire(yaml: &str) -> Grimoire {
        Grimoire::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn trivial_script_workflow_completes() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-1")]));
        let params = params(&dir, Arc::clone(&source));
        let (_id, mut rx) = params.state.broker().subscribe();

        let g = grimoire(
            "name: t1\nsteps:\n  - name: echo\n    type: script\n    command: printf hello\n",
        );
        let engine = WorkflowEngine::start(
            params.clone(),
            bead("cv-1"),
            g,
            CancellationToken::new(),
        );
        let id = engine.workflow_id();
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.completed_steps.len(), 1);
        assert_eq!(workflow.completed_steps[0].output, "hello");
        assert_eq!(workflow.current_step, 1);

        // Task closed at the source and in the store.
        assert_eq!(source.all()[0].status, BeadStatus::Closed);

        // Worktree destroyed after success.
        assert!(!params.worktrees.exists("cv-1"));

        // Persisted record matches.
        let on_disk: Workflow = serde_json::from_str(
            &std::fs::read_to_string(params.workflow_file(&id)).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.status, WorkflowStatus::Completed);

        // Event order: started, step_started, step_completed, completed.
        let mut names = Vec::new();
        while let Ok(env) = rx.try_recv() {
            names.push(env.name);
        }
        let workflow_events: Vec<EventName> = names
            .into_iter()
            .filter(|n| {
                matches!(
                    n,
                    EventName::WorkflowStarted
                        | EventName::WorkflowStepStarted
                        | EventName::WorkflowStepCompleted
                        | EventName::WorkflowCompleted
                )
            })
            .collect();
        assert_eq!(
            workflow_events,
            vec![
                EventName::WorkflowStarted,
                EventName::WorkflowStepStarted,
                EventName::WorkflowStepCompleted,
                EventName::WorkflowCompleted,
            ]
        );

        // JSONL log exists with start and end records.
        let log = std::fs::read_to_string(params.workflow_log(&id)).unwrap();
        assert!(log.contains("workflow_start"));
        assert!(log.contains("step_end"));
        assert!(log.contains("workflow_end"));
    }

    #[tokio::test]
    async fn failing_script_blocks_and_retry_reblocks() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-2")]));
        let params = params(&dir, Arc::clone(&source));

        let g = grimoire("name: t2\nsteps:\n  - name: bad\n    type: script\n    command: exit 3\n");
        let engine = WorkflowEngine::start(
            params.clone(),
            bead("cv-2"),
            g.clone(),
            CancellationToken::new(),
        );
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Blocked);
        assert!(workflow.error.as_deref().unwrap().contains("code 3"));
        assert_eq!(workflow.current_step, 0);
        assert!(workflow.completed_steps.is_empty());
        assert_eq!(source.all()[0].status, BeadStatus::Blocked);

        // Retry re-enters the same step and blocks identically.
        let engine = WorkflowEngine::resume(
            params.clone(),
            workflow,
            bead("cv-2"),
            g,
            CancellationToken::new(),
        );
        let workflow = engine.run().await;
        assert_eq!(workflow.status, WorkflowStatus::Blocked);
        assert!(workflow.error.as_deref().unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn when_false_skips_with_synthetic_record() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-3")]));
        let params = params(&dir, Arc::clone(&source));

        let g = grimoire(
            "name: t3\nsteps:\n  - name: gated\n    type: script\n    command: exit 1\n    when: \"false\"\n  - name: after\n    type: script\n    command: true\n",
        );
        let engine =
            WorkflowEngine::start(params, bead("cv-3"), g, CancellationToken::new());
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(workflow.completed_steps.len(), 2);
        assert_eq!(workflow.completed_steps[0].status, "skipped");
    }

    #[tokio::test]
    async fn non_boolean_condition_blocks() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-4")]));
        let params = params(&dir, Arc::clone(&source));

        let g = grimoire(
            "name: t4\nsteps:\n  - name: gated\n    type: script\n    command: true\n    when: maybe\n",
        );
        let engine =
            WorkflowEngine::start(params, bead("cv-4"), g, CancellationToken::new());
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Blocked);
        assert!(workflow.error.as_deref().unwrap().contains("maybe"));
    }

    #[tokio::test]
    async fn test_fix_loop_exits_in_first_iteration() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-5")]));
        let params = params(&dir, Arc::clone(&source));

        let g = grimoire(
            r#"
name: t5
steps:
  - name: fix-loop
    type: loop
    max_iterations: 3
    steps:
      - name: run
        type: script
        command: exit 1
        on_fail: continue
      - name: fix
        type: script
        command: "true"
      - name: verify
        type: script
        command: exit 0
        on_success: exit_loop
"#,
        );
        let engine =
            WorkflowEngine::start(params, bead("cv-5"), g, CancellationToken::new());
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        // Three nested records plus the loop's own record.
        assert_eq!(workflow.completed_steps.len(), 4);
        let loop_record = workflow.completed_steps.last().unwrap();
        assert_eq!(loop_record.name, "fix-loop");
        assert!(loop_record.output.contains("iteration 1"));
    }

    #[tokio::test]
    async fn merge_review_gate_and_approval() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-6")]));
        let params = params(&dir, Arc::clone(&source));

        let g = grimoire(
            "name: t6\nsteps:\n  - name: work\n    type: script\n    command: echo made > thing.txt\n  - name: land\n    type: merge\n    require_review: true\n",
        );
        let engine = WorkflowEngine::start(
            params.clone(),
            bead("cv-6"),
            g.clone(),
            CancellationToken::new(),
        );
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::PendingMerge);
        assert_eq!(source.all()[0].status, BeadStatus::PendingMerge);
        let review = workflow.merge_review.clone().unwrap();
        assert_eq!(review.target_branch, "main");
        assert!(review.commit.is_some());

        // Approve: resume with approved review performs the merge.
        let mut approved = workflow;
        if let Some(review) = approved.merge_review.as_mut() {
            review.approved = Some(true);
        }
        let engine = WorkflowEngine::resume(
            params.clone(),
            approved,
            bead("cv-6"),
            g,
            CancellationToken::new(),
        );
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert_eq!(source.all()[0].status, BeadStatus::Closed);
        assert!(dir.path().join("thing.txt").exists(), "merge did not land");
        assert!(!params.worktrees.exists("cv-6"));
    }

    #[tokio::test]
    async fn cancel_before_first_step_removes_worktree() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-7")]));
        let params = params(&dir, Arc::clone(&source));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let g = grimoire(
            "name: t7\nsteps:\n  - name: never\n    type: script\n    command: true\n",
        );
        let engine = WorkflowEngine::start(params.clone(), bead("cv-7"), g, cancel);
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Cancelled);
        assert!(workflow.completed_steps.is_empty());
        assert!(!params.worktrees.exists("cv-7"));
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-8")]));
        let params = params(&dir, Arc::clone(&source));

        // First run blocks on the second step.
        let g = grimoire(
            "name: t8\nsteps:\n  - name: first\n    type: script\n    command: echo once >> ran.txt\n  - name: second\n    type: script\n    command: test -f unblock\n",
        );
        let engine = WorkflowEngine::start(
            params.clone(),
            bead("cv-8"),
            g.clone(),
            CancellationToken::new(),
        );
        let workflow = engine.run().await;
        assert_eq!(workflow.status, WorkflowStatus::Blocked);
        assert_eq!(workflow.current_step, 1);

        // Unblock and resume; the first step must not run again.
        let worktree = params.worktrees.path_for("cv-8").unwrap();
        std::fs::write(worktree.join("unblock"), "").unwrap();
        let engine = WorkflowEngine::resume(
            params.clone(),
            workflow,
            bead("cv-8"),
            g,
            CancellationToken::new(),
        );
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        // "first" ran exactly once even though the workflow ran twice.
        // The worktree is gone after completion, so check the merged or
        // persisted record instead of the file.
        let first_runs = workflow
            .completed_steps
            .iter()
            .filter(|r| r.name == "first")
            .count();
        assert_eq!(first_runs, 1);
    }

    #[tokio::test]
    async fn persisted_workflows_load_in_start_order() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-9"), bead("cv-10")]));
        let params = params(&dir, Arc::clone(&source));

        for id in ["cv-9", "cv-10"] {
            let g = grimoire(
                "name: t\nsteps:\n  - name: s\n    type: script\n    command: true\n",
            );
            let engine =
                WorkflowEngine::start(params.clone(), bead(id), g, CancellationToken::new());
            engine.run().await;
        }

        let loaded = load_persisted_workflows(&params);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].bead_id, "cv-9");
        assert_eq!(loaded[1].bead_id, "cv-10");
        assert!(loaded.iter().all(|w| w.status == WorkflowStatus::Completed));
    }

    #[tokio::test]
    async fn outputs_flow_between_steps_via_alias() {
        let dir = setup_repo();
        let source = Arc::new(StaticBeadSource::new(vec![bead("cv-11")]));
        let params = params(&dir, Arc::clone(&source));

        // The agent step reads the aliased output of the first step.
        let mut config = params.config.clone();
        config.agent_cmd = "/bin/sh".to_string();
        config.agent_args = vec!["-c".to_string()];
        let params = EngineParams { config, ..params };

        let g = grimoire(
            r#"
name: t11
steps:
  - name: probe
    type: script
    command: printf '{"answer": 42}'
    output: probe-result
  - name: use
    type: agent
    spell: "echo value={{ probe-result.outputs.answer }}"
"#,
        );
        let engine =
            WorkflowEngine::start(params, bead("cv-11"), g, CancellationToken::new());
        let workflow = engine.run().await;

        assert_eq!(workflow.status, WorkflowStatus::Completed);
        let agent_record = &workflow.completed_steps[1];
        assert!(
            agent_record.output.contains("value=42"),
            "got: {}",
            agent_record.output
        );
    }
}
