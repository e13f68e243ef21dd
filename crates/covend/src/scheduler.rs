//! Scheduler: polls the bead source and launches workflows.
//!
//! One workflow per bead, enforced by a single-flight run table under a
//! mutex. Grimoire resolution follows label, mapping, configured
//! default, then the built-in fallback; a missing named grimoire is an
//! error and nothing launches. Control operations (cancel, retry,
//! approve/reject merge) act on the same table and the persisted
//! records.

use crate::engine::{load_persisted_workflows, EngineParams, WorkflowEngine};
use crate::state::write_json_atomic;
use coven_core::events::WorkflowBlockedPayload;
use coven_core::{Bead, BeadStatus, EventName, EventPayload, Id, Workflow, WorkflowStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("bead not found: {0}")]
    BeadNotFound(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("workflow already running for bead {0}")]
    AlreadyRunning(String),
    #[error("workflow is {actual}, expected {expected}")]
    WrongStatus { expected: String, actual: String },
    #[error(transparent)]
    Spellbook(#[from] crate::spellbook::SpellbookError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A live engine task for one bead.
#[derive(Debug)]
struct RunHandle {
    workflow_id: Id,
    cancel: CancellationToken,
}

pub struct Scheduler {
    params: EngineParams,
    table: Mutex<HashMap<String, RunHandle>>,
    root_cancel: CancellationToken,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish()
    }
}

impl Scheduler {
    pub fn new(params: EngineParams, root_cancel: CancellationToken) -> Self {
        Self {
            params,
            table: Mutex::new(HashMap::new()),
            root_cancel,
        }
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunHandle>> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bead ids with a live engine task.
    pub fn active_beads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Recover persisted workflows after a daemon restart: non-terminal
    /// records re-enter the store, interrupted `running` workflows are
    /// relaunched, and worktrees with no live workflow are swept.
    pub fn recover(self: &Arc<Self>) {
        let persisted = load_persisted_workflows(&self.params);
        let mut active: HashSet<String> = HashSet::new();

        for workflow in persisted {
            if workflow.status.is_terminal() {
                continue;
            }
            active.insert(workflow.bead_id.clone());
            self.params.state.put_workflow(workflow.clone());

            if workflow.status == WorkflowStatus::Running {
                info!(workflow = %workflow.id, bead = %workflow.bead_id, "resuming interrupted workflow");
                if let Err(e) = self.relaunch(workflow) {
                    error!(error = %e, "resume failed");
                }
            }
        }

        match self.params.worktrees.detect_orphans(&active) {
            Ok(orphans) if !orphans.is_empty() => {
                info!(count = orphans.len(), "sweeping orphan worktrees");
                self.params.worktrees.cleanup_orphans(&orphans);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
    }

    /// One poll cycle: refresh the bead list and launch workflows for
    /// ready beads without one.
    pub fn poll_once(self: &Arc<Self>) {
        let ready = match self.params.beads.list_ready() {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "bead poll failed");
                return;
            }
        };

        // Merge the poll into the known bead list, keeping beads the
        // source no longer reports (they hold workflow history).
        let mut known = self.params.state.beads();
        for bead in &ready {
            match known.iter_mut().find(|b| b.id == bead.id) {
                Some(existing) => *existing = bead.clone(),
                None => known.push(bead.clone()),
            }
        }
        self.params.state.set_beads(known);

        for bead in ready {
            if bead.status != BeadStatus::Open {
                continue;
            }
            if let Err(e) = self.launch(bead.clone()) {
                match e {
                    SchedulerError::AlreadyRunning(_) => {}
                    other => {
                        warn!(bead = %bead.id, error = %other, "workflow launch failed");
                    }
                }
            }
        }
    }

    /// The scheduler's polling loop; gated on the session flag.
    pub async fn run_poller(self: Arc<Self>) {
        let interval = self.params.config.poll_interval();
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    if self.params.state.session().running {
                        self.poll_once();
                    }
                }
                () = self.root_cancel.cancelled() => {
                    debug!("scheduler poller stopping");
                    break;
                }
            }
        }
    }

    /// Launch a fresh workflow for a bead. Single-flight per bead.
    pub fn launch(self: &Arc<Self>, bead: Bead) -> Result<Id> {
        let mut table = self.lock_table();
        if table.contains_key(&bead.id) {
            return Err(SchedulerError::AlreadyRunning(bead.id));
        }
        if self.params.state.live_workflow_for_bead(&bead.id).is_some() {
            return Err(SchedulerError::AlreadyRunning(bead.id));
        }

        let grimoire = self
            .params
            .spellbook
            .resolve_for_bead(&bead, &self.params.config.default_grimoire)?
            .clone();

        let cancel = self.root_cancel.child_token();
        let engine = WorkflowEngine::start(
            self.params.clone(),
            bead.clone(),
            grimoire,
            cancel.clone(),
        );
        let workflow_id = engine.workflow_id();

        table.insert(
            bead.id.clone(),
            RunHandle {
                workflow_id: workflow_id.clone(),
                cancel,
            },
        );
        drop(table);

        self.spawn_engine(bead.id, engine);
        Ok(workflow_id)
    }

    /// Relaunch an engine over a persisted workflow record.
    fn relaunch(self: &Arc<Self>, workflow: Workflow) -> Result<Id> {
        let mut table = self.lock_table();
        if table.contains_key(&workflow.bead_id) {
            return Err(SchedulerError::AlreadyRunning(workflow.bead_id));
        }

        let bead = self
            .params
            .state
            .bead(&workflow.bead_id)
            .unwrap_or_else(|| Bead {
                id: workflow.bead_id.clone(),
                title: workflow.bead_id.clone(),
                body: String::new(),
                bead_type: String::new(),
                priority: 0,
                labels: Vec::new(),
                status: BeadStatus::InProgress,
            });

        let grimoire = self
            .params
            .spellbook
            .grimoire(&workflow.grimoire_name)
            .ok_or_else(|| {
                crate::spellbook::SpellbookError::GrimoireNotFound(workflow.grimoire_name.clone())
            })?
            .clone();

        let cancel = self.root_cancel.child_token();
        let workflow_id = workflow.id.clone();
        let bead_id = workflow.bead_id.clone();
        let engine = WorkflowEngine::resume(
            self.params.clone(),
            workflow,
            bead,
            grimoire,
            cancel.clone(),
        );

        table.insert(
            bead_id.clone(),
            RunHandle {
                workflow_id: workflow_id.clone(),
                cancel,
            },
        );
        drop(table);

        self.spawn_engine(bead_id, engine);
        Ok(workflow_id)
    }

    fn spawn_engine(self: &Arc<Self>, bead_id: String, engine: WorkflowEngine) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let workflow = engine.run().await;
            debug!(workflow = %workflow.id, status = workflow.status.as_str(), "engine task finished");
            // The record is persisted by the engine before it returns;
            // only then does the bead leave the run table.
            if let Some(scheduler) = weak.upgrade() {
                scheduler.lock_table().remove(&bead_id);
            }
        });
    }

    fn workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.params
            .state
            .workflow(workflow_id)
            .ok_or_else(|| SchedulerError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Cancel a workflow. Idempotent: terminal workflows are left alone.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow = self.workflow(workflow_id)?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let handle_cancel = {
            let table = self.lock_table();
            table
                .get(&workflow.bead_id)
                .filter(|h| h.workflow_id.0 == workflow_id)
                .map(|h| h.cancel.clone())
        };
        if let Some(cancel) = handle_cancel {
            cancel.cancel();
        }

        // A live running engine observes the token and finishes its own
        // record. Parked workflows (blocked / pending merge) have no
        // engine task, so their record is finalised here.
        if workflow.status == WorkflowStatus::Running {
            return Ok(());
        }

        let mut workflow = workflow;
        workflow.status = WorkflowStatus::Cancelled;
        workflow.ended_at = Some(chrono::Utc::now());
        self.persist_workflow(&workflow);
        let _ = self.params.processes.stop(&workflow.bead_id).await;
        self.params.state.broker().publish(
            EventName::WorkflowCancelled,
            EventPayload::WorkflowEnded(coven_core::events::WorkflowEndedPayload {
                workflow_id: workflow.id.clone(),
                bead_id: workflow.bead_id.clone(),
                status: workflow.status.as_str().to_string(),
                error: workflow.error.clone(),
            }),
        );
        Ok(())
    }

    /// Cancel whatever workflow is live for a bead. Returns the id of
    /// the workflow that was asked to stop.
    pub async fn stop_bead(&self, bead_id: &str) -> Result<Id> {
        let workflow = self
            .params
            .state
            .live_workflow_for_bead(bead_id)
            .ok_or_else(|| SchedulerError::BeadNotFound(bead_id.to_string()))?;
        self.cancel_workflow(&workflow.id.0).await?;
        Ok(workflow.id)
    }

    /// Re-enter a blocked workflow at its first unfinished step.
    pub fn retry_workflow(self: &Arc<Self>, workflow_id: &str) -> Result<()> {
        let mut workflow = self.workflow(workflow_id)?;
        if workflow.status != WorkflowStatus::Blocked {
            return Err(SchedulerError::WrongStatus {
                expected: WorkflowStatus::Blocked.as_str().to_string(),
                actual: workflow.status.as_str().to_string(),
            });
        }
        // A rejected merge re-gates on the next attempt.
        if let Some(review) = workflow.merge_review.as_mut() {
            review.approved = None;
        }
        self.relaunch(workflow)?;
        Ok(())
    }

    /// Approve a pending merge: the engine resumes at the merge step and
    /// performs it.
    pub fn approve_merge(self: &Arc<Self>, workflow_id: &str) -> Result<()> {
        let mut workflow = self.workflow(workflow_id)?;
        if workflow.status != WorkflowStatus::PendingMerge {
            return Err(SchedulerError::WrongStatus {
                expected: WorkflowStatus::PendingMerge.as_str().to_string(),
                actual: workflow.status.as_str().to_string(),
            });
        }
        if let Some(review) = workflow.merge_review.as_mut() {
            review.approved = Some(true);
        }
        self.persist_workflow(&workflow);
        self.relaunch(workflow)?;
        Ok(())
    }

    /// Reject a pending merge: the workflow blocks with the reason.
    pub fn reject_merge(&self, workflow_id: &str, reason: Option<String>) -> Result<()> {
        let mut workflow = self.workflow(workflow_id)?;
        if workflow.status != WorkflowStatus::PendingMerge {
            return Err(SchedulerError::WrongStatus {
                expected: WorkflowStatus::PendingMerge.as_str().to_string(),
                actual: workflow.status.as_str().to_string(),
            });
        }

        let reason = reason.unwrap_or_else(|| "merge rejected".to_string());
        workflow.status = WorkflowStatus::Blocked;
        workflow.error = Some(reason.clone());
        if let Some(review) = workflow.merge_review.as_mut() {
            review.approved = Some(false);
            review.reason = Some(reason.clone());
        }
        self.persist_workflow(&workflow);

        if let Err(e) = self
            .params
            .beads
            .update_status(&workflow.bead_id, BeadStatus::Blocked)
        {
            warn!(bead = %workflow.bead_id, error = %e, "bead status update failed");
        }
        self.params
            .state
            .update_bead_status(&workflow.bead_id, BeadStatus::Blocked);

        self.params.state.broker().publish(
            EventName::WorkflowBlocked,
            EventPayload::WorkflowBlocked(WorkflowBlockedPayload {
                workflow_id: workflow.id.clone(),
                step: "merge".to_string(),
                error: reason,
            }),
        );
        Ok(())
    }

    /// Launch a workflow for a bead on explicit request.
    pub fn start_bead(self: &Arc<Self>, bead_id: &str) -> Result<Id> {
        let bead = self
            .params
            .state
            .bead(bead_id)
            .ok_or_else(|| SchedulerError::BeadNotFound(bead_id.to_string()))?;
        self.launch(bead)
    }

    fn persist_workflow(&self, workflow: &Workflow) {
        self.params.state.put_workflow(workflow.clone());
        let path = self.params.workflow_file(&workflow.id);
        if let Err(e) = write_json_atomic(&path, workflow) {
            error!(workflow = %workflow.id, error = %e, "workflow persist failed");
        }
    }
}
