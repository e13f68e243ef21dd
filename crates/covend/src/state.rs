//! In-memory daemon state and its persistence.
//!
//! The store is the single source of truth the broker publishes. Readers
//! take a read lock and receive deep copies; writers take the write lock
//! and emit a logical change event. Every mutation schedules a debounced
//! write of the full snapshot to `state.json` (write to `.tmp`, fsync,
//! rename).

use crate::broker::Broker;
use chrono::{DateTime, Utc};
use coven_core::events::{
    AgentsChangedPayload, QuestionsChangedPayload, TasksUpdatedPayload, WorkflowSummary,
};
use coven_core::{
    AgentRecord, Bead, BeadStatus, EventName, EventPayload, Question, Workflow, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("question not found: {0}")]
    QuestionNotFound(String),
    #[error("question already answered: {0}")]
    AlreadyAnswered(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Session lifecycle info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub started_at: DateTime<Utc>,
    /// Whether the scheduler is accepting new work.
    pub running: bool,
    pub version: String,
    pub workspace: String,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            running: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
            workspace: String::new(),
        }
    }
}

/// Counters derived from the state at snapshot time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Counters {
    pub ready_beads: usize,
    pub running_agents: usize,
    pub active_workflows: usize,
    pub open_questions: usize,
}

/// The full serialisable daemon state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonState {
    #[serde(default)]
    pub session: SessionInfo,
    /// Agents keyed by bead id; at most one per bead.
    #[serde(default)]
    pub agents: HashMap<String, AgentRecord>,
    /// Beads in the order the source returned them.
    #[serde(default)]
    pub beads: Vec<Bead>,
    /// Workflows keyed by workflow id.
    #[serde(default)]
    pub workflows: HashMap<String, Workflow>,
    /// Questions keyed by question id, ordered for stable listings.
    #[serde(default)]
    pub questions: BTreeMap<String, Question>,
}

impl DaemonState {
    pub fn counters(&self) -> Counters {
        Counters {
            ready_beads: self
                .beads
                .iter()
                .filter(|b| b.status == BeadStatus::Open)
                .count(),
            running_agents: self
                .agents
                .values()
                .filter(|a| !a.status.is_terminal())
                .count(),
            active_workflows: self
                .workflows
                .values()
                .filter(|w| !w.status.is_terminal())
                .count(),
            open_questions: self
                .questions
                .values()
                .filter(|q| !q.is_answered())
                .count(),
        }
    }
}

/// Thread-safe state store bound to a broker and a persistence path.
pub struct StateStore {
    inner: RwLock<DaemonState>,
    broker: Arc<Broker>,
    path: PathBuf,
    persist_tx: mpsc::Sender<()>,
    persist_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .finish()
    }
}

impl StateStore {
    /// Load persisted state if present, or start fresh. A malformed file
    /// is an error: silently discarding state would orphan workflows.
    pub fn load_or_default(path: PathBuf, broker: Arc<Broker>) -> Result<Self> {
        let state = if path.exists() {
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            serde_json::from_reader(reader)?
        } else {
            DaemonState::default()
        };

        let (persist_tx, persist_rx) = mpsc::channel(1);
        Ok(Self {
            inner: RwLock::new(state),
            broker,
            path,
            persist_tx,
            persist_rx: std::sync::Mutex::new(Some(persist_rx)),
        })
    }

    /// Spawn the debounced persistence task. Writes are coalesced within
    /// the debounce window; cancellation triggers a final flush.
    pub fn spawn_persister(
        self: &Arc<Self>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let mut rx = store
            .persist_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| {
                // Already spawned once; a second persister gets a dead channel.
                let (_tx, rx) = mpsc::channel(1);
                rx
            });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notified = rx.recv() => {
                        if notified.is_none() {
                            break;
                        }
                        tokio::time::sleep(debounce).await;
                        // Coalesce any notifications that arrived meanwhile.
                        while rx.try_recv().is_ok() {}
                        if let Err(e) = store.persist_now() {
                            error!(error = %e, "state persist failed");
                        }
                    }
                    () = cancel.cancelled() => {
                        if let Err(e) = store.persist_now() {
                            error!(error = %e, "final state persist failed");
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Write the snapshot atomically, right now.
    pub fn persist_now(&self) -> Result<()> {
        let snapshot = self.snapshot();
        write_json_atomic(&self.path, &snapshot)?;
        Ok(())
    }

    fn schedule_persist(&self) {
        let _ = self.persist_tx.try_send(());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, DaemonState> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DaemonState> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- Readers (deep copies) ---

    pub fn snapshot(&self) -> DaemonState {
        self.read().clone()
    }

    /// Snapshot as the JSON value broadcast in `state.snapshot` events.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let state = self.read();
        let workflows: Vec<WorkflowSummary> =
            state.workflows.values().map(WorkflowSummary::from).collect();
        serde_json::json!({
            "session": state.session,
            "beads": state.beads,
            "agents": state.agents,
            "workflows": workflows,
            "questions": state.questions.values().collect::<Vec<_>>(),
            "counters": state.counters(),
        })
    }

    pub fn session(&self) -> SessionInfo {
        self.read().session.clone()
    }

    pub fn beads(&self) -> Vec<Bead> {
        self.read().beads.clone()
    }

    pub fn bead(&self, id: &str) -> Option<Bead> {
        self.read().beads.iter().find(|b| b.id == id).cloned()
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        agents
    }

    pub fn agent(&self, bead_id: &str) -> Option<AgentRecord> {
        self.read().agents.get(bead_id).cloned()
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.read().workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        workflows
    }

    pub fn workflow(&self, id: &str) -> Option<Workflow> {
        self.read().workflows.get(id).cloned()
    }

    /// The non-terminal workflow for a bead, if one exists.
    pub fn live_workflow_for_bead(&self, bead_id: &str) -> Option<Workflow> {
        self.read()
            .workflows
            .values()
            .find(|w| w.bead_id == bead_id && !w.status.is_terminal())
            .cloned()
    }

    pub fn questions(&self) -> Vec<Question> {
        self.read().questions.values().cloned().collect()
    }

    pub fn question(&self, id: &str) -> Option<Question> {
        self.read().questions.get(id).cloned()
    }

    pub fn counters(&self) -> Counters {
        self.read().counters()
    }

    // --- Writers (emit change events, schedule persist) ---

    pub fn set_session_running(&self, running: bool, workspace: &str) {
        {
            let mut state = self.write();
            state.session.running = running;
            state.session.workspace = workspace.to_string();
        }
        self.schedule_persist();
    }

    /// Replace the bead list with a fresh poll result.
    pub fn set_beads(&self, beads: Vec<Bead>) {
        let changed = {
            let mut state = self.write();
            let changed = !beads_equal(&state.beads, &beads);
            state.beads = beads;
            changed
        };
        if changed {
            let beads = self.beads();
            self.broker.publish(
                EventName::TasksUpdated,
                EventPayload::TasksUpdated(TasksUpdatedPayload { beads }),
            );
            self.schedule_persist();
        }
    }

    pub fn update_bead_status(&self, bead_id: &str, status: BeadStatus) {
        let changed = {
            let mut state = self.write();
            let mut changed = false;
            if let Some(bead) = state.beads.iter_mut().find(|b| b.id == bead_id) {
                if bead.status != status {
                    bead.status = status;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            let beads = self.beads();
            self.broker.publish(
                EventName::TasksUpdated,
                EventPayload::TasksUpdated(TasksUpdatedPayload { beads }),
            );
            self.schedule_persist();
        }
    }

    pub fn put_agent(&self, record: AgentRecord) {
        let running = {
            let mut state = self.write();
            state.agents.insert(record.bead_id.clone(), record);
            state.counters().running_agents
        };
        self.broker.publish(
            EventName::AgentsChanged,
            EventPayload::AgentsChanged(AgentsChangedPayload { running }),
        );
        self.schedule_persist();
    }

    pub fn remove_agent(&self, bead_id: &str) {
        let running = {
            let mut state = self.write();
            state.agents.remove(bead_id);
            state.counters().running_agents
        };
        self.broker.publish(
            EventName::AgentsChanged,
            EventPayload::AgentsChanged(AgentsChangedPayload { running }),
        );
        self.schedule_persist();
    }

    pub fn put_workflow(&self, workflow: Workflow) {
        {
            let mut state = self.write();
            state.workflows.insert(workflow.id.0.clone(), workflow);
        }
        self.schedule_persist();
    }

    pub fn put_question(&self, question: Question) {
        let open = {
            let mut state = self.write();
            state.questions.insert(question.id.0.clone(), question);
            state.counters().open_questions
        };
        self.broker.publish(
            EventName::QuestionsChanged,
            EventPayload::QuestionsChanged(QuestionsChangedPayload { open }),
        );
        self.schedule_persist();
    }

    /// Record an answer. Answering twice is a lifecycle conflict.
    pub fn answer_question(&self, id: &str, answer: &str) -> Result<Question> {
        let (question, open) = {
            let mut state = self.write();
            let question = state
                .questions
                .get_mut(id)
                .ok_or_else(|| StateError::QuestionNotFound(id.to_string()))?;
            if question.is_answered() {
                return Err(StateError::AlreadyAnswered(id.to_string()));
            }
            question.answer = Some(answer.to_string());
            question.answered_at = Some(Utc::now());
            let question = question.clone();
            (question, state.counters().open_questions)
        };
        self.broker.publish(
            EventName::QuestionsChanged,
            EventPayload::QuestionsChanged(QuestionsChangedPayload { open }),
        );
        self.schedule_persist();
        Ok(question)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

fn beads_equal(a: &[Bead], b: &[Bead]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.id == y.id && x.status == y.status && x.title == y.title)
}

/// Write a JSON value to `path` atomically: `.tmp`, fsync, rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
