//! Event names and payloads broadcast by the daemon's broker.
//!
//! Every event is published to all subscribers and framed on the SSE
//! stream as `event: <name>\ndata: <json>\n\n`.

use crate::types::{AgentRecord, Bead, Id, OutputLine, Question, StepRecord, Workflow};
use serde::{Deserialize, Serialize};

/// Broadcast event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "state.snapshot")]
    StateSnapshot,
    #[serde(rename = "tasks.updated")]
    TasksUpdated,
    #[serde(rename = "agents.changed")]
    AgentsChanged,
    #[serde(rename = "questions.changed")]
    QuestionsChanged,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.step_started")]
    WorkflowStepStarted,
    #[serde(rename = "workflow.step_completed")]
    WorkflowStepCompleted,
    #[serde(rename = "workflow.blocked")]
    WorkflowBlocked,
    #[serde(rename = "workflow.pending_merge")]
    WorkflowPendingMerge,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "agent.question")]
    AgentQuestion,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateSnapshot => "state.snapshot",
            Self::TasksUpdated => "tasks.updated",
            Self::AgentsChanged => "agents.changed",
            Self::QuestionsChanged => "questions.changed",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowStepStarted => "workflow.step_started",
            Self::WorkflowStepCompleted => "workflow.step_completed",
            Self::WorkflowBlocked => "workflow.blocked",
            Self::WorkflowPendingMerge => "workflow.pending_merge",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::AgentStarted => "agent.started",
            Self::AgentOutput => "agent.output",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::AgentQuestion => "agent.question",
        }
    }
}

/// Payload for `workflow.started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub workflow_id: Id,
    pub bead_id: String,
    pub grimoire: String,
    pub worktree: String,
}

/// Payload for `workflow.step_started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub workflow_id: Id,
    pub step: String,
    pub step_index: usize,
}

/// Payload for `workflow.step_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub workflow_id: Id,
    pub step: String,
    pub step_index: usize,
    pub record: StepRecord,
}

/// Payload for `workflow.blocked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBlockedPayload {
    pub workflow_id: Id,
    pub step: String,
    pub error: String,
}

/// Payload for `workflow.pending_merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPendingMergePayload {
    pub workflow_id: Id,
    pub target_branch: String,
}

/// Payload for `workflow.completed` and `workflow.cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEndedPayload {
    pub workflow_id: Id,
    pub bead_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `agent.started`, `agent.completed`, and `agent.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLifecyclePayload {
    pub bead_id: String,
    pub agent: AgentRecord,
}

/// Payload for `agent.output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub bead_id: String,
    pub line: OutputLine,
}

/// Payload for `agent.question`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQuestionPayload {
    pub bead_id: String,
    pub question: Question,
}

/// Payload for `tasks.updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksUpdatedPayload {
    pub beads: Vec<Bead>,
}

/// Payload for `questions.changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionsChangedPayload {
    pub open: usize,
}

/// Payload for `agents.changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsChangedPayload {
    pub running: usize,
}

/// Point-in-time summary of a workflow for snapshot payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Id,
    pub bead_id: String,
    pub grimoire: String,
    pub status: String,
    pub current_step: usize,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(wf: &Workflow) -> Self {
        Self {
            id: wf.id.clone(),
            bead_id: wf.bead_id.clone(),
            grimoire: wf.grimoire_name.clone(),
            status: wf.status.as_str().to_string(),
            current_step: wf.current_step,
        }
    }
}

/// Union type over all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Snapshot(serde_json::Value),
    TasksUpdated(TasksUpdatedPayload),
    AgentsChanged(AgentsChangedPayload),
    QuestionsChanged(QuestionsChangedPayload),
    WorkflowStarted(WorkflowStartedPayload),
    StepStarted(StepStartedPayload),
    StepCompleted(StepCompletedPayload),
    WorkflowBlocked(WorkflowBlockedPayload),
    WorkflowPendingMerge(WorkflowPendingMergePayload),
    WorkflowEnded(WorkflowEndedPayload),
    AgentLifecycle(AgentLifecyclePayload),
    AgentOutput(AgentOutputPayload),
    AgentQuestion(AgentQuestionPayload),
}

impl EventPayload {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A named event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub name: EventName,
    pub payload: EventPayload,
}

impl Envelope {
    pub fn new(name: EventName, payload: EventPayload) -> Self {
        Self { name, payload }
    }
}
