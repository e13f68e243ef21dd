//! Core types for the coven daemon.
//!
//! Beads are the external unit of work; a workflow is one execution of a
//! grimoire against one bead. Agents are subprocesses owned by a single
//! agent step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for workflows, questions, and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Beads (external tasks) ---

/// Bead lifecycle status, owned by the external bead source.
///
/// The daemon only reads beads and writes status transitions back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    PendingMerge,
}

impl BeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
            Self::PendingMerge => "pending_merge",
        }
    }
}

/// A unit of work supplied by the external bead source.
///
/// Immutable from the daemon's point of view except for `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Free-form type tag (e.g., "feature", "bug", "chore").
    #[serde(default)]
    pub bead_type: String,
    #[serde(default)]
    pub priority: i32,
    /// Ordered label sequence; `grimoire:<name>` labels select a workflow.
    #[serde(default)]
    pub labels: Vec<String>,
    pub status: BeadStatus,
}

impl Bead {
    /// Extract the grimoire name from a `grimoire:<name>` label, if any.
    pub fn grimoire_label(&self) -> Option<&str> {
        self.labels
            .iter()
            .find_map(|l| l.strip_prefix("grimoire:"))
            .filter(|name| !name.is_empty())
    }
}

// --- Workflows ---

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Blocked,
    PendingMerge,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::PendingMerge => "pending_merge",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal workflows never run again; their records are retained for
    /// inspection only.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The post-condition of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    #[default]
    Continue,
    ExitLoop,
    Block,
    Fail,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::ExitLoop => "exit_loop",
            Self::Block => "block",
            Self::Fail => "fail",
        }
    }
}

/// Result of one executed (or skipped) step, recorded in order.
///
/// Records are append-only within a workflow: once stored under a step
/// name they are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    /// Raw captured output (stdout+stderr for scripts, result text for agents).
    #[serde(default)]
    pub output: String,
    /// Parsed structured outputs when the step produced JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Human-readable status ("ok", "skipped", "timeout", ...).
    pub status: String,
    pub duration_ms: u64,
    pub action: StepAction,
}

impl StepRecord {
    /// Synthetic record for a step whose `when` condition evaluated false.
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            output: String::new(),
            outputs: None,
            exit_code: None,
            status: "skipped".to_string(),
            duration_ms: 0,
            action: StepAction::Continue,
        }
    }
}

/// Merge gate state for a workflow that reached a merge step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeReview {
    pub target_branch: String,
    /// Commit created from the worktree's uncommitted changes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Conflicting paths reported by a failed merge attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

/// One execution of a grimoire against one bead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub bead_id: String,
    pub grimoire_name: String,
    pub worktree_path: String,
    pub status: WorkflowStatus,
    /// Index of the next step to execute in the flattened top-level sequence.
    pub current_step: usize,
    /// Ordered results; always a prefix of the grimoire's step sequence.
    pub completed_steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_review: Option<MergeReview>,
}

// --- Agents ---

/// Agent subprocess lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

/// Metadata for one agent subprocess. At most one exists per bead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub bead_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub worktree: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
}

/// Which stream an output line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of captured agent output.
///
/// `sequence` is strictly monotonic per process, starts at 0, and is never
/// reused even after the ring buffer evicts the line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub data: String,
}

// --- Questions ---

/// Kind of question an agent can ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Choice,
    #[default]
    Free,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Choice => "choice",
            Self::Free => "free",
        }
    }
}

/// A question raised by an agent mid-step, answered over the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Id,
    pub bead_id: String,
    pub agent_id: String,
    pub text: String,
    pub question_type: QuestionType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub asked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl Question {
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

// --- Error codes ---

/// Stable machine-readable identifiers used in API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    AlreadyRunning,
    AlreadyAnswered,
    Validation,
    TemplateParse,
    TemplateRender,
    ConditionNonBoolean,
    SpellNotFound,
    GrimoireNotFound,
    Timeout,
    SubprocessSpawn,
    MergeConflict,
    Persistence,
    Io,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::AlreadyRunning => "already_running",
            Self::AlreadyAnswered => "already_answered",
            Self::Validation => "validation",
            Self::TemplateParse => "template_parse",
            Self::TemplateRender => "template_render",
            Self::ConditionNonBoolean => "condition_non_boolean",
            Self::SpellNotFound => "spell_not_found",
            Self::GrimoireNotFound => "grimoire_not_found",
            Self::Timeout => "timeout",
            Self::SubprocessSpawn => "subprocess_spawn",
            Self::MergeConflict => "merge_conflict",
            Self::Persistence => "persistence",
            Self::Io => "io",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn bead_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&BeadStatus::PendingMerge).unwrap(),
            "\"pending_merge\""
        );
        assert_eq!(
            serde_json::to_string(&BeadStatus::Open).unwrap(),
            "\"open\""
        );
    }

    #[test]
    fn grimoire_label_extraction() {
        let bead = Bead {
            id: "cv-1".to_string(),
            title: "add parser".to_string(),
            body: String::new(),
            bead_type: "feature".to_string(),
            priority: 1,
            labels: vec!["backend".to_string(), "grimoire:test-fix".to_string()],
            status: BeadStatus::Open,
        };
        assert_eq!(bead.grimoire_label(), Some("test-fix"));
    }

    #[test]
    fn grimoire_label_absent_or_empty() {
        let mut bead = Bead {
            id: "cv-2".to_string(),
            title: "t".to_string(),
            body: String::new(),
            bead_type: String::new(),
            priority: 0,
            labels: vec!["misc".to_string()],
            status: BeadStatus::Open,
        };
        assert_eq!(bead.grimoire_label(), None);

        bead.labels.push("grimoire:".to_string());
        assert_eq!(bead.grimoire_label(), None);
    }

    #[test]
    fn workflow_status_terminality() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Blocked.is_terminal());
        assert!(!WorkflowStatus::PendingMerge.is_terminal());
    }

    #[test]
    fn step_action_default_is_continue() {
        assert_eq!(StepAction::default(), StepAction::Continue);
        assert_eq!(
            serde_json::to_string(&StepAction::ExitLoop).unwrap(),
            "\"exit_loop\""
        );
    }

    #[test]
    fn skipped_record_is_successful_continue() {
        let rec = StepRecord::skipped("deploy");
        assert!(rec.success);
        assert_eq!(rec.status, "skipped");
        assert_eq!(rec.action, StepAction::Continue);
        assert_eq!(rec.duration_ms, 0);
    }

    #[test]
    fn agent_status_terminality() {
        assert!(AgentStatus::Killed.is_terminal());
        assert!(!AgentStatus::Starting.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
    }

    #[test]
    fn question_answered_state() {
        let mut q = Question {
            id: Id::new(),
            bead_id: "cv-1".to_string(),
            agent_id: "cv-1".to_string(),
            text: "proceed?".to_string(),
            question_type: QuestionType::Free,
            options: Vec::new(),
            asked_at: Utc::now(),
            answered_at: None,
            answer: None,
        };
        assert!(!q.is_answered());
        q.answer = Some("y".to_string());
        assert!(q.is_answered());
    }

    #[test]
    fn error_code_stable_identifiers() {
        assert_eq!(ErrorCode::AlreadyAnswered.as_str(), "already_answered");
        assert_eq!(ErrorCode::ConditionNonBoolean.as_str(), "condition_non_boolean");
        assert_eq!(
            serde_json::to_string(&ErrorCode::MergeConflict).unwrap(),
            "\"merge_conflict\""
        );
    }

    #[test]
    fn workflow_serializes_round_trip() {
        let wf = Workflow {
            id: Id::from_string("wf-1"),
            bead_id: "cv-9".to_string(),
            grimoire_name: "implement-bead".to_string(),
            worktree_path: "/repo/.coven/worktrees/cv-9".to_string(),
            status: WorkflowStatus::Running,
            current_step: 1,
            completed_steps: vec![StepRecord::skipped("lint")],
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            merge_review: None,
        };
        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bead_id, "cv-9");
        assert_eq!(back.current_step, 1);
        assert_eq!(back.completed_steps.len(), 1);
        assert!(back.ended_at.is_none());
    }
}
