//! coven-core - shared types and parsing for the coven daemon.
//!
//! Pure data: bead/workflow/agent types, grimoire YAML definitions,
//! spell templates and the render context, the agent output contract,
//! daemon configuration, and broker event payloads. No IO beyond
//! reading config files.

pub mod agent_stream;
pub mod config;
pub mod context;
pub mod events;
pub mod grimoire;
pub mod spell;
pub mod template;
pub mod types;

pub use config::{Config, ConfigError};
pub use context::{Context, ContextError, Value};
pub use events::{Envelope, EventName, EventPayload};
pub use grimoire::{
    effective_max_iterations, Grimoire, GrimoireError, OnFail, OnMaxIterations, OnSuccess, Step,
    StepKind, DEFAULT_MAX_ITERATIONS,
};
pub use spell::{Spell, SpellSource};
pub use template::{RenderMode, Renderer, SpellLookup, TemplateError};
pub use types::{
    AgentRecord, AgentStatus, Bead, BeadStatus, ErrorCode, Id, MergeReview, OutputLine,
    OutputStream, Question, QuestionType, StepAction, StepRecord, Workflow, WorkflowStatus,
};
