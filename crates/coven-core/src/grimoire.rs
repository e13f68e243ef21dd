//! Grimoire definitions: declarative YAML workflows.
//!
//! A grimoire is an ordered sequence of steps of kind `agent`, `script`,
//! `loop`, or `merge`. Definitions are immutable once loaded; user files
//! override built-ins of the same name.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrimoireError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid grimoire {name}: {reason}")]
    Validation { name: String, reason: String },
    #[error("invalid duration: {0}")]
    BadDuration(String),
}

pub type Result<T> = std::result::Result<T, GrimoireError>;

/// Safety ceiling applied when a loop declares `max_iterations: 0`.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Parse a duration string like `2h`, `90m`, `45s`, `500ms`, or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(GrimoireError::BadDuration(input.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(GrimoireError::BadDuration(input.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| GrimoireError::BadDuration(input.to_string()))?;
        digits.clear();

        let unit = match c {
            'h' => Duration::from_secs(value * 3600),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    Duration::from_millis(value)
                } else {
                    Duration::from_secs(value * 60)
                }
            }
            's' => Duration::from_secs(value),
            _ => return Err(GrimoireError::BadDuration(input.to_string())),
        };
        total += unit;
    }

    // A bare number (no unit) is seconds.
    if !digits.is_empty() {
        let value: u64 = digits
            .parse()
            .map_err(|_| GrimoireError::BadDuration(input.to_string()))?;
        total += Duration::from_secs(value);
    }

    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Policy for a failing script step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// Block the workflow for manual intervention.
    #[default]
    Block,
    /// Record the failure and keep going.
    Continue,
}

/// Policy for a successful script step inside a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    #[default]
    #[serde(rename = "")]
    None,
    ExitLoop,
}

/// Policy when a loop exhausts its iteration ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    /// Fail the workflow.
    #[default]
    Fail,
    /// Block the workflow for manual intervention.
    Block,
    /// Leave the loop and continue, marking it successful.
    Exit,
    /// Same as `exit`.
    Continue,
}

/// Kind-specific step fields, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Agent {
        /// Spell name, or an inline template body.
        spell: String,
        /// Template values exposed to the spell alongside the context.
        #[serde(default)]
        input: BTreeMap<String, String>,
    },
    Script {
        command: String,
        #[serde(default)]
        on_fail: OnFail,
        #[serde(default)]
        on_success: OnSuccess,
    },
    Loop {
        /// 0 means the safety default of [`DEFAULT_MAX_ITERATIONS`].
        #[serde(default)]
        max_iterations: u32,
        #[serde(default)]
        on_max_iterations: OnMaxIterations,
        steps: Vec<Step>,
    },
    Merge {
        #[serde(default = "default_require_review")]
        require_review: bool,
        // Accepted for forward compatibility; the merge executor ignores
        // these until implemented.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_rebase: Option<bool>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pre_merge: Vec<String>,
    },
}

fn default_require_review() -> bool {
    true
}

impl StepKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Script { .. } => "script",
            Self::Loop { .. } => "loop",
            Self::Merge { .. } => "merge",
        }
    }
}

/// One element of a grimoire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the parent sequence; keys the step's result in context.
    pub name: String,
    #[serde(
        default,
        deserialize_with = "de_duration",
        skip_serializing_if = "Option::is_none"
    )]
    #[serde(serialize_with = "ser_duration")]
    pub timeout: Option<Duration>,
    /// Condition template; must render to `"true"` or `"false"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Alias under which the step's result is also stored in context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

fn ser_duration<S>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(d) => serializer.serialize_some(&format!("{}s", d.as_secs())),
        None => serializer.serialize_none(),
    }
}

/// A named, declarative workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grimoire {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Workflow-level timeout; steps without their own inherit it.
    #[serde(
        default,
        deserialize_with = "de_duration",
        skip_serializing_if = "Option::is_none"
    )]
    #[serde(serialize_with = "ser_duration")]
    pub timeout: Option<Duration>,
    pub steps: Vec<Step>,
}

impl Grimoire {
    /// Parse and validate a grimoire from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let grimoire: Self = serde_yaml::from_str(yaml)?;
        grimoire.validate()?;
        Ok(grimoire)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GrimoireError::Validation {
                name: self.name.clone(),
                reason: "grimoire name must not be empty".to_string(),
            });
        }
        if self.steps.is_empty() {
            return Err(GrimoireError::Validation {
                name: self.name.clone(),
                reason: "grimoire must contain at least one step".to_string(),
            });
        }
        Self::validate_sequence(&self.name, &self.steps)
    }

    fn validate_sequence(grimoire: &str, steps: &[Step]) -> Result<()> {
        let mut seen = HashSet::new();
        for step in steps {
            if step.name.trim().is_empty() {
                return Err(GrimoireError::Validation {
                    name: grimoire.to_string(),
                    reason: "step name must not be empty".to_string(),
                });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(GrimoireError::Validation {
                    name: grimoire.to_string(),
                    reason: format!("duplicate step name: {}", step.name),
                });
            }
            match &step.kind {
                StepKind::Script { command, .. } => {
                    if command.trim().is_empty() {
                        return Err(GrimoireError::Validation {
                            name: grimoire.to_string(),
                            reason: format!("step {} has an empty command", step.name),
                        });
                    }
                }
                StepKind::Agent { spell, .. } => {
                    if spell.trim().is_empty() {
                        return Err(GrimoireError::Validation {
                            name: grimoire.to_string(),
                            reason: format!("step {} has an empty spell", step.name),
                        });
                    }
                }
                StepKind::Loop { steps: nested, .. } => {
                    if nested.is_empty() {
                        return Err(GrimoireError::Validation {
                            name: grimoire.to_string(),
                            reason: format!("loop {} has no nested steps", step.name),
                        });
                    }
                    Self::validate_sequence(grimoire, nested)?;
                }
                StepKind::Merge { .. } => {}
            }
        }
        Ok(())
    }
}

/// Effective iteration ceiling for a loop step.
pub fn effective_max_iterations(declared: u32) -> u32 {
    if declared == 0 {
        DEFAULT_MAX_ITERATIONS
    } else {
        declared
    }
}
