//! Workflow render context.
//!
//! The context is a map keyed by step name, plus the reserved keys `bead`
//! (current task snapshot), `previous` (last step's result), and one key
//! per enclosing loop (`loopName -> {iteration}`). Values form a tagged
//! variant: struct views expose a fixed field whitelist, maps resolve by
//! key, arrays reject field access.

use crate::types::{Bead, StepRecord};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("step result already recorded: {0}")]
    DuplicateStep(String),
    #[error("unknown key in path {path}: {key}")]
    UnknownKey { path: String, key: String },
    #[error("field access on array at {0}")]
    FieldOnArray(String),
    #[error("field {field} not visible on {path}")]
    FieldNotVisible { path: String, field: String },
    #[error("cannot descend into scalar at {0}")]
    ScalarDescent(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// A value reachable from the workflow context.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(String),
    Map(BTreeMap<String, Value>),
    Array(Vec<Value>),
    /// Struct view over the current bead (whitelisted fields).
    BeadView(Bead),
    /// Struct view over a step result (whitelisted fields).
    StepView(StepRecord),
    /// Parsed JSON subtree, e.g. a step's structured outputs.
    Json(serde_json::Value),
}

impl Value {
    /// Render this value as a string for interpolation.
    ///
    /// Scalars render as-is; composites render as compact JSON.
    pub fn render(&self) -> String {
        match self {
            Self::Scalar(s) => s.clone(),
            Self::Json(v) => match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Map(map) => {
                let obj: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.render())))
                    .collect();
                serde_json::Value::Object(obj).to_string()
            }
            Self::Array(items) => {
                let arr: Vec<serde_json::Value> = items
                    .iter()
                    .map(|v| serde_json::Value::String(v.render()))
                    .collect();
                serde_json::Value::Array(arr).to_string()
            }
            Self::BeadView(bead) => serde_json::to_string(bead).unwrap_or_default(),
            Self::StepView(record) => serde_json::to_string(record).unwrap_or_default(),
        }
    }

    /// Items of an array value, if this is one.
    pub fn as_array(&self) -> Option<Vec<Value>> {
        match self {
            Self::Array(items) => Some(items.clone()),
            Self::Json(serde_json::Value::Array(items)) => {
                Some(items.iter().map(|v| Value::Json(v.clone())).collect())
            }
            _ => None,
        }
    }

    fn descend(&self, path: &str, field: &str) -> Result<Value> {
        match self {
            Self::Scalar(_) => Err(ContextError::ScalarDescent(path.to_string())),
            Self::Array(_) => Err(ContextError::FieldOnArray(path.to_string())),
            Self::Map(map) => map.get(field).cloned().ok_or_else(|| ContextError::UnknownKey {
                path: path.to_string(),
                key: field.to_string(),
            }),
            Self::Json(v) => match v {
                serde_json::Value::Array(_) => Err(ContextError::FieldOnArray(path.to_string())),
                serde_json::Value::Object(obj) => obj
                    .get(field)
                    .map(|v| Value::Json(v.clone()))
                    .ok_or_else(|| ContextError::UnknownKey {
                        path: path.to_string(),
                        key: field.to_string(),
                    }),
                _ => Err(ContextError::ScalarDescent(path.to_string())),
            },
            Self::BeadView(bead) => bead_field(bead, field).ok_or_else(|| {
                ContextError::FieldNotVisible {
                    path: path.to_string(),
                    field: field.to_string(),
                }
            }),
            Self::StepView(record) => step_field(record, field).ok_or_else(|| {
                ContextError::FieldNotVisible {
                    path: path.to_string(),
                    field: field.to_string(),
                }
            }),
        }
    }
}

/// Whitelisted bead fields.
fn bead_field(bead: &Bead, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::Scalar(bead.id.clone())),
        "title" => Some(Value::Scalar(bead.title.clone())),
        "body" => Some(Value::Scalar(bead.body.clone())),
        "type" => Some(Value::Scalar(bead.bead_type.clone())),
        "priority" => Some(Value::Scalar(bead.priority.to_string())),
        "status" => Some(Value::Scalar(bead.status.as_str().to_string())),
        "labels" => Some(Value::Array(
            bead.labels.iter().cloned().map(Value::Scalar).collect(),
        )),
        _ => None,
    }
}

/// Whitelisted step-result fields, plus the `failed` convenience boolean.
fn step_field(record: &StepRecord, field: &str) -> Option<Value> {
    match field {
        "name" => Some(Value::Scalar(record.name.clone())),
        "success" => Some(Value::Scalar(record.success.to_string())),
        "failed" => Some(Value::Scalar((!record.success).to_string())),
        "output" => Some(Value::Scalar(record.output.clone())),
        "outputs" => Some(Value::Json(
            record.outputs.clone().unwrap_or(serde_json::Value::Null),
        )),
        "exit_code" => Some(Value::Scalar(
            record.exit_code.map_or_else(String::new, |c| c.to_string()),
        )),
        "status" => Some(Value::Scalar(record.status.clone())),
        "duration_ms" => Some(Value::Scalar(record.duration_ms.to_string())),
        "action" => Some(Value::Scalar(record.action.as_str().to_string())),
        _ => None,
    }
}

/// The workflow context: step results plus reserved keys.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the reserved `bead` key.
    pub fn with_bead(bead: Bead) -> Self {
        let mut ctx = Self::new();
        ctx.values.insert("bead".to_string(), Value::BeadView(bead));
        ctx
    }

    /// Record a step result. Step results are append-only: recording the
    /// same name twice is a programmer error surfaced to the caller.
    pub fn insert_step(&mut self, name: &str, record: StepRecord) -> Result<()> {
        if self.values.contains_key(name) {
            return Err(ContextError::DuplicateStep(name.to_string()));
        }
        self.values
            .insert(name.to_string(), Value::StepView(record));
        Ok(())
    }

    /// Record a loop-nested step result, replacing the previous iteration's.
    pub fn upsert_step(&mut self, name: &str, record: StepRecord) {
        self.values
            .insert(name.to_string(), Value::StepView(record));
    }

    /// Update the reserved `previous` shortcut.
    pub fn set_previous(&mut self, record: StepRecord) {
        self.values
            .insert("previous".to_string(), Value::StepView(record));
    }

    /// Set a loop-owner key: `loopName -> {iteration}`.
    pub fn set_loop_iteration(&mut self, loop_name: &str, iteration: u32) {
        let mut map = BTreeMap::new();
        map.insert(
            "iteration".to_string(),
            Value::Scalar(iteration.to_string()),
        );
        self.values.insert(loop_name.to_string(), Value::Map(map));
    }

    /// Expose an extra scalar binding (spell inputs, include kwargs).
    pub fn set_scalar(&mut self, key: &str, value: impl Into<String>) {
        self.values
            .insert(key.to_string(), Value::Scalar(value.into()));
    }

    /// Expose a nested context under a key (the `parent` include binding).
    pub fn set_nested(&mut self, key: &str, nested: &Context) {
        self.values
            .insert(key.to_string(), Value::Map(nested.values.clone()));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Resolve a dotted path against the context.
    pub fn get_path(&self, path: &str) -> Result<Value> {
        let mut segments = path.split('.');
        let Some(root) = segments.next().filter(|s| !s.is_empty()) else {
            return Err(ContextError::UnknownKey {
                path: path.to_string(),
                key: path.to_string(),
            });
        };

        let mut current = self
            .values
            .get(root)
            .cloned()
            .ok_or_else(|| ContextError::UnknownKey {
                path: path.to_string(),
                key: root.to_string(),
            })?;
        let mut walked = root.to_string();

        for segment in segments {
            current = current.descend(&walked, segment)?;
            walked.push('.');
            walked.push_str(segment);
        }

        Ok(current)
    }
}
