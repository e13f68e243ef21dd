//! Spell template rendering.
//!
//! Supports `{{ dotted.path }}` interpolation against the workflow
//! context, a fixed pipe-function set, and spell-to-spell includes with
//! keyword arguments:
//!
//! ```text
//! Fix the failures in {{ bead.title }}.
//! {{ run-tests.output | indent:"2" }}
//! {{ include "footer" tone=formal }}
//! ```
//!
//! Missing keys are render errors by default; lenient mode substitutes
//! the empty string instead.

use crate::context::{Context, ContextError, Value};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Regex for `{{ ... }}` tags. The inner expression is parsed separately.
#[allow(clippy::expect_used)]
static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("constant regex pattern is valid"));

/// Includes deeper than this indicate a runaway chain even without a
/// direct cycle.
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error: {0}")]
    Parse(String),
    #[error("missing key: {0}")]
    MissingKey(String),
    #[error("render error at {path}: {reason}")]
    Render { path: String, reason: String },
    #[error("unknown template function: {0}")]
    UnknownFunction(String),
    #[error("spell not found: {0}")]
    SpellNotFound(String),
    #[error("include cycle through {0}")]
    IncludeCycle(String),
    #[error("include depth exceeded at {0}")]
    IncludeDepth(String),
    #[error("condition rendered to {0:?}, expected \"true\" or \"false\"")]
    NonBooleanCondition(String),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Resolver for named spell bodies, implemented by the spell library.
pub trait SpellLookup {
    fn spell_body(&self, name: &str) -> Option<String>;
}

/// Empty lookup for templates that use no includes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSpells;

impl SpellLookup for NoSpells {
    fn spell_body(&self, _name: &str) -> Option<String> {
        None
    }
}

impl SpellLookup for std::collections::HashMap<String, String> {
    fn spell_body(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Missing-key handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// Missing keys are errors.
    #[default]
    Strict,
    /// Missing keys render as the empty string.
    Lenient,
}

/// One parsed pipe application: `name` or `name:"arg"`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PipeFn {
    name: String,
    arg: Option<String>,
}

/// One parsed `{{ ... }}` expression.
#[derive(Debug, Clone)]
enum Expr {
    Path { path: String, pipes: Vec<PipeFn> },
    Include { name: String, kwargs: Vec<(String, String)> },
}

/// Template renderer bound to a spell library and a mode.
pub struct Renderer<'a> {
    spells: &'a dyn SpellLookup,
    mode: RenderMode,
}

impl std::fmt::Debug for Renderer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").field("mode", &self.mode).finish()
    }
}

impl<'a> Renderer<'a> {
    pub fn new(spells: &'a dyn SpellLookup) -> Self {
        Self {
            spells,
            mode: RenderMode::Strict,
        }
    }

    pub fn with_mode(spells: &'a dyn SpellLookup, mode: RenderMode) -> Self {
        Self { spells, mode }
    }

    /// Render a template against the context.
    pub fn render(&self, template: &str, ctx: &Context) -> Result<String> {
        let mut stack = Vec::new();
        self.render_inner(template, ctx, &mut stack)
    }

    /// Render a `when` expression; the result must be exactly `"true"` or
    /// `"false"`.
    pub fn render_condition(&self, expr: &str, ctx: &Context) -> Result<bool> {
        let rendered = self.render(expr, ctx)?;
        match rendered.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(TemplateError::NonBooleanCondition(other.to_string())),
        }
    }

    fn render_inner(
        &self,
        template: &str,
        ctx: &Context,
        stack: &mut Vec<String>,
    ) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in TAG_PATTERN.captures_iter(template) {
            let whole = caps.get(0).ok_or_else(|| {
                TemplateError::Parse("empty template match".to_string())
            })?;
            out.push_str(&template[last..whole.start()]);
            last = whole.end();

            let expr = parse_expr(&caps[1])?;
            match expr {
                Expr::Path { path, pipes } => {
                    out.push_str(&self.eval_path(&path, &pipes, ctx)?);
                }
                Expr::Include { name, kwargs } => {
                    out.push_str(&self.eval_include(&name, &kwargs, ctx, stack)?);
                }
            }
        }

        out.push_str(&template[last..]);
        Ok(out)
    }

    fn eval_path(&self, path: &str, pipes: &[PipeFn], ctx: &Context) -> Result<String> {
        let default = pipes
            .iter()
            .find(|p| p.name == "default")
            .and_then(|p| p.arg.clone());

        let value = match ctx.get_path(path) {
            Ok(value) => value,
            Err(
                err @ (ContextError::UnknownKey { .. } | ContextError::FieldNotVisible { .. }),
            ) => {
                if let Some(fallback) = default {
                    return apply_pipes(Value::Scalar(fallback), pipes, path);
                }
                return match self.mode {
                    RenderMode::Lenient => Ok(String::new()),
                    RenderMode::Strict => Err(TemplateError::MissingKey(err.to_string())),
                };
            }
            Err(err) => {
                return Err(TemplateError::Render {
                    path: path.to_string(),
                    reason: err.to_string(),
                })
            }
        };

        apply_pipes(value, pipes, path)
    }

    fn eval_include(
        &self,
        name: &str,
        kwargs: &[(String, String)],
        ctx: &Context,
        stack: &mut Vec<String>,
    ) -> Result<String> {
        if stack.iter().any(|seen| seen == name) {
            return Err(TemplateError::IncludeCycle(name.to_string()));
        }
        if stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(TemplateError::IncludeDepth(name.to_string()));
        }

        let body = self
            .spells
            .spell_body(name)
            .ok_or_else(|| TemplateError::SpellNotFound(name.to_string()))?;

        let mut child = Context::new();
        for (key, value) in kwargs {
            child.set_scalar(key, value.clone());
        }
        child.set_nested("parent", ctx);

        stack.push(name.to_string());
        let rendered = self.render_inner(&body, &child, stack);
        stack.pop();
        rendered
    }
}

/// Parse the inside of a `{{ ... }}` tag.
fn parse_expr(raw: &str) -> Result<Expr> {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("include ") {
        return parse_include(rest);
    }

    let mut parts = split_pipes(trimmed);
    if parts.is_empty() {
        return Err(TemplateError::Parse(format!("empty expression: {raw:?}")));
    }
    let path = parts.remove(0).trim().to_string();
    if path.is_empty() || !is_valid_path(&path) {
        return Err(TemplateError::Parse(format!("invalid path: {path:?}")));
    }

    let mut pipes = Vec::new();
    for part in parts {
        pipes.push(parse_pipe(part.trim())?);
    }
    Ok(Expr::Path { path, pipes })
}

/// Split a pipeline on `|`, ignoring pipes inside quoted arguments.
fn split_pipes(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in expr.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '|' if !in_quotes => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts
}

fn is_valid_path(path: &str) -> bool {
    path.split('.').all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

fn parse_pipe(part: &str) -> Result<PipeFn> {
    let (name, arg) = match part.split_once(':') {
        Some((name, arg)) => (name.trim(), Some(unquote(arg.trim()).to_string())),
        None => (part, None),
    };
    if name.is_empty() {
        return Err(TemplateError::Parse(format!("empty function in {part:?}")));
    }
    Ok(PipeFn {
        name: name.to_string(),
        arg,
    })
}

fn parse_include(rest: &str) -> Result<Expr> {
    let rest = rest.trim();
    let Some(after_quote) = rest.strip_prefix('"') else {
        return Err(TemplateError::Parse(format!(
            "include name must be quoted: {rest:?}"
        )));
    };
    let Some(end) = after_quote.find('"') else {
        return Err(TemplateError::Parse(format!(
            "unterminated include name: {rest:?}"
        )));
    };
    let name = &after_quote[..end];
    if name.is_empty() {
        return Err(TemplateError::Parse("empty include name".to_string()));
    }

    let mut kwargs = Vec::new();
    for token in tokenize_kwargs(after_quote[end + 1..].trim())? {
        let Some((key, value)) = token.split_once('=') else {
            return Err(TemplateError::Parse(format!(
                "include argument must be key=value: {token:?}"
            )));
        };
        kwargs.push((key.trim().to_string(), unquote(value.trim()).to_string()));
    }

    Ok(Expr::Include {
        name: name.to_string(),
        kwargs,
    })
}

/// Split include kwargs on whitespace, keeping quoted values intact.
fn tokenize_kwargs(raw: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(TemplateError::Parse(format!(
            "unterminated quote in include arguments: {raw:?}"
        )));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Apply the pipe chain to a resolved value.
fn apply_pipes(value: Value, pipes: &[PipeFn], path: &str) -> Result<String> {
    let mut array = value.as_array();
    let mut text = value.render();

    for pipe in pipes {
        match pipe.name.as_str() {
            // Handled during path resolution; a present value passes through.
            "default" => {}
            "upper" => text = text.to_uppercase(),
            "lower" => text = text.to_lowercase(),
            "trim" => text = text.trim().to_string(),
            "quote" => text = serde_json::Value::String(text).to_string(),
            "indent" => {
                let prefix = match pipe.arg.as_deref() {
                    Some(arg) => match arg.parse::<usize>() {
                        Ok(n) => " ".repeat(n),
                        Err(_) => arg.to_string(),
                    },
                    None => "  ".to_string(),
                };
                text = text
                    .lines()
                    .map(|line| format!("{prefix}{line}"))
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            "join" => {
                let Some(items) = array.take() else {
                    return Err(TemplateError::Render {
                        path: path.to_string(),
                        reason: "join requires an array value".to_string(),
                    });
                };
                let sep = pipe.arg.clone().unwrap_or_else(|| ", ".to_string());
                text = items
                    .iter()
                    .map(Value::render)
                    .collect::<Vec<_>>()
                    .join(&sep);
            }
            other => return Err(TemplateError::UnknownFunction(other.to_string())),
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bead, BeadStatus, StepAction, StepRecord};
    use std::collections::HashMap;

    fn ctx() -> Context {
        let mut ctx = Context::with_bead(Bead {
            id: "cv-1".to_string(),
            title: "Fix the flaky test".to_string(),
            body: String::new(),
            bead_type: "bug".to_string(),
            priority: 1,
            labels: vec!["ci".to_string(), "tests".to_string()],
            status: BeadStatus::Open,
        });
        ctx.insert_step(
            "run-tests",
            StepRecord {
                name: "run-tests".to_string(),
                success: false,
                output: "2 failed\n10 passed".to_string(),
                outputs: Some(serde_json::json!({"failed": 2})),
                exit_code: Some(1),
                status: "ok".to_string(),
                duration_ms: 900,
                action: StepAction::Continue,
            },
        )
        .unwrap();
        ctx
    }

    #[test]
    fn interpolates_paths() {
        let renderer = Renderer::new(&NoSpells);
        let out = renderer
            .render("Working on {{ bead.title }} ({{ bead.id }})", &ctx())
            .unwrap();
        assert_eq!(out, "Working on Fix the flaky test (cv-1)");
    }

    #[test]
    fn missing_key_is_strict_error() {
        let renderer = Renderer::new(&NoSpells);
        let err = renderer.render("{{ nothing.here }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingKey(_)));
    }

    #[test]
    fn missing_key_renders_empty_in_lenient_mode() {
        let renderer = Renderer::with_mode(&NoSpells, RenderMode::Lenient);
        let out = renderer.render("[{{ nothing.here }}]", &ctx()).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn default_covers_missing_keys() {
        let renderer = Renderer::new(&NoSpells);
        let out = renderer
            .render("{{ missing | default:\"n/a\" }}", &ctx())
            .unwrap();
        assert_eq!(out, "n/a");

        // A present value wins over the default.
        let out = renderer
            .render("{{ bead.id | default:\"n/a\" }}", &ctx())
            .unwrap();
        assert_eq!(out, "cv-1");
    }

    #[test]
    fn string_functions() {
        let renderer = Renderer::new(&NoSpells);
        assert_eq!(
            renderer.render("{{ bead.type | upper }}", &ctx()).unwrap(),
            "BUG"
        );
        assert_eq!(
            renderer
                .render("{{ bead.title | lower | trim }}", &ctx())
                .unwrap(),
            "fix the flaky test"
        );
        assert_eq!(
            renderer.render("{{ bead.type | quote }}", &ctx()).unwrap(),
            "\"bug\""
        );
    }

    #[test]
    fn join_and_indent() {
        let renderer = Renderer::new(&NoSpells);
        assert_eq!(
            renderer
                .render("{{ bead.labels | join:\", \" }}", &ctx())
                .unwrap(),
            "ci, tests"
        );
        assert_eq!(
            renderer
                .render("{{ run-tests.output | indent:\"2\" }}", &ctx())
                .unwrap(),
            "  2 failed\n  10 passed"
        );
    }

    #[test]
    fn join_rejects_scalars() {
        let renderer = Renderer::new(&NoSpells);
        let err = renderer.render("{{ bead.id | join }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let renderer = Renderer::new(&NoSpells);
        let err = renderer
            .render("{{ bead.id | sparkle }}", &ctx())
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFunction(f) if f == "sparkle"));
    }

    #[test]
    fn includes_with_kwargs_and_parent() {
        let mut spells = HashMap::new();
        spells.insert(
            "footer".to_string(),
            "-- {{ tone }} regards for {{ parent.bead.id }}".to_string(),
        );
        let renderer = Renderer::new(&spells);
        let out = renderer
            .render("body\n{{ include \"footer\" tone=\"warm\" }}", &ctx())
            .unwrap();
        assert_eq!(out, "body\n-- warm regards for cv-1");
    }

    #[test]
    fn include_cycles_are_detected() {
        let mut spells = HashMap::new();
        spells.insert("a".to_string(), "{{ include \"b\" }}".to_string());
        spells.insert("b".to_string(), "{{ include \"a\" }}".to_string());
        let renderer = Renderer::new(&spells);
        let err = renderer.render("{{ include \"a\" }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::IncludeCycle(_)));
    }

    #[test]
    fn missing_spell_is_an_error() {
        let renderer = Renderer::new(&NoSpells);
        let err = renderer
            .render("{{ include \"ghost\" }}", &ctx())
            .unwrap_err();
        assert!(matches!(err, TemplateError::SpellNotFound(s) if s == "ghost"));
    }

    #[test]
    fn conditions_require_boolean_strings() {
        let renderer = Renderer::new(&NoSpells);
        let mut c = ctx();
        c.set_previous(StepRecord {
            name: "run-tests".to_string(),
            success: false,
            output: String::new(),
            outputs: None,
            exit_code: Some(1),
            status: "ok".to_string(),
            duration_ms: 1,
            action: StepAction::Continue,
        });

        assert!(renderer
            .render_condition("{{ previous.failed }}", &c)
            .unwrap());
        assert!(!renderer
            .render_condition("{{ previous.success }}", &c)
            .unwrap());

        let err = renderer
            .render_condition("{{ bead.type }}", &c)
            .unwrap_err();
        assert!(matches!(err, TemplateError::NonBooleanCondition(v) if v == "bug"));
    }

    #[test]
    fn condition_literals() {
        let renderer = Renderer::new(&NoSpells);
        assert!(renderer.render_condition("true", &ctx()).unwrap());
        assert!(!renderer.render_condition("false", &ctx()).unwrap());
        let err = renderer.render_condition("maybe", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::NonBooleanCondition(_)));
    }

    #[test]
    fn invalid_path_is_a_parse_error() {
        let renderer = Renderer::new(&NoSpells);
        let err = renderer.render("{{ two words }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Parse(_)));
    }

    #[test]
    fn text_without_tags_passes_through() {
        let renderer = Renderer::new(&NoSpells);
        let out = renderer.render("plain text, no tags", &ctx()).unwrap();
        assert_eq!(out, "plain text, no tags");
    }
}
