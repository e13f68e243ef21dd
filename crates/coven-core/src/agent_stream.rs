//! Parsing of the agent subprocess output contract.
//!
//! Agents emit one JSON object per stdout line. Recognised shapes are
//! mapped to [`AgentEvent`]s; unknown types and lines that fail to parse
//! surface as raw text so nothing is silently dropped. The final message
//! of a successful step is a result block of the shape
//! `{"success": bool, "summary": str, "outputs": {...}, "error": str?}`.

use crate::types::QuestionType;
use serde::Deserialize;
use serde_json::Value;

/// One parsed line of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Displayable assistant text.
    Text(String),
    /// The terminal result payload (`{type:"result", result}`).
    Result(String),
    /// System bookkeeping (`{type:"system", subtype}`); carried for logs.
    System { subtype: String },
    /// A discrete question event.
    Question {
        text: String,
        question_type: QuestionType,
        options: Vec<String>,
    },
    /// A line that was not valid JSON or had an unknown type.
    Raw(String),
}

/// Parse one stdout line into an event.
pub fn parse_line(line: &str) -> AgentEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return AgentEvent::Raw(String::new());
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return AgentEvent::Raw(line.to_string());
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return AgentEvent::Raw(line.to_string());
    };

    match kind {
        "assistant" => {
            let text = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            AgentEvent::Text(text)
        }
        "text" => AgentEvent::Text(
            value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "result" => AgentEvent::Result(
            value
                .get("result")
                .map(|r| match r {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
        ),
        "system" => AgentEvent::System {
            subtype: value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        },
        "question" => {
            let text = value
                .get("text")
                .or_else(|| value.get("question"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let options: Vec<String> = value
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            let question_type = if options.is_empty() {
                QuestionType::Free
            } else {
                QuestionType::Choice
            };
            AgentEvent::Question {
                text,
                question_type,
                options,
            }
        }
        _ => AgentEvent::Raw(line.to_string()),
    }
}

/// Detect a plain-text question in agent output.
///
/// Agents that don't emit discrete question events can ask with a
/// `QUESTION:` prefix on its own line.
pub fn match_question_text(line: &str) -> Option<String> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("QUESTION:")
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
}

/// The structured block an agent emits as its final output.
#[derive(Debug, Clone, Deserialize)]
pub struct StepReport {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Extract the terminal report from an agent's result text.
///
/// Tolerates a fenced code block around the JSON and prose before or
/// after it; the last parseable JSON object with a `success` field wins.
pub fn parse_step_report(text: &str) -> Option<StepReport> {
    // Fast path: the whole text is the report.
    if let Ok(report) = serde_json::from_str::<StepReport>(text.trim()) {
        return Some(report);
    }

    let mut last = None;
    for candidate in json_candidates(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if value.get("success").is_some() {
                if let Ok(report) = serde_json::from_value::<StepReport>(value) {
                    last = Some(report);
                }
            }
        }
    }
    last
}

/// Candidate JSON object substrings: fenced blocks first, then balanced
/// brace spans.
fn json_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    // ```json ... ``` fences
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(end) = after[body_start..].find("```") {
            candidates.push(after[body_start..body_start + end].trim().to_string());
            rest = &after[body_start + end + 3..];
        } else {
            break;
        }
    }

    // Balanced top-level brace spans
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start.take() {
                        candidates.push(text[s..=i].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    candidates
}
