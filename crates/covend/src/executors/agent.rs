//! Agent step executor.
//!
//! Resolves the spell, renders it against `bead ∪ context ∪ input`,
//! spawns the agent subprocess with the rendered prompt, and follows the
//! streaming JSON output: text for display, questions suspend the step
//! until an answer is delivered to stdin, and the terminal report block
//! decides success and downstream outputs.

use super::{effective_timeout, fail_record, ExecEnv, StepOutcome};
use crate::process::SpawnConfig;
use chrono::Utc;
use coven_core::agent_stream::{self, AgentEvent};
use coven_core::events::{AgentLifecyclePayload, AgentQuestionPayload};
use coven_core::{
    AgentStatus, Context, EventName, EventPayload, Id, OutputStream, Question, Renderer,
    SpellSource, Step, StepAction, StepRecord,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the executor drains new output lines.
const SCAN_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run(
    env: &ExecEnv,
    name: &str,
    spell: &str,
    input: &BTreeMap<String, String>,
    step: &Step,
    ctx: &Context,
) -> StepOutcome {
    let started = Instant::now();

    // Resolve the spell body.
    let body = match SpellSource::classify(spell) {
        SpellSource::Inline(body) => body,
        SpellSource::Named(spell_name) => match env.spellbook.spell(&spell_name) {
            Some(body) => body.to_string(),
            None => {
                return StepOutcome::from_record(fail_record(
                    name,
                    "spell_not_found",
                    format!("spell not found: {spell_name}"),
                    StepAction::Fail,
                    started.elapsed().as_millis() as u64,
                ));
            }
        },
    };

    // Spell context: the workflow context plus rendered step inputs.
    let mut spell_ctx = ctx.clone();
    let prompt = {
        let renderer = Renderer::new(env.spellbook.as_ref());
        for (key, template) in input {
            match renderer.render(template, ctx) {
                Ok(value) => spell_ctx.set_scalar(key, value),
                Err(e) => {
                    return StepOutcome::from_record(fail_record(
                        name,
                        "template_render",
                        format!("input {key}: {e}"),
                        StepAction::Fail,
                        started.elapsed().as_millis() as u64,
                    ));
                }
            }
        }

        match renderer.render(&body, &spell_ctx) {
            Ok(prompt) => prompt,
            Err(e) => {
                return StepOutcome::from_record(fail_record(
                    name,
                    "template_render",
                    e.to_string(),
                    StepAction::Fail,
                    started.elapsed().as_millis() as u64,
                ));
            }
        }
    };

    // Spawn the agent under the step's deadline.
    let mut args = env.config.agent_args.clone();
    args.push(prompt);
    let spawn = SpawnConfig {
        bead_id: env.bead_id.clone(),
        program: env.config.agent_cmd.clone(),
        args,
        cwd: env.worktree.path.clone(),
        branch: env.worktree.branch.clone(),
        timeout: Some(effective_timeout(env, step)),
        env: vec![("COVEN_BEAD_ID".to_string(), env.bead_id.clone())],
    };

    let record = match env.processes.spawn(spawn).await {
        Ok(record) => record,
        Err(e) => {
            return StepOutcome::from_record(fail_record(
                name,
                "subprocess_spawn",
                e.to_string(),
                StepAction::Block,
                started.elapsed().as_millis() as u64,
            ));
        }
    };

    env.state.put_agent(record.clone());
    env.state.broker().publish(
        EventName::AgentStarted,
        EventPayload::AgentLifecycle(AgentLifecyclePayload {
            bead_id: env.bead_id.clone(),
            agent: record,
        }),
    );
    info!(workflow = %env.workflow_id, step = name, bead = %env.bead_id, "agent step running");

    // Follow the stream until the process finishes.
    let mut scanner = Scanner::default();
    let result = loop {
        scanner.drain(env, name);

        if let Some(result) = env.processes.get_result(&env.bead_id) {
            scanner.drain(env, name);
            break result;
        }

        tokio::select! {
            () = tokio::time::sleep(SCAN_INTERVAL) => {}
            () = env.cancel.cancelled() => {
                env.processes.cancel(&env.bead_id);
                let result = env
                    .processes
                    .wait_for_completion(&env.bead_id)
                    .await
                    .unwrap_or(crate::process::ProcessResult {
                        status: AgentStatus::Killed,
                        exit_code: None,
                        timed_out: false,
                    });
                scanner.drain(env, name);
                break result;
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;

    // The terminal report decides success and structured outputs.
    let result_text = scanner.result_text.clone().unwrap_or_else(|| scanner.text.clone());
    let report = agent_stream::parse_step_report(&result_text)
        .or_else(|| agent_stream::parse_step_report(&scanner.text));

    match (result.status, result.timed_out) {
        (_, true) => StepOutcome::from_record(fail_record(
            name,
            "timeout",
            "agent timed out",
            StepAction::Fail,
            duration_ms,
        )),
        (AgentStatus::Killed, _) => StepOutcome::from_record(fail_record(
            name,
            "cancelled",
            "agent killed",
            StepAction::Fail,
            duration_ms,
        )),
        (AgentStatus::Completed, _) => {
            let success = report.as_ref().map(|r| r.success).unwrap_or(true);
            if success {
                let output = report
                    .as_ref()
                    .filter(|r| !r.summary.is_empty())
                    .map(|r| r.summary.clone())
                    .unwrap_or(result_text);
                StepOutcome::from_record(StepRecord {
                    name: name.to_string(),
                    success: true,
                    output,
                    outputs: report.and_then(|r| r.outputs),
                    exit_code: result.exit_code,
                    status: "ok".to_string(),
                    duration_ms,
                    action: StepAction::Continue,
                })
            } else {
                let error = report
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "agent reported failure".to_string());
                StepOutcome::from_record(StepRecord {
                    name: name.to_string(),
                    success: false,
                    output: error,
                    outputs: None,
                    exit_code: result.exit_code,
                    status: "failed".to_string(),
                    duration_ms,
                    action: StepAction::Block,
                })
            }
        }
        _ => {
            let code = result
                .exit_code
                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
            StepOutcome::from_record(StepRecord {
                name: name.to_string(),
                success: false,
                output: format!("agent exited with code {code}\n{}", tail(&scanner.text, 2000)),
                outputs: None,
                exit_code: result.exit_code,
                status: "failed".to_string(),
                duration_ms,
                action: StepAction::Block,
            })
        }
    }
}

/// Incremental output follower: accumulates display text, remembers the
/// terminal result, and records questions once each.
#[derive(Default)]
struct Scanner {
    last_seq: Option<u64>,
    text: String,
    result_text: Option<String>,
    asked: Vec<String>,
}

impl Scanner {
    fn drain(&mut self, env: &ExecEnv, step_name: &str) {
        let lines = match self.last_seq {
            Some(seq) => env.processes.get_output_since(&env.bead_id, seq),
            None => env.processes.get_output(&env.bead_id),
        };
        let Ok(lines) = lines else { return };

        for line in lines {
            self.last_seq = Some(line.sequence);
            if line.stream != OutputStream::Stdout {
                continue;
            }
            match agent_stream::parse_line(&line.data) {
                AgentEvent::Text(text) | AgentEvent::Raw(text) => {
                    if let Some(question) = agent_stream::match_question_text(&text) {
                        self.ask(env, step_name, question, coven_core::QuestionType::Free, Vec::new());
                    } else if !text.is_empty() {
                        if !self.text.is_empty() {
                            self.text.push('\n');
                        }
                        self.text.push_str(&text);
                    }
                }
                AgentEvent::Result(result) => self.result_text = Some(result),
                AgentEvent::System { subtype } => {
                    debug!(bead = %env.bead_id, subtype, "agent system event");
                }
                AgentEvent::Question {
                    text,
                    question_type,
                    options,
                } => self.ask(env, step_name, text, question_type, options),
            }
        }
    }

    fn ask(
        &mut self,
        env: &ExecEnv,
        step_name: &str,
        text: String,
        question_type: coven_core::QuestionType,
        options: Vec<String>,
    ) {
        if text.is_empty() || self.asked.contains(&text) {
            return;
        }
        self.asked.push(text.clone());

        let question = Question {
            id: Id::new(),
            bead_id: env.bead_id.clone(),
            agent_id: env.bead_id.clone(),
            text,
            question_type,
            options,
            asked_at: Utc::now(),
            answered_at: None,
            answer: None,
        };
        warn!(workflow = %env.workflow_id, step = step_name, question = %question.text, "agent asked a question");
        env.state.put_question(question.clone());
        env.state.broker().publish(
            EventName::AgentQuestion,
            EventPayload::AgentQuestion(AgentQuestionPayload {
                bead_id: env.bead_id.clone(),
                question,
            }),
        );
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::process::ProcessManager;
    use crate::spellbook::Spellbook;
    use crate::state::StateStore;
    use crate::worktree::WorktreeInfo;
    use coven_core::{Bead, BeadStatus, Config, StepKind};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// An env whose "agent" is /bin/sh: agent_args = ["-c"], so the
    /// rendered prompt is executed as a shell script.
    fn env(dir: &TempDir) -> ExecEnv {
        let broker = Arc::new(Broker::with_defaults());
        let state = Arc::new(
            StateStore::load_or_default(dir.path().join("state.json"), broker).unwrap(),
        );
        let mut config = Config::default();
        config.agent_cmd = "/bin/sh".to_string();
        config.agent_args = vec!["-c".to_string()];
        ExecEnv {
            workflow_id: Id::from_string("wf-test"),
            bead_id: "cv-1".to_string(),
            repo: dir.path().to_path_buf(),
            worktree: WorktreeInfo {
                bead_id: "cv-1".to_string(),
                path: dir.path().to_path_buf(),
                branch: "coven/cv-1".to_string(),
            },
            config,
            spellbook: Arc::new(Spellbook::builtin_only().unwrap()),
            processes: Arc::new(ProcessManager::with_defaults()),
            state,
            cancel: CancellationToken::new(),
            grimoire_timeout: None,
        }
    }

    fn agent_step(name: &str, spell: &str) -> Step {
        Step {
            name: name.to_string(),
            timeout: Some(Duration::from_secs(10)),
            when: None,
            output: None,
            kind: StepKind::Agent {
                spell: spell.to_string(),
                input: BTreeMap::new(),
            },
        }
    }

    fn ctx() -> Context {
        Context::with_bead(Bead {
            id: "cv-1".to_string(),
            title: "the task".to_string(),
            body: String::new(),
            bead_type: "feature".to_string(),
            priority: 0,
            labels: Vec::new(),
            status: BeadStatus::Open,
        })
    }

    #[tokio::test]
    async fn inline_spell_runs_and_reports() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        // Inline spell (contains template tag) doubles as the shell script.
        let spell = r#"echo '{"type":"result","result":"{\"success\": true, \"summary\": \"did {{ bead.id }}\", \"outputs\": {\"files_changed\": 1}}"}'"#;
        let step = agent_step("work", spell);
        let outcome = run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;

        assert!(outcome.record.success, "output: {}", outcome.record.output);
        assert_eq!(outcome.record.action, StepAction::Continue);
        assert_eq!(outcome.record.output, "did cv-1");
        assert_eq!(outcome.record.outputs.unwrap()["files_changed"], 1);
    }

    #[tokio::test]
    async fn missing_named_spell_fails_the_step() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = agent_step("work", "no-such-spell");
        let outcome = run(&env, "work", "no-such-spell", &BTreeMap::new(), &step, &ctx()).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.status, "spell_not_found");
        assert_eq!(outcome.record.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn bad_input_template_fails_the_step() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = agent_step("work", "echo hi {{ bead.id }}");
        let mut input = BTreeMap::new();
        input.insert("x".to_string(), "{{ missing.path }}".to_string());
        let outcome = run(&env, "work", "echo hi {{ bead.id }}", &input, &step, &ctx()).await;

        assert_eq!(outcome.record.status, "template_render");
        assert_eq!(outcome.record.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn inputs_are_rendered_into_the_prompt() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let spell = "echo got:{{ detail }}";
        let step = agent_step("work", spell);
        let mut input = BTreeMap::new();
        input.insert("detail".to_string(), "{{ bead.title }}".to_string());
        let outcome = run(&env, "work", spell, &input, &step, &ctx()).await;

        assert!(outcome.record.success);
        assert!(outcome.record.output.contains("got:the task"));
    }

    #[tokio::test]
    async fn nonzero_agent_exit_blocks() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let spell = "echo partial {{ bead.id }}; exit 7";
        let step = agent_step("work", spell);
        let outcome = run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, Some(7));
        assert_eq!(outcome.record.action, StepAction::Block);
    }

    #[tokio::test]
    async fn failed_report_blocks_with_error() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let spell = r#"echo '{"success": false, "summary": "", "error": "tests {{ bead.id }} still red"}'"#;
        let step = agent_step("work", spell);
        let outcome = run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.action, StepAction::Block);
        assert!(outcome.record.output.contains("still red"));
    }

    #[tokio::test]
    async fn timeout_fails_the_step() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let spell = "sleep 30 # {{ bead.id }}";
        let mut step = agent_step("work", spell);
        step.timeout = Some(Duration::from_millis(300));
        let outcome = run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;

        assert_eq!(outcome.record.status, "timeout");
        assert_eq!(outcome.record.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn questions_are_recorded_and_answers_flow_back() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let state = Arc::clone(&env.state);
        let processes = Arc::clone(&env.processes);

        // The agent asks, waits for stdin, then succeeds.
        let spell = r#"echo "QUESTION: proceed with {{ bead.id }}?"; read answer; echo "{\"success\": true, \"summary\": \"answered $answer\"}""#;
        let step = agent_step("work", spell);

        // Answer the question as soon as it appears in the store.
        let answerer = tokio::spawn(async move {
            for _ in 0..100 {
                let questions = state.questions();
                if let Some(q) = questions.first() {
                    state.answer_question(&q.id.0, "yes").unwrap();
                    processes.respond("cv-1", "yes").await.unwrap();
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        });

        let outcome = run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;
        assert!(answerer.await.unwrap(), "question never surfaced");
        assert!(outcome.record.success, "output: {}", outcome.record.output);
        assert_eq!(outcome.record.output, "answered yes");

        let questions = env.state.questions();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].answer.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn agent_events_reach_the_broker() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let (_id, mut rx) = env.state.broker().subscribe();
        let spell = "echo done {{ bead.id }}";
        let step = agent_step("work", spell);
        run(&env, "work", spell, &BTreeMap::new(), &step, &ctx()).await;

        let mut saw_started = false;
        while let Ok(envelope) = rx.try_recv() {
            if envelope.name == EventName::AgentStarted {
                saw_started = true;
            }
        }
        assert!(saw_started);
    }
}
