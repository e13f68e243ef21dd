//! Script step executor.
//!
//! Runs the command through `sh -c` inside the task's worktree and
//! captures stdout+stderr line by line, size-capped. Exit 0 is success;
//! failure policy comes from `on_fail`, and `on_success: exit_loop`
//! breaks the enclosing loop.

use super::{effective_timeout, fail_record, ExecEnv, StepOutcome};
use coven_core::{OnFail, OnSuccess, Step, StepAction, StepRecord};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Cap on captured script output.
const CAPTURE_LIMIT_BYTES: usize = 1024 * 1024;

pub async fn run(
    env: &ExecEnv,
    name: &str,
    command: &str,
    on_fail: OnFail,
    on_success: OnSuccess,
    step: &Step,
    in_loop: bool,
) -> StepOutcome {
    let timeout = effective_timeout(env, step);
    let started = Instant::now();

    debug!(workflow = %env.workflow_id, step = name, command, "script step starting");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&env.worktree.path)
        .env("COVEN_BEAD_ID", &env.bead_id)
        .env("COVEN_WORKFLOW_ID", env.workflow_id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return StepOutcome::from_record(fail_record(
                name,
                "spawn_failed",
                format!("failed to spawn shell: {e}"),
                on_fail_action(on_fail),
                started.elapsed().as_millis() as u64,
            ));
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(capture(stdout));
    let err_task = tokio::spawn(capture(stderr));

    let status = tokio::select! {
        status = child.wait() => status,
        () = tokio::time::sleep(timeout) => {
            warn!(workflow = %env.workflow_id, step = name, timeout_sec = timeout.as_secs(), "script step timed out");
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = out_task.await;
            let _ = err_task.await;
            return StepOutcome::from_record(fail_record(
                name,
                "timeout",
                format!("script timed out after {}s", timeout.as_secs()),
                StepAction::Fail,
                started.elapsed().as_millis() as u64,
            ));
        }
        () = env.cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = out_task.await;
            let _ = err_task.await;
            return StepOutcome::from_record(fail_record(
                name,
                "cancelled",
                "workflow cancelled",
                StepAction::Fail,
                started.elapsed().as_millis() as u64,
            ));
        }
    };

    let stdout_text = out_task.await.unwrap_or_default();
    let stderr_text = err_task.await.unwrap_or_default();
    let duration_ms = started.elapsed().as_millis() as u64;

    let output = if stderr_text.is_empty() {
        stdout_text.clone()
    } else if stdout_text.is_empty() {
        stderr_text.clone()
    } else {
        format!("{stdout_text}\n{stderr_text}")
    };

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            return StepOutcome::from_record(fail_record(
                name,
                "wait_failed",
                format!("failed to wait on script: {e}"),
                on_fail_action(on_fail),
                duration_ms,
            ));
        }
    };

    // Structured outputs when the script printed a JSON object.
    let outputs = serde_json::from_str::<serde_json::Value>(stdout_text.trim())
        .ok()
        .filter(serde_json::Value::is_object);

    match exit_code {
        Some(0) => {
            let action = if in_loop && on_success == OnSuccess::ExitLoop {
                StepAction::ExitLoop
            } else {
                StepAction::Continue
            };
            StepOutcome::from_record(StepRecord {
                name: name.to_string(),
                success: true,
                output,
                outputs,
                exit_code: Some(0),
                status: "ok".to_string(),
                duration_ms,
                action,
            })
        }
        code => {
            let shown = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            let action = on_fail_action(on_fail);
            StepOutcome::from_record(StepRecord {
                name: name.to_string(),
                success: false,
                output: format!("script exited with code {shown}\n{output}"),
                outputs,
                exit_code: code,
                status: "failed".to_string(),
                duration_ms,
                action,
            })
        }
    }
}

fn on_fail_action(on_fail: OnFail) -> StepAction {
    match on_fail {
        OnFail::Continue => StepAction::Continue,
        OnFail::Block => StepAction::Block,
    }
}

/// Read a stream line by line up to the capture limit.
async fn capture<R>(source: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(source) = source else {
        return String::new();
    };
    let mut collected = String::new();
    let mut truncated = false;
    let mut lines = BufReader::new(source).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if collected.len() + line.len() > CAPTURE_LIMIT_BYTES {
            truncated = true;
            continue; // keep draining so the child doesn't block on a full pipe
        }
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
    }
    if truncated {
        collected.push_str("\n[output truncated]");
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::process::ProcessManager;
    use crate::spellbook::Spellbook;
    use crate::state::StateStore;
    use crate::worktree::WorktreeInfo;
    use coven_core::{Config, Id, StepKind};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn env(dir: &TempDir) -> ExecEnv {
        let broker = Arc::new(Broker::with_defaults());
        let state = Arc::new(
            StateStore::load_or_default(dir.path().join("state.json"), broker).unwrap(),
        );
        ExecEnv {
            workflow_id: Id::from_string("wf-test"),
            bead_id: "cv-1".to_string(),
            repo: dir.path().to_path_buf(),
            worktree: WorktreeInfo {
                bead_id: "cv-1".to_string(),
                path: dir.path().to_path_buf(),
                branch: "coven/cv-1".to_string(),
            },
            config: Config::default(),
            spellbook: Arc::new(Spellbook::builtin_only().unwrap()),
            processes: Arc::new(ProcessManager::with_defaults()),
            state,
            cancel: CancellationToken::new(),
            grimoire_timeout: None,
        }
    }

    fn script_step(name: &str, command: &str) -> Step {
        Step {
            name: name.to_string(),
            timeout: None,
            when: None,
            output: None,
            kind: StepKind::Script {
                command: command.to_string(),
                on_fail: OnFail::Block,
                on_success: OnSuccess::None,
            },
        }
    }

    #[tokio::test]
    async fn successful_script_captures_output() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("echo", "printf hello");
        let outcome = run(
            &env,
            "echo",
            "printf hello",
            OnFail::Block,
            OnSuccess::None,
            &step,
            false,
        )
        .await;

        assert!(outcome.record.success);
        assert_eq!(outcome.record.output, "hello");
        assert_eq!(outcome.record.exit_code, Some(0));
        assert_eq!(outcome.record.action, StepAction::Continue);
    }

    #[tokio::test]
    async fn failing_script_blocks_by_default() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("bad", "exit 3");
        let outcome = run(&env, "bad", "exit 3", OnFail::Block, OnSuccess::None, &step, false).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.exit_code, Some(3));
        assert_eq!(outcome.record.action, StepAction::Block);
        assert!(outcome.record.output.contains("code 3"));
    }

    #[tokio::test]
    async fn failing_script_can_continue() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("bad", "exit 1");
        let outcome =
            run(&env, "bad", "exit 1", OnFail::Continue, OnSuccess::None, &step, false).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.action, StepAction::Continue);
    }

    #[tokio::test]
    async fn exit_loop_only_applies_inside_loops() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("ok", "true");

        let inside = run(&env, "ok", "true", OnFail::Block, OnSuccess::ExitLoop, &step, true).await;
        assert_eq!(inside.record.action, StepAction::ExitLoop);

        let outside =
            run(&env, "ok", "true", OnFail::Block, OnSuccess::ExitLoop, &step, false).await;
        assert_eq!(outside.record.action, StepAction::Continue);
    }

    #[tokio::test]
    async fn timeout_produces_fail_action() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let mut step = script_step("slow", "sleep 30");
        step.timeout = Some(Duration::from_millis(100));
        let outcome =
            run(&env, "slow", "sleep 30", OnFail::Block, OnSuccess::None, &step, false).await;

        assert!(!outcome.record.success);
        assert_eq!(outcome.record.action, StepAction::Fail);
        assert_eq!(outcome.record.status, "timeout");
    }

    #[tokio::test]
    async fn cancellation_stops_the_script() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        env.cancel.cancel();
        let step = script_step("slow", "sleep 30");
        let outcome =
            run(&env, "slow", "sleep 30", OnFail::Block, OnSuccess::None, &step, false).await;
        assert_eq!(outcome.record.status, "cancelled");
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("err", "echo warn >&2; exit 2");
        let outcome =
            run(&env, "err", "echo warn >&2; exit 2", OnFail::Block, OnSuccess::None, &step, false)
                .await;
        assert!(outcome.record.output.contains("warn"));
    }

    #[tokio::test]
    async fn json_stdout_becomes_structured_outputs() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let cmd = r#"printf '{"files_changed": 4}'"#;
        let step = script_step("json", cmd);
        let outcome = run(&env, "json", cmd, OnFail::Block, OnSuccess::None, &step, false).await;
        assert!(outcome.record.success);
        assert_eq!(outcome.record.outputs.unwrap()["files_changed"], 4);
    }

    #[tokio::test]
    async fn runs_inside_the_worktree() {
        let dir = TempDir::new().unwrap();
        let env = env(&dir);
        let step = script_step("pwd", "pwd");
        let outcome = run(&env, "pwd", "pwd", OnFail::Block, OnSuccess::None, &step, false).await;
        let reported = std::fs::canonicalize(outcome.record.output.trim()).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }
}
