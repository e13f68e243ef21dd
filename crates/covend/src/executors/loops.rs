//! Loop step executor.
//!
//! Runs the nested step sequence up to the iteration ceiling, exposing
//! `loopName.iteration` in the context. A nested `exit_loop` ends the
//! loop successfully; a nested block or hard failure propagates; hitting
//! the ceiling applies `on_max_iterations`.

use super::{execute, fail_record, ExecEnv, StepOutcome, StepSignal};
use coven_core::grimoire::effective_max_iterations;
use coven_core::{Context, OnMaxIterations, Renderer, Step, StepAction, StepRecord};
use std::time::Instant;
use tracing::{debug, info};

pub async fn run(
    env: &ExecEnv,
    name: &str,
    max_iterations: u32,
    on_max: OnMaxIterations,
    steps: &[Step],
    ctx: &mut Context,
) -> StepOutcome {
    let limit = effective_max_iterations(max_iterations);
    let started = Instant::now();
    let mut nested_records: Vec<StepRecord> = Vec::new();

    for iteration in 1..=limit {
        ctx.set_loop_iteration(name, iteration);
        debug!(workflow = %env.workflow_id, step = name, iteration, "loop iteration");

        for nested in steps {
            if env.cancel.is_cancelled() {
                return StepOutcome::from_record(fail_record(
                    name,
                    "cancelled",
                    "workflow cancelled",
                    StepAction::Fail,
                    started.elapsed().as_millis() as u64,
                ));
            }

            // Nested `when` gates are evaluated here so skipped steps
            // still leave a record for templates to read.
            if let Some(when) = &nested.when {
                let renderer = Renderer::new(env.spellbook.as_ref());
                match renderer.render_condition(when, ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        let record = StepRecord::skipped(&nested.name);
                        apply_record(ctx, nested, &record);
                        nested_records.push(record);
                        continue;
                    }
                    Err(e) => {
                        return finish(
                            nested_records,
                            fail_record(
                                name,
                                "condition_non_boolean",
                                format!("step {}: {e}", nested.name),
                                StepAction::Block,
                                started.elapsed().as_millis() as u64,
                            ),
                        );
                    }
                }
            }

            let outcome = Box::pin(execute(env, nested, ctx, true)).await;
            apply_record(ctx, nested, &outcome.record);
            nested_records.extend(outcome.nested_records.clone());
            nested_records.push(outcome.record.clone());

            if outcome.signal == StepSignal::PendingMerge {
                // A merge gate inside a loop still suspends the workflow.
                let mut result = StepOutcome {
                    record: outcome.record,
                    signal: StepSignal::PendingMerge,
                    merge_review: outcome.merge_review,
                    nested_records,
                };
                result.record.name = name.to_string();
                return result;
            }

            match outcome.record.action {
                StepAction::Continue => {}
                StepAction::ExitLoop => {
                    info!(workflow = %env.workflow_id, step = name, iteration, "loop exited early");
                    return finish(
                        nested_records,
                        StepRecord {
                            name: name.to_string(),
                            success: true,
                            output: format!("exited in iteration {iteration}"),
                            outputs: None,
                            exit_code: None,
                            status: "ok".to_string(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            action: StepAction::Continue,
                        },
                    );
                }
                StepAction::Block => {
                    return finish(
                        nested_records,
                        StepRecord {
                            name: name.to_string(),
                            success: false,
                            output: format!(
                                "step {} blocked in iteration {iteration}: {}",
                                nested.name, outcome.record.output
                            ),
                            outputs: None,
                            exit_code: outcome.record.exit_code,
                            status: "blocked".to_string(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            action: StepAction::Block,
                        },
                    );
                }
                StepAction::Fail => {
                    return finish(
                        nested_records,
                        StepRecord {
                            name: name.to_string(),
                            success: false,
                            output: format!(
                                "step {} failed in iteration {iteration}: {}",
                                nested.name, outcome.record.output
                            ),
                            outputs: None,
                            exit_code: outcome.record.exit_code,
                            status: "failed".to_string(),
                            duration_ms: started.elapsed().as_millis() as u64,
                            action: StepAction::Fail,
                        },
                    );
                }
            }
        }
    }

    // Ceiling reached without an exit condition.
    let duration_ms = started.elapsed().as_millis() as u64;
    let record = match on_max {
        OnMaxIterations::Block => StepRecord {
            name: name.to_string(),
            success: false,
            output: format!("reached max iterations ({limit})"),
            outputs: None,
            exit_code: None,
            status: "max_iterations".to_string(),
            duration_ms,
            action: StepAction::Block,
        },
        OnMaxIterations::Exit | OnMaxIterations::Continue => StepRecord {
            name: name.to_string(),
            success: true,
            output: format!("completed {limit} iterations"),
            outputs: None,
            exit_code: None,
            status: "ok".to_string(),
            duration_ms,
            action: StepAction::Continue,
        },
        OnMaxIterations::Fail => StepRecord {
            name: name.to_string(),
            success: false,
            output: format!("reached max iterations ({limit})"),
            outputs: None,
            exit_code: None,
            status: "max_iterations".to_string(),
            duration_ms,
            action: StepAction::Fail,
        },
    };
    finish(nested_records, record)
}

fn apply_record(ctx: &mut Context, step: &Step, record: &StepRecord) {
    ctx.upsert_step(&step.name, record.clone());
    if let Some(alias) = &step.output {
        ctx.upsert_step(alias, record.clone());
    }
    ctx.set_previous(record.clone());
}

fn finish(nested_records: Vec<StepRecord>, record: StepRecord) -> StepOutcome {
    StepOutcome {
        record,
        signal: StepSignal::None,
        merge_review: None,
        nested_records,
    }
}
