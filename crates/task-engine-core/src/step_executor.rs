// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step Executor (spec.md §4.6). Executes one attempt of one step: resolves
//! parameters, checks for unresolved prompts/generations, invokes the tool,
//! normalises the output, and reports what happened to the caller.
//!
//! Grounded on `executor.rs::execute_step_inner`'s dispatch-by-action-kind
//! shape, generalised to the single `ToolInvoker` seam this engine uses in
//! place of the teacher's per-`StepType` match arms.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::model::{FieldType, HistoryEntry, HistoryStatus, MissingDataSpec, PendingUserInput, StepOutput, StepStatus};
use crate::template::{ExecutionContext, TemplateResolver};
use crate::tool::{infer_field_type, ToolCallOutcome, ToolInvoker, ValueGenerator};

/// Sum-type outcome of one step attempt (spec.md §9: "avoid representing
/// paused as a special value inside the success channel").
#[derive(Debug)]
pub enum StepOutcome {
    /// The step could not proceed without human input. No tool was called.
    Paused { pending: Vec<PendingUserInput> },
    /// The tool ran and reported success.
    Success { output: StepOutput, duration: Duration },
    /// The tool ran and reported failure, or could not be dispatched at all.
    Failure { error: String, duration: Duration },
}

/// Everything one attempt needs, gathered by the caller (the Task
/// Executor) from the persisted `Task`/`Plan`.
pub struct StepAttempt<'a> {
    pub step_id: &'a str,
    pub action: &'a str,
    pub parameters: &'a Value,
    pub agent_config_id: &'a str,
    pub step_outputs: &'a BTreeMap<String, StepOutput>,
    pub user_inputs_for_step: Option<&'a BTreeMap<String, Value>>,
    pub missing_data: &'a [MissingDataSpec],
}

/// Runs one attempt of `attempt.step_id`. Returns the history entries that
/// must be appended (always starts with a `started` entry, per spec.md §4.6
/// step 1) alongside the outcome; the caller is responsible for persisting
/// both and for updating `Plan` step status via its own `Repository` call.
pub async fn execute_attempt(
    attempt: &StepAttempt<'_>,
    invoker: &dyn ToolInvoker,
    generator: &dyn ValueGenerator,
) -> (HistoryEntry, StepOutcome) {
    let start_entry = HistoryEntry {
        step_id: attempt.step_id.to_string(),
        timestamp: Utc::now(),
        status: HistoryStatus::Started,
        duration: None,
        error: None,
        output: None,
    };
    debug!(step_id = %attempt.step_id, "step attempt started");

    let outcome = run_attempt(attempt, invoker, generator).await;
    (start_entry, outcome)
}

async fn run_attempt(
    attempt: &StepAttempt<'_>,
    invoker: &dyn ToolInvoker,
    generator: &dyn ValueGenerator,
) -> StepOutcome {
    let started = Instant::now();

    let ctx = ExecutionContext {
        step_outputs: attempt.step_outputs,
        now: Utc::now(),
    };

    let resolved = match TemplateResolver::resolve(
        attempt.parameters,
        attempt.user_inputs_for_step,
        attempt.step_id,
        &ctx,
    ) {
        Ok(v) => v,
        Err(err) => {
            warn!(step_id = %attempt.step_id, %err, "template resolution failed");
            return StepOutcome::Failure {
                error: err.to_string(),
                duration: started.elapsed(),
            };
        }
    };

    if let Some(pending) = pending_prompt_inputs(attempt.step_id, &resolved) {
        info!(step_id = %attempt.step_id, count = pending.len(), "step paused awaiting user input");
        return StepOutcome::Paused { pending };
    }

    let resolved = match fill_generated_fields(attempt, resolved, generator).await {
        Ok(v) => v,
        Err(err) => {
            warn!(step_id = %attempt.step_id, %err, "value generation failed");
            return StepOutcome::Failure {
                error: err.to_string(),
                duration: started.elapsed(),
            };
        }
    };

    let call_result = invoker.call(attempt.action, resolved).await;
    let duration = started.elapsed();

    match call_result {
        Ok(ToolCallOutcome::Payload(payload)) => {
            let output = normalise_payload(payload);
            info!(step_id = %attempt.step_id, ?duration, "step completed");
            StepOutcome::Success {
                output: StepOutput::success(output),
                duration,
            }
        }
        Ok(ToolCallOutcome::Error { message, .. }) => {
            warn!(step_id = %attempt.step_id, error = %message, "tool reported failure");
            StepOutcome::Failure { error: message, duration }
        }
        Err(err) => {
            warn!(step_id = %attempt.step_id, %err, "tool invocation failed");
            StepOutcome::Failure {
                error: err.to_string(),
                duration,
            }
        }
    }
}

/// Step 4: a remaining `PROMPT_USER` sentinel pauses the step.
fn pending_prompt_inputs(step_id: &str, resolved: &Value) -> Option<Vec<PendingUserInput>> {
    use crate::template::Sentinel;

    let sentinels = TemplateResolver::extract_sentinels(resolved);
    let prompts: Vec<PendingUserInput> = sentinels
        .into_iter()
        .filter(|(_, kind)| matches!(kind, Sentinel::PromptUser))
        .map(|(field, _)| PendingUserInput {
            step_id: step_id.to_string(),
            field,
            description: None,
        })
        .collect();

    if prompts.is_empty() {
        None
    } else {
        Some(prompts)
    }
}

/// Step 5: fill in every remaining `GENERATE` sentinel via the injected
/// `ValueGenerator`, writing each generated scalar back at its dotted path.
async fn fill_generated_fields(
    attempt: &StepAttempt<'_>,
    mut resolved: Value,
    generator: &dyn ValueGenerator,
) -> Result<Value> {
    use crate::template::Sentinel;

    loop {
        let sentinels = TemplateResolver::extract_sentinels(&resolved);
        let Some((field, _)) = sentinels.into_iter().find(|(_, kind)| matches!(kind, Sentinel::Generate)) else {
            break;
        };

        let field_type = attempt
            .missing_data
            .iter()
            .find(|m| m.step_id == attempt.step_id && m.field == field)
            .map(|m| m.field_type)
            .unwrap_or_else(|| infer_field_type(&field));

        let value = generator
            .generate(&field, field_type, &resolved, attempt.agent_config_id)
            .await?;

        crate::path::set(&mut resolved, &field, value);
    }

    Ok(resolved)
}

/// Step 7: normalises a tool's raw payload to the `{output: V}` envelope
/// shape described in spec.md §4.6.
fn normalise_payload(payload: Value) -> Value {
    match payload {
        Value::Null => Value::Null,
        Value::Array(items) if items.is_empty() => Value::Array(Vec::new()),
        Value::String(s) => {
            // A JSON-encoded MCP-style envelope arrives as a string; decode
            // it if it parses, otherwise pass the text through as-is.
            serde_json::from_str::<Value>(&s).unwrap_or(Value::String(s))
        }
        other => other,
    }
}

/// Used by the Task Executor to build the `completed`/`failed` history
/// entry and the matching plan step status after [`execute_attempt`]
/// returns.
pub fn terminal_history_entry(step_id: &str, outcome: &StepOutcome) -> (HistoryEntry, StepStatus) {
    match outcome {
        StepOutcome::Success { output, duration } => (
            HistoryEntry {
                step_id: step_id.to_string(),
                timestamp: Utc::now(),
                status: HistoryStatus::Completed,
                duration: Some(*duration),
                error: None,
                output: Some(output.output.clone()),
            },
            StepStatus::Completed,
        ),
        StepOutcome::Failure { error, duration } => (
            HistoryEntry {
                step_id: step_id.to_string(),
                timestamp: Utc::now(),
                status: HistoryStatus::Failed,
                duration: Some(*duration),
                error: Some(error.clone()),
                output: None,
            },
            StepStatus::Failed,
        ),
        StepOutcome::Paused { .. } => unreachable!("pause has no terminal history entry"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoInvoker;

    #[async_trait]
    impl ToolInvoker for EchoInvoker {
        async fn call(&self, _name: &str, args: Value) -> Result<ToolCallOutcome> {
            Ok(ToolCallOutcome::Payload(args))
        }
    }

    struct FailingInvoker;

    #[async_trait]
    impl ToolInvoker for FailingInvoker {
        async fn call(&self, _name: &str, _args: Value) -> Result<ToolCallOutcome> {
            Ok(ToolCallOutcome::Error {
                message: "validation error: not found".to_string(),
                http_status: None,
            })
        }
    }

    struct ConstGenerator;

    #[async_trait]
    impl ValueGenerator for ConstGenerator {
        async fn generate(
            &self,
            _field: &str,
            _field_type: FieldType,
            _step_context: &Value,
            _agent_config_id: &str,
        ) -> Result<Value> {
            Ok(json!("generated-value"))
        }
    }

    fn base_attempt<'a>(
        step_id: &'a str,
        parameters: &'a Value,
        outputs: &'a BTreeMap<String, StepOutput>,
        missing_data: &'a [MissingDataSpec],
    ) -> StepAttempt<'a> {
        StepAttempt {
            step_id,
            action: "noop",
            parameters,
            agent_config_id: "agent-1",
            step_outputs: outputs,
            user_inputs_for_step: None,
            missing_data,
        }
    }

    #[tokio::test]
    async fn successful_attempt_normalises_empty_list() {
        let params = json!([]);
        let outputs = BTreeMap::new();
        let missing = [];
        let attempt = base_attempt("step1", &params, &outputs, &missing);
        let (_, outcome) = execute_attempt(&attempt, &EchoInvoker, &ConstGenerator).await;
        match outcome {
            StepOutcome::Success { output, .. } => assert_eq!(output.output, json!([])),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prompt_user_sentinel_pauses_without_calling_tool() {
        let params = json!({"source": crate::template::SENTINEL_PROMPT_USER});
        let outputs = BTreeMap::new();
        let missing = [];
        let attempt = base_attempt("step2", &params, &outputs, &missing);
        let (_, outcome) = execute_attempt(&attempt, &FailingInvoker, &ConstGenerator).await;
        match outcome {
            StepOutcome::Paused { pending } => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0].field, "source");
            }
            other => panic!("expected paused, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn generate_sentinel_is_filled_before_invocation() {
        let params = json!({"recordId": crate::template::SENTINEL_GENERATE});
        let outputs = BTreeMap::new();
        let missing = [];
        let attempt = base_attempt("step3", &params, &outputs, &missing);
        let (_, outcome) = execute_attempt(&attempt, &EchoInvoker, &ConstGenerator).await;
        match outcome {
            StepOutcome::Success { output, .. } => {
                assert_eq!(output.output["recordId"], json!("generated-value"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_reported_failure_surfaces_as_failure_outcome() {
        let params = json!({});
        let outputs = BTreeMap::new();
        let missing = [];
        let attempt = base_attempt("step4", &params, &outputs, &missing);
        let (_, outcome) = execute_attempt(&attempt, &FailingInvoker, &ConstGenerator).await;
        match outcome {
            StepOutcome::Failure { error, .. } => assert!(error.contains("not found")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn terminal_entry_reflects_success() {
        let outcome = StepOutcome::Success {
            output: StepOutput::success(json!(1)),
            duration: Duration::from_millis(5),
        };
        let (entry, status) = terminal_history_entry("step1", &outcome);
        assert_eq!(entry.status, HistoryStatus::Completed);
        assert_eq!(status, StepStatus::Completed);
    }
}
