// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task Executor (spec.md §4.7). Orchestrates a whole task: acquires the
//! lock, asks the Dependency Scheduler for an order, runs each eligible
//! step through the Step Executor under retry and a timeout deadline,
//! persists targeted field updates after every step, and on reaching a
//! terminal state releases the lock and invokes the Learning Observer.
//!
//! Grounded on `executor.rs::WorkflowExecutor::execute`'s overall shape
//! (load → iterate → persist-per-step → terminal hook), reworked to be
//! strictly sequential per spec.md §5 rather than `tokio::spawn`-parallel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{self, ToolFailure};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::learning;
use crate::model::{HistoryEntry, HistoryStatus, Plan, StepStatus, Task, TaskStatus};
use crate::repository::{Repository, TaskFieldPatch};
use crate::scheduler;
use crate::state_machine;
use crate::step_executor::{self, StepAttempt, StepOutcome};
use crate::tool::{ToolInvoker, ValueGenerator};

/// One `(stepId, dotted-field, value)` triple supplied to `resume_task`.
#[derive(Debug, Clone)]
pub struct ResumeInput {
    pub step_id: String,
    pub field: String,
    pub value: Value,
}

enum StepLoopOutcome {
    Completed,
    Paused,
    Cancelled,
    /// Terminal failure reason for the whole task.
    Failed(String),
}

/// Orchestrates execution of persisted `Task`s against a persisted `Plan`.
/// `Send + Sync`; safe to share behind an `Arc` and drive many distinct
/// tasks concurrently from a multi-threaded runtime (spec.md §5).
pub struct TaskExecutor {
    repo: Arc<dyn Repository>,
    invoker: Arc<dyn ToolInvoker>,
    generator: Arc<dyn ValueGenerator>,
    config: EngineConfig,
}

impl TaskExecutor {
    pub fn new(
        repo: Arc<dyn Repository>,
        invoker: Arc<dyn ToolInvoker>,
        generator: Arc<dyn ValueGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            invoker,
            generator,
            config,
        }
    }

    /// Fails with `NotFound` if the task is absent, returns silently (no
    /// new history, status unchanged) if the task is already terminal.
    pub async fn execute_task(&self, task_id: Uuid) -> Result<(Uuid, TaskStatus)> {
        let mut task = self
            .repo
            .find_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))?;

        if task.is_terminal() {
            return Ok((task.id, task.status));
        }

        if task.lock_token.is_some() {
            warn!(task_id = %task_id, "execute_task rejected: lock already held");
            return Err(EngineError::LockContention);
        }

        let plan = self
            .repo
            .find_plan(task.plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan '{}'", task.plan_id)))?;

        state_machine::validate_transition(task.status, TaskStatus::InProgress)?;
        let lock_token = state_machine::mint_lock_token();
        task.status = TaskStatus::InProgress;
        task.lock_token = Some(lock_token.clone());
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::InProgress),
                    lock_token: Some(Some(lock_token.clone())),
                    ..Default::default()
                },
                None,
            )
            .await?;
        info!(task_id = %task_id, %lock_token, "task lock acquired");

        let order = match scheduler::topological_order(&plan.steps) {
            Ok(order) => order,
            Err(err) => return self.fail_task(task_id, &mut task, &plan, err.to_string()).await,
        };

        for idx in task.current_step_index..order.len() {
            if self.observed_cancellation(task_id).await? {
                return self.cancel_in_place(task_id, &mut task, &plan).await;
            }

            let step_id = order[idx].clone();
            let Some(step) = plan.step(&step_id) else {
                return self
                    .fail_task(task_id, &mut task, &plan, format!("scheduled step '{step_id}' missing from plan"))
                    .await;
            };

            if !scheduler::is_eligible(step, &task.step_outputs) {
                self.skip_step(task_id, &lock_token, &mut task, &plan, &step_id, idx)
                    .await?;
                continue;
            }

            match self.run_step_with_retries(&lock_token, &mut task, &plan, &step_id).await? {
                StepLoopOutcome::Completed => {
                    task.current_step_index = idx + 1;
                    self.repo
                        .update_task_fields(
                            task_id,
                            TaskFieldPatch {
                                current_step_index: Some(task.current_step_index),
                                ..Default::default()
                            },
                            Some(&lock_token),
                        )
                        .await?;
                }
                StepLoopOutcome::Paused => return self.pause_in_place(task_id, &mut task, &lock_token).await,
                StepLoopOutcome::Cancelled => return self.cancel_in_place(task_id, &mut task, &plan).await,
                StepLoopOutcome::Failed(reason) => {
                    return self.fail_task(task_id, &mut task, &plan, reason).await
                }
            }
        }

        task.status = TaskStatus::Completed;
        task.lock_token = None;
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::Completed),
                    lock_token: Some(None),
                    ..Default::default()
                },
                Some(&lock_token),
            )
            .await?;
        info!(task_id = %task_id, "task completed");
        self.observe_terminal(task_id, &mut task, &plan).await;

        Ok((task_id, TaskStatus::Completed))
    }

    /// Fails unless the task is `paused`. Groups inputs by step, writes
    /// them into `userInputs[stepId]` via the dotted-field setter, clears
    /// `pendingUserInputs`, resets the paused step to `pending`, and
    /// re-enters `execute_task`.
    pub async fn resume_task(&self, task_id: Uuid, inputs: Vec<ResumeInput>) -> Result<Uuid> {
        let mut task = self
            .repo
            .find_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))?;

        if task.status != TaskStatus::Paused {
            return Err(EngineError::InvalidResume(format!(
                "task is '{:?}', not paused",
                task.status
            )));
        }

        let pending_fields: std::collections::BTreeSet<(String, String)> = task
            .pending_user_inputs
            .iter()
            .map(|p| (p.step_id.clone(), p.field.clone()))
            .collect();
        for input in &inputs {
            if !pending_fields.contains(&(input.step_id.clone(), input.field.clone())) {
                return Err(EngineError::InvalidResume(format!(
                    "field '{}' on step '{}' is not awaiting input",
                    input.field, input.step_id
                )));
            }
        }
        let supplied: std::collections::BTreeSet<(String, String)> = inputs
            .iter()
            .map(|i| (i.step_id.clone(), i.field.clone()))
            .collect();
        if supplied != pending_fields {
            return Err(EngineError::InvalidResume(
                "supplied inputs do not cover every pending field".to_string(),
            ));
        }

        let paused_step_id = task
            .pending_user_inputs
            .first()
            .map(|p| p.step_id.clone())
            .expect("paused task has at least one pending input (invariant a)");

        for input in inputs {
            let step_inputs = task.user_inputs.entry(input.step_id.clone()).or_default();
            step_inputs.insert(input.field.clone(), input.value.clone());
            self.repo
                .update_task_fields(
                    task_id,
                    TaskFieldPatch {
                        user_input: Some((input.step_id, input.field, input.value)),
                        ..Default::default()
                    },
                    None,
                )
                .await?;
        }

        task.pending_user_inputs.clear();
        task.status = TaskStatus::InProgress;
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::InProgress),
                    pending_user_inputs: Some(Vec::new()),
                    ..Default::default()
                },
                None,
            )
            .await?;
        self.repo
            .update_step_status(task.plan_id, &paused_step_id, StepStatus::Pending)
            .await?;

        self.execute_task(task_id).await?;
        Ok(task_id)
    }

    /// Moves `task_id` to `cancelled` from any non-terminal state
    /// (SUPPLEMENTED FEATURE, see SPEC_FULL.md §4.7). The executor only
    /// observes this flag between steps/attempts; it never aborts an
    /// in-flight tool invocation.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let mut task = self
            .repo
            .find_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))?;

        if task.is_terminal() {
            return Ok(());
        }

        let plan = self
            .repo
            .find_plan(task.plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan '{}'", task.plan_id)))?;

        state_machine::validate_transition(task.status, TaskStatus::Cancelled)?;
        task.status = TaskStatus::Cancelled;
        self.repo
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .await?;
        info!(task_id = %task_id, "task cancelled");
        self.observe_terminal(task_id, &mut task, &plan).await;
        Ok(())
    }

    async fn observed_cancellation(&self, task_id: Uuid) -> Result<bool> {
        Ok(self
            .repo
            .find_task(task_id)
            .await?
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn run_step_with_retries(
        &self,
        lock_token: &str,
        task: &mut Task,
        plan: &Plan,
        step_id: &str,
    ) -> Result<StepLoopOutcome> {
        let deadline = Duration::from_millis(task.timeout_ms);
        let max_attempts = task.max_retries + 1;

        for attempt in 0..max_attempts {
            if attempt > 0 && self.observed_cancellation(task.id).await? {
                return Ok(StepLoopOutcome::Cancelled);
            }

            let user_inputs_for_step = task.user_inputs.get(step_id).cloned();
            let attempt_spec = StepAttempt {
                step_id,
                action: &plan.step(step_id).expect("step exists").action,
                parameters: &plan.step(step_id).expect("step exists").parameters,
                agent_config_id: &task.agent_config_id,
                step_outputs: &task.step_outputs,
                user_inputs_for_step: user_inputs_for_step.as_ref(),
                missing_data: &plan.missing_data,
            };

            let invoker = self.invoker.clone();
            let generator = self.generator.clone();
            let timed = crate::timeout::with_deadline(deadline, async move {
                Ok(step_executor::execute_attempt(&attempt_spec, invoker.as_ref(), generator.as_ref()).await)
            })
            .await;

            let (start_entry, outcome) = match timed {
                Ok(pair) => pair,
                Err(EngineError::Timeout { duration }) => {
                    let start_entry = HistoryEntry {
                        step_id: step_id.to_string(),
                        timestamp: Utc::now(),
                        status: HistoryStatus::Started,
                        duration: None,
                        error: None,
                        output: None,
                    };
                    (
                        start_entry,
                        StepOutcome::Failure {
                            error: format!("step timed out after {duration:?}"),
                            duration,
                        },
                    )
                }
                Err(err) => return Err(err),
            };

            task.push_history(start_entry.clone());
            self.repo.append_history(task.id, start_entry).await?;
            self.repo
                .update_step_status(plan.id, step_id, StepStatus::InProgress)
                .await?;

            match &outcome {
                StepOutcome::Paused { pending } => {
                    task.pending_user_inputs = pending.clone();
                    return Ok(StepLoopOutcome::Paused);
                }
                StepOutcome::Success { .. } => {
                    let (terminal_entry, status) = step_executor::terminal_history_entry(step_id, &outcome);
                    task.push_history(terminal_entry.clone());
                    self.repo.append_history(task.id, terminal_entry).await?;
                    self.repo.update_step_status(plan.id, step_id, status).await?;

                    let StepOutcome::Success { output, .. } = outcome else {
                        unreachable!("matched above")
                    };
                    task.step_outputs.insert(step_id.to_string(), output.clone());
                    // `attempt` counts prior failed attempts (0 on a
                    // first-try success); spec.md §8.3 requires
                    // `history_attempts(s) == retryCount[s] + 1` at a
                    // terminal step state, so the count of retries spent
                    // getting here, not a flat reset, is what's recorded.
                    task.retry_count.insert(step_id.to_string(), attempt);
                    self.repo
                        .update_task_fields(
                            task.id,
                            TaskFieldPatch {
                                step_output: Some((step_id.to_string(), output)),
                                retry_count: Some((step_id.to_string(), attempt)),
                                ..Default::default()
                            },
                            Some(lock_token),
                        )
                        .await?;

                    return Ok(StepLoopOutcome::Completed);
                }
                StepOutcome::Failure { error, .. } => {
                    let (terminal_entry, status) = step_executor::terminal_history_entry(step_id, &outcome);
                    task.push_history(terminal_entry.clone());
                    self.repo.append_history(task.id, terminal_entry).await?;
                    self.repo.update_step_status(plan.id, step_id, status).await?;

                    let attempts_remaining = attempt + 1 < max_attempts;
                    let category = classify::classify(&ToolFailure {
                        message: error,
                        http_status: None,
                    });
                    let retryable = attempts_remaining && category == classify::Category::Retryable;
                    let error = error.clone();

                    let new_retry_count = attempt + 1;
                    task.retry_count.insert(step_id.to_string(), new_retry_count);
                    self.repo
                        .update_task_fields(
                            task.id,
                            TaskFieldPatch {
                                retry_count: Some((step_id.to_string(), new_retry_count)),
                                ..Default::default()
                            },
                            Some(lock_token),
                        )
                        .await?;

                    if !retryable {
                        return Ok(StepLoopOutcome::Failed(error));
                    }

                    let backoff = classify::backoff_delay(attempt, self.config.base_backoff, self.config.max_backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        unreachable!("retry loop exits via return before exhausting max_attempts iterations")
    }

    async fn skip_step(
        &self,
        task_id: Uuid,
        lock_token: &str,
        task: &mut Task,
        plan: &Plan,
        step_id: &str,
        idx: usize,
    ) -> Result<()> {
        let entry = HistoryEntry {
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
            status: HistoryStatus::Skipped,
            duration: None,
            error: None,
            output: None,
        };
        task.push_history(entry.clone());
        self.repo.append_history(task_id, entry).await?;
        self.repo.update_step_status(plan.id, step_id, StepStatus::Skipped).await?;
        task.current_step_index = idx + 1;
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    current_step_index: Some(task.current_step_index),
                    ..Default::default()
                },
                Some(lock_token),
            )
            .await?;
        Ok(())
    }

    async fn pause_in_place(&self, task_id: Uuid, task: &mut Task, lock_token: &str) -> Result<(Uuid, TaskStatus)> {
        task.status = TaskStatus::Paused;
        task.lock_token = None;
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::Paused),
                    lock_token: Some(None),
                    pending_user_inputs: Some(task.pending_user_inputs.clone()),
                    ..Default::default()
                },
                Some(lock_token),
            )
            .await?;
        info!(task_id = %task_id, "task paused awaiting user input");
        Ok((task_id, TaskStatus::Paused))
    }

    async fn cancel_in_place(&self, task_id: Uuid, task: &mut Task, plan: &Plan) -> Result<(Uuid, TaskStatus)> {
        task.status = TaskStatus::Cancelled;
        task.lock_token = None;
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::Cancelled),
                    lock_token: Some(None),
                    ..Default::default()
                },
                None,
            )
            .await?;
        info!(task_id = %task_id, "task observed cancellation; halted");
        self.observe_terminal(task_id, task, plan).await;

        Ok((task_id, TaskStatus::Cancelled))
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        task: &mut Task,
        plan: &Plan,
        reason: String,
    ) -> Result<(Uuid, TaskStatus)> {
        task.status = TaskStatus::Failed;
        task.lock_token = None;
        task.error = Some(reason.clone());
        self.repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    status: Some(TaskStatus::Failed),
                    lock_token: Some(None),
                    error: Some(Some(reason)),
                    ..Default::default()
                },
                None,
            )
            .await?;
        warn!(task_id = %task_id, error = %task.error.as_deref().unwrap_or_default(), "task failed");
        self.observe_terminal(task_id, task, plan).await;

        Ok((task_id, TaskStatus::Failed))
    }

    /// Runs the Learning Observer at most once per task (spec.md §4.8
    /// "invoked exactly once per terminal transition"), guarded by
    /// `Task.observed_at` so a crash-and-retry of a terminal task, or a
    /// second caller racing the same terminal transition, cannot double-count
    /// a step's outcome into `ToolPerformance`/`PlanPattern`/`CostTracking`.
    async fn observe_terminal(&self, task_id: Uuid, task: &mut Task, plan: &Plan) {
        if task.observed_at.is_some() {
            return;
        }

        learning::observe(self.repo.as_ref(), &self.config, task, plan).await;

        let observed_at = Utc::now();
        task.observed_at = Some(observed_at);
        if let Err(err) = self
            .repo
            .update_task_fields(
                task_id,
                TaskFieldPatch {
                    observed_at: Some(observed_at),
                    ..Default::default()
                },
                None,
            )
            .await
        {
            warn!(task_id = %task_id, %err, "failed to persist observed_at marker");
        }
    }
}
