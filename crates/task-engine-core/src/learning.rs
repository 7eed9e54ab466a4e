// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Learning Observer (spec.md §4.8). Invoked exactly once per terminal
//! transition; updates `ToolPerformance`, `PlanPattern` and `CostTracking`
//! via idempotent upserts. All failures here are logged and swallowed -
//! they must never mark a task failed (spec.md §4.8, last paragraph).
//!
//! Grounded on `llm-orchestrator-audit`'s upsert-by-identifier pattern
//! (`AuditLogger`'s `parking_lot`-guarded aggregate updates), adapted to
//! the three aggregate kinds this engine tracks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use tracing::error;

use crate::config::EngineConfig;
use crate::model::{CommonError, CostTracking, HistoryStatus, OptimalContext, Plan, PlanPattern, Task, ToolPerformance};
use crate::repository::Repository;

const COMMON_ERROR_PREFIX_LEN: usize = 200;

/// Runs the full observation pass for a task that has just reached a
/// terminal status. Never propagates an error to the caller; every failure
/// is logged via `tracing::error!` and swallowed.
pub async fn observe(repo: &dyn Repository, config: &EngineConfig, task: &Task, plan: &Plan) {
    if !config.learning_enabled {
        return;
    }

    if let Err(err) = observe_tool_performance(repo, task, plan).await {
        error!(task_id = %task.id, %err, "learning observer: tool performance upsert failed");
    }

    if task.status == crate::model::TaskStatus::Completed {
        if let Err(err) = observe_plan_pattern(repo, task, plan).await {
            error!(task_id = %task.id, %err, "learning observer: plan pattern upsert failed");
        }
    }

    if let Err(err) = observe_cost_tracking(repo, config, task).await {
        error!(task_id = %task.id, %err, "learning observer: cost tracking upsert failed");
    }
}

async fn observe_tool_performance(repo: &dyn Repository, task: &Task, plan: &Plan) -> crate::error::Result<()> {
    // Latest completed-or-failed history entry per step.
    let mut latest_by_step: std::collections::BTreeMap<&str, &crate::model::HistoryEntry> = std::collections::BTreeMap::new();
    for entry in &task.execution_history {
        if matches!(entry.status, HistoryStatus::Completed | HistoryStatus::Failed) {
            latest_by_step.insert(&entry.step_id, entry);
        }
    }

    for (step_id, entry) in latest_by_step {
        let Some(step) = plan.step(step_id) else { continue };
        let tool_name = &step.action;
        let mut perf = repo
            .get_tool_performance(tool_name)
            .await?
            .unwrap_or_else(|| ToolPerformance::new(tool_name.clone()));

        let success = entry.status == HistoryStatus::Completed;
        let duration_ms = entry.duration.map(|d| d.as_millis() as f64).unwrap_or(0.0);
        let retries = *task.retry_count.get(step_id).unwrap_or(&0) as f64;

        let n = perf.total_executions as f64;
        perf.total_executions += 1;
        if success {
            perf.success_count += 1;
        } else {
            perf.failure_count += 1;
        }
        perf.success_rate = perf.success_count as f64 / perf.total_executions as f64;
        perf.avg_duration_ms = (perf.avg_duration_ms * n + duration_ms) / (n + 1.0);
        perf.avg_retries = (perf.avg_retries * n + retries) / (n + 1.0);
        perf.last_updated = Utc::now();

        if success {
            upsert_optimal_context(&mut perf, &task.agent_config_id, duration_ms);
        } else if let Some(err) = &entry.error {
            upsert_common_error(&mut perf, err);
        }

        repo.upsert_tool_performance(perf).await?;
    }

    Ok(())
}

fn upsert_optimal_context(perf: &mut ToolPerformance, context: &str, duration_ms: f64) {
    if let Some(existing) = perf.optimal_contexts.iter_mut().find(|c| c.context == context) {
        let n = existing.usage_count as f64;
        existing.avg_duration_ms = (existing.avg_duration_ms * n + duration_ms) / (n + 1.0);
        existing.usage_count += 1;
        existing.success_rate = 1.0;
    } else {
        perf.optimal_contexts.push(OptimalContext {
            context: context.to_string(),
            success_rate: 1.0,
            avg_duration_ms: duration_ms,
            usage_count: 1,
        });
    }
}

fn upsert_common_error(perf: &mut ToolPerformance, error: &str) {
    let truncated: String = error.chars().take(COMMON_ERROR_PREFIX_LEN).collect();
    if let Some(existing) = perf.common_errors.iter_mut().find(|e| e.error == truncated) {
        existing.frequency += 1;
    } else {
        perf.common_errors.push(CommonError {
            error: truncated,
            frequency: 1,
            percentage: 0.0,
            contexts: Vec::new(),
        });
    }
    let total: u64 = perf.common_errors.iter().map(|e| e.frequency).sum();
    for e in &mut perf.common_errors {
        e.percentage = e.frequency as f64 / total as f64 * 100.0;
    }
}

async fn observe_plan_pattern(repo: &dyn Repository, task: &Task, plan: &Plan) -> crate::error::Result<()> {
    let step_sequence: Vec<String> = plan.steps.iter().map(|s| s.id.clone()).collect();
    let pattern_id = hash_pattern(&plan.goal, &step_sequence);

    let mut pattern = repo.get_plan_pattern(&pattern_id).await?.unwrap_or_else(|| PlanPattern {
        pattern_id: pattern_id.clone(),
        goal_pattern: plan.goal.clone(),
        step_sequence: step_sequence.clone(),
        usage_count: 0,
        success_rate: 0.0,
        avg_execution_time_ms: 0.0,
        last_used: Utc::now(),
    });

    let total_duration_ms: f64 = task
        .execution_history
        .iter()
        .filter_map(|e| e.duration)
        .map(|d| d.as_millis() as f64)
        .sum();

    let n = pattern.usage_count as f64;
    pattern.usage_count += 1;
    pattern.success_rate = (pattern.success_rate * n + 1.0) / (n + 1.0);
    pattern.avg_execution_time_ms = (pattern.avg_execution_time_ms * n + total_duration_ms) / (n + 1.0);
    pattern.last_used = Utc::now();

    repo.upsert_plan_pattern(pattern).await
}

async fn observe_cost_tracking(repo: &dyn Repository, config: &EngineConfig, task: &Task) -> crate::error::Result<()> {
    let history_len = task.execution_history.len() as u64;
    let total_tokens = history_len * config.estimated_tokens_per_history_entry;
    let input_tokens = (total_tokens as f64 * 0.7) as u64;
    let output_tokens = total_tokens - input_tokens;
    let estimated_cost = (input_tokens as f64 / 1000.0) * config.input_cost_per_1k_tokens
        + (output_tokens as f64 / 1000.0) * config.output_cost_per_1k_tokens;

    repo.upsert_cost_tracking(CostTracking {
        task_id: task.id,
        input_tokens,
        output_tokens,
        total_tokens,
        api_calls: history_len,
        estimated_cost,
        timestamp: Utc::now(),
    })
    .await
}

fn hash_pattern(goal_pattern: &str, step_sequence: &[String]) -> String {
    let mut hasher = DefaultHasher::new();
    goal_pattern.hash(&mut hasher);
    step_sequence.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_id_is_a_function_of_its_inputs() {
        let a = hash_pattern("ship an order", &["step1".into(), "step2".into()]);
        let b = hash_pattern("ship an order", &["step1".into(), "step2".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn pattern_id_differs_on_different_sequence() {
        let a = hash_pattern("ship an order", &["step1".into(), "step2".into()]);
        let b = hash_pattern("ship an order", &["step1".into(), "step3".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn common_error_percentages_sum_to_roughly_100() {
        let mut perf = ToolPerformance::new("list_facilities");
        upsert_common_error(&mut perf, "timeout while dialing");
        upsert_common_error(&mut perf, "timeout while dialing");
        upsert_common_error(&mut perf, "validation error: missing field");
        let total: f64 = perf.common_errors.iter().map(|e| e.percentage).sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    struct PanicsIfCalledRepository;

    #[async_trait::async_trait]
    impl Repository for PanicsIfCalledRepository {
        async fn find_task(&self, _task_id: uuid::Uuid) -> crate::error::Result<Option<Task>> {
            unreachable!("observe() must not touch the repository when learning is disabled")
        }
        async fn find_plan(&self, _plan_id: uuid::Uuid) -> crate::error::Result<Option<Plan>> {
            unreachable!()
        }
        async fn update_task_fields(
            &self,
            _task_id: uuid::Uuid,
            _patch: crate::repository::TaskFieldPatch,
            _expected_lock: Option<&str>,
        ) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn append_history(&self, _task_id: uuid::Uuid, _entry: crate::model::HistoryEntry) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn update_step_status(&self, _plan_id: uuid::Uuid, _step_id: &str, _status: crate::model::StepStatus) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn update_task_status(&self, _task_id: uuid::Uuid, _status: crate::model::TaskStatus, _error: Option<String>) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn upsert_tool_performance(&self, _record: ToolPerformance) -> crate::error::Result<()> {
            unreachable!("observe() must not touch the repository when learning is disabled")
        }
        async fn upsert_plan_pattern(&self, _record: PlanPattern) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn upsert_cost_tracking(&self, _record: CostTracking) -> crate::error::Result<()> {
            unreachable!()
        }
        async fn get_tool_performance(&self, _tool_name: &str) -> crate::error::Result<Option<ToolPerformance>> {
            unreachable!()
        }
        async fn get_plan_pattern(&self, _pattern_id: &str) -> crate::error::Result<Option<PlanPattern>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn disabled_config_skips_observation_entirely() {
        let repo = PanicsIfCalledRepository;
        let config = EngineConfig {
            learning_enabled: false,
            ..EngineConfig::default()
        };
        let task = Task::new(uuid::Uuid::new_v4(), "agent-1");
        let plan = Plan {
            id: task.plan_id,
            user_query: "noop".into(),
            goal: "noop".into(),
            steps: vec![],
            missing_data: vec![],
            status: crate::model::PlanStatus::Completed,
        };
        observe(&repo, &config, &task, &plan).await;
    }
}
