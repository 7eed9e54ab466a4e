// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repository seam (spec.md §6). A narrow, network-bound persistence
//! interface; concrete implementations (in-memory, `sqlx`-backed) live in
//! `task-engine-store`, kept out of this crate so the engine never couples
//! to a storage technology.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{CostTracking, HistoryEntry, Plan, PlanPattern, StepStatus, Task, TaskStatus, ToolPerformance};

/// A sparse set of fields to apply to a persisted `Task` in one call,
/// guarded by an optimistic lock when `expected_lock` is `Some`.
///
/// Mirrors spec.md §4.7's "every persistence call is either a targeted
/// field update or a conditional upsert" discipline - no component reads
/// then writes the whole `Task` document.
#[derive(Debug, Clone, Default)]
pub struct TaskFieldPatch {
    pub status: Option<TaskStatus>,
    pub current_step_index: Option<usize>,
    pub step_output: Option<(String, crate::model::StepOutput)>,
    pub user_input: Option<(String, String, Value)>,
    pub retry_count: Option<(String, u32)>,
    pub pending_user_inputs: Option<Vec<crate::model::PendingUserInput>>,
    pub lock_token: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Abstract CRUD + optimistic-locked update over the engine's persisted
/// entities (spec.md §6). Every operation is assumed network-bound.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<Plan>>;

    /// Applies `patch` to the task, rejecting the write if `expected_lock`
    /// is `Some` and no longer matches the persisted `lock_token`.
    async fn update_task_fields(
        &self,
        task_id: Uuid,
        patch: TaskFieldPatch,
        expected_lock: Option<&str>,
    ) -> Result<()>;

    async fn append_history(&self, task_id: Uuid, entry: HistoryEntry) -> Result<()>;

    async fn update_step_status(&self, plan_id: Uuid, step_id: &str, status: StepStatus) -> Result<()>;

    async fn update_task_status(&self, task_id: Uuid, status: TaskStatus, error: Option<String>) -> Result<()>;

    async fn upsert_tool_performance(&self, record: ToolPerformance) -> Result<()>;

    async fn upsert_plan_pattern(&self, record: PlanPattern) -> Result<()>;

    async fn upsert_cost_tracking(&self, record: CostTracking) -> Result<()>;

    async fn get_tool_performance(&self, tool_name: &str) -> Result<Option<ToolPerformance>>;

    async fn get_plan_pattern(&self, pattern_id: &str) -> Result<Option<PlanPattern>>;
}
