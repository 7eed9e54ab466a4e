// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapts `task-engine-store`'s generic `DocumentStore` into this crate's
//! `Repository` trait. Kept behind the `state-persistence` feature so the
//! engine's hard core never requires a storage technology to compile.
//!
//! `task-engine-store` knows nothing about `Task`/`Plan`/etc - it only
//! speaks `(collection, id) -> (version, JSON body)`. This module owns
//! the serialization and the translation from the engine's `lockToken`
//! compare-and-set discipline onto the store's version-counter
//! compare-and-set.

use std::sync::Arc;

use async_trait::async_trait;
use task_engine_store::DocumentStore;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    CostTracking, HistoryEntry, Plan, PlanPattern, StepStatus, Task, TaskStatus, ToolPerformance,
};
use crate::repository::{Repository, TaskFieldPatch};

const TASKS: &str = "tasks";
const PLANS: &str = "plans";
const TOOL_PERFORMANCE: &str = "tool_performance";
const PLAN_PATTERNS: &str = "plan_patterns";
const COST_TRACKING: &str = "cost_tracking";

/// A `Repository` backed by any `task_engine_store::DocumentStore`.
pub struct StoreRepository {
    store: Arc<dyn DocumentStore>,
}

impl StoreRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn load_task(&self, task_id: Uuid) -> Result<(Task, i64)> {
        let doc = self
            .store
            .get(TASKS, &task_id.to_string())
            .await
            .map_err(store_err)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        let task: Task = serde_json::from_value(doc.body)?;
        Ok((task, doc.version))
    }

    async fn save_task(&self, task: &Task, expected_version: i64) -> Result<()> {
        let body = serde_json::to_value(task)?;
        self.store
            .put(TASKS, &task.id.to_string(), Some(expected_version), body)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(err: task_engine_store::StoreError) -> EngineError {
    match err {
        task_engine_store::StoreError::VersionConflict { .. } => EngineError::LockContention,
        other => EngineError::Repository(other.to_string()),
    }
}

#[async_trait]
impl Repository for StoreRepository {
    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        match self.store.get(TASKS, &task_id.to_string()).await.map_err(store_err)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    async fn find_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        match self.store.get(PLANS, &plan_id.to_string()).await.map_err(store_err)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    async fn update_task_fields(
        &self,
        task_id: Uuid,
        patch: TaskFieldPatch,
        expected_lock: Option<&str>,
    ) -> Result<()> {
        let (mut task, version) = self.load_task(task_id).await?;

        if let Some(expected) = expected_lock {
            if task.lock_token.as_deref() != Some(expected) {
                return Err(EngineError::LockContention);
            }
        }

        apply_patch(&mut task, patch);
        self.save_task(&task, version).await
    }

    async fn append_history(&self, task_id: Uuid, entry: HistoryEntry) -> Result<()> {
        let (mut task, version) = self.load_task(task_id).await?;
        task.push_history(entry);
        self.save_task(&task, version).await
    }

    async fn update_step_status(&self, plan_id: Uuid, step_id: &str, status: StepStatus) -> Result<()> {
        let doc = self
            .store
            .get(PLANS, &plan_id.to_string())
            .await
            .map_err(store_err)?
            .ok_or_else(|| EngineError::NotFound(format!("plan {plan_id}")))?;
        let mut plan: Plan = serde_json::from_value(doc.body)?;

        let step = plan
            .step_mut(step_id)
            .ok_or_else(|| EngineError::Dependency(format!("unknown step '{step_id}'")))?;
        step.status = status;

        let body = serde_json::to_value(&plan)?;
        self.store
            .put(PLANS, &plan_id.to_string(), Some(doc.version), body)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_task_status(&self, task_id: Uuid, status: TaskStatus, error: Option<String>) -> Result<()> {
        let (mut task, version) = self.load_task(task_id).await?;
        task.status = status;
        task.error = error;
        self.save_task(&task, version).await
    }

    async fn upsert_tool_performance(&self, record: ToolPerformance) -> Result<()> {
        let existing_version = self
            .store
            .get(TOOL_PERFORMANCE, &record.tool_name)
            .await
            .map_err(store_err)?
            .map(|d| d.version);
        let body = serde_json::to_value(&record)?;
        self.store
            .put(TOOL_PERFORMANCE, &record.tool_name, existing_version, body)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn upsert_plan_pattern(&self, record: PlanPattern) -> Result<()> {
        let existing_version = self
            .store
            .get(PLAN_PATTERNS, &record.pattern_id)
            .await
            .map_err(store_err)?
            .map(|d| d.version);
        let body = serde_json::to_value(&record)?;
        self.store
            .put(PLAN_PATTERNS, &record.pattern_id, existing_version, body)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn upsert_cost_tracking(&self, record: CostTracking) -> Result<()> {
        let id = record.task_id.to_string();
        let existing_version = self.store.get(COST_TRACKING, &id).await.map_err(store_err)?.map(|d| d.version);
        let body = serde_json::to_value(&record)?;
        self.store
            .put(COST_TRACKING, &id, existing_version, body)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_tool_performance(&self, tool_name: &str) -> Result<Option<ToolPerformance>> {
        match self.store.get(TOOL_PERFORMANCE, tool_name).await.map_err(store_err)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }

    async fn get_plan_pattern(&self, pattern_id: &str) -> Result<Option<PlanPattern>> {
        match self.store.get(PLAN_PATTERNS, pattern_id).await.map_err(store_err)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.body)?)),
            None => Ok(None),
        }
    }
}

/// Applies a `TaskFieldPatch` to an in-memory `Task`, mirroring exactly
/// what `task_executor.rs` expects a `Repository::update_task_fields` call
/// to do (spec.md §4.7 "targeted field update" discipline).
fn apply_patch(task: &mut Task, patch: TaskFieldPatch) {
    if let Some(status) = patch.status {
        task.status = status;
    }
    if let Some(idx) = patch.current_step_index {
        task.current_step_index = idx;
    }
    if let Some((step_id, output)) = patch.step_output {
        task.step_outputs.insert(step_id, output);
    }
    if let Some((step_id, field, value)) = patch.user_input {
        task.user_inputs.entry(step_id).or_default().insert(field, value);
    }
    if let Some((step_id, count)) = patch.retry_count {
        task.retry_count.insert(step_id, count);
    }
    if let Some(pending) = patch.pending_user_inputs {
        task.pending_user_inputs = pending;
    }
    if let Some(lock_token) = patch.lock_token {
        task.lock_token = lock_token;
    }
    if let Some(error) = patch.error {
        task.error = error;
    }
    if let Some(observed_at) = patch.observed_at {
        task.observed_at = Some(observed_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlanStatus, StepOutput};
    use std::sync::Arc;
    use task_engine_store::memory::InMemoryStore;

    fn sample_plan(plan_id: Uuid) -> Plan {
        Plan {
            id: plan_id,
            user_query: "ship an order".into(),
            goal: "ship an order".into(),
            steps: vec![crate::model::PlanStep {
                id: "step1".into(),
                order: 1,
                action: "list_facilities".into(),
                parameters: serde_json::json!({}),
                expected_output: "a list of facilities".into(),
                dependencies: vec![],
                status: StepStatus::Pending,
            }],
            missing_data: vec![],
            status: PlanStatus::Pending,
        }
    }

    #[tokio::test]
    async fn round_trips_task_and_plan() {
        let store = Arc::new(InMemoryStore::new());
        let repo = StoreRepository::new(store.clone());

        let plan = sample_plan(Uuid::new_v4());
        let body = serde_json::to_value(&plan).unwrap();
        store.put("plans", &plan.id.to_string(), None, body).await.unwrap();

        let task = Task::new(plan.id, "agent-1");
        let task_body = serde_json::to_value(&task).unwrap();
        store.put("tasks", &task.id.to_string(), None, task_body).await.unwrap();

        let loaded_task = repo.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded_task.id, task.id);

        let loaded_plan = repo.find_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(loaded_plan.id, plan.id);
    }

    #[tokio::test]
    async fn update_task_fields_rejects_lock_mismatch() {
        let store = Arc::new(InMemoryStore::new());
        let repo = StoreRepository::new(store.clone());

        let mut task = Task::new(Uuid::new_v4(), "agent-1");
        task.lock_token = Some("token-a".into());
        let body = serde_json::to_value(&task).unwrap();
        store.put("tasks", &task.id.to_string(), None, body).await.unwrap();

        let patch = TaskFieldPatch {
            status: Some(TaskStatus::InProgress),
            ..Default::default()
        };
        let result = repo.update_task_fields(task.id, patch, Some("token-b")).await;
        assert!(matches!(result, Err(EngineError::LockContention)));
    }

    #[tokio::test]
    async fn update_step_status_persists_to_plan() {
        let store = Arc::new(InMemoryStore::new());
        let repo = StoreRepository::new(store.clone());
        let plan = sample_plan(Uuid::new_v4());
        let body = serde_json::to_value(&plan).unwrap();
        store.put("plans", &plan.id.to_string(), None, body).await.unwrap();

        repo.update_step_status(plan.id, "step1", StepStatus::Completed).await.unwrap();

        let loaded = repo.find_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.step("step1").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn tool_performance_upsert_is_idempotent_on_identifier() {
        let store = Arc::new(InMemoryStore::new());
        let repo = StoreRepository::new(store);

        let mut perf = ToolPerformance::new("list_facilities");
        perf.total_executions = 1;
        repo.upsert_tool_performance(perf.clone()).await.unwrap();

        perf.total_executions = 2;
        repo.upsert_tool_performance(perf).await.unwrap();

        let loaded = repo.get_tool_performance("list_facilities").await.unwrap().unwrap();
        assert_eq!(loaded.total_executions, 2);
    }

    #[tokio::test]
    async fn append_history_appends_without_clobbering_outputs() {
        let store = Arc::new(InMemoryStore::new());
        let repo = StoreRepository::new(store);

        let mut task = Task::new(Uuid::new_v4(), "agent-1");
        task.step_outputs.insert("step1".into(), StepOutput::success(serde_json::json!([1, 2])));
        let body = serde_json::to_value(&task).unwrap();
        repo_put_task(&repo, &task, body).await;

        repo.append_history(task.id, crate::model::HistoryEntry {
            step_id: "step1".into(),
            timestamp: chrono::Utc::now(),
            status: crate::model::HistoryStatus::Started,
            duration: None,
            error: None,
            output: None,
        })
        .await
        .unwrap();

        let loaded = repo.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_history.len(), 1);
        assert!(loaded.step_outputs.contains_key("step1"));
    }

    async fn repo_put_task(repo: &StoreRepository, task: &Task, body: serde_json::Value) {
        repo.store.put("tasks", &task.id.to_string(), None, body).await.unwrap();
    }
}
