// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted entities: `Plan`, `Task`, and the learning-signal aggregates.
//!
//! Mirrors `executor.rs`'s `StepStatus`/`StepResult` shape (serde derive,
//! explicit duration (de)serialization) but generalised to the full
//! spec.md §3 data model.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A frozen, structured recipe of ordered, dependency-linked steps.
///
/// Immutable once created; the engine only ever writes per-step `status`
/// fields via [`crate::repository::Repository::update_step_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub user_query: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub missing_data: Vec<MissingDataSpec>,
    /// Mirrors the owning task's outcome; not written independently.
    pub status: PlanStatus,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// One node of a [`Plan`]; maps to one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable within the plan.
    pub id: String,
    /// Positive, gap-free after topological sort within tie groups.
    pub order: u32,
    /// The tool name this step invokes.
    pub action: String,
    /// Arbitrarily nested map whose leaves are scalars or one of the two
    /// sentinel strings.
    pub parameters: Value,
    pub expected_output: String,
    /// Must form a DAG: every id here must name a step in the same plan.
    pub dependencies: Vec<String>,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// An entry in `Plan.missingData`: a field the planner could not fill in,
/// to be supplied later via `{{PROMPT_USER}}` or `{{GENERATE}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingDataSpec {
    pub step_id: String,
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub description: String,
}

/// The declared or inferred type of a field a `{{GENERATE}}` sentinel
/// stands in for (spec.md §4.6 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Id,
    Timestamp,
    String,
    Number,
    Boolean,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A mutable execution record for one attempt to fulfil a [`Plan`]. Owned
/// exclusively by the holder of `lock_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub agent_config_id: String,
    pub status: TaskStatus,
    /// Index into the topologically sorted sequence of the plan's steps.
    pub current_step_index: usize,
    /// Step id -> normalised output envelope.
    pub step_outputs: BTreeMap<String, StepOutput>,
    /// Step id -> (dotted field path -> supplied value).
    pub user_inputs: BTreeMap<String, BTreeMap<String, Value>>,
    /// Step id -> attempts made beyond the first.
    pub retry_count: BTreeMap<String, u32>,
    pub pending_user_inputs: Vec<PendingUserInput>,
    pub execution_history: Vec<HistoryEntry>,
    /// Per-step wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// Per-step retry cap.
    pub max_retries: u32,
    /// Present iff some runner holds the execution lock.
    pub lock_token: Option<String>,
    /// Terminal-failure message.
    pub error: Option<String>,
    /// Set once the Learning Observer has run for this task, so a repeat
    /// `ExecuteTask` call on an already-terminal task cannot trigger a
    /// second observation (spec.md §8 idempotence law).
    pub observed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(plan_id: Uuid, agent_config_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            agent_config_id: agent_config_id.into(),
            status: TaskStatus::Pending,
            current_step_index: 0,
            step_outputs: BTreeMap::new(),
            user_inputs: BTreeMap::new(),
            retry_count: BTreeMap::new(),
            pending_user_inputs: Vec::new(),
            execution_history: Vec::new(),
            timeout_ms: 30_000,
            max_retries: 3,
            lock_token: None,
            error: None,
            observed_at: None,
        }
    }

    /// The only way execution history grows: append-only, per spec.md §3
    /// invariant (e).
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.execution_history.push(entry);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Invariant (a): `status = paused` iff `pendingUserInputs` is
    /// non-empty.
    pub fn invariant_paused_matches_pending(&self) -> bool {
        (self.status == TaskStatus::Paused) == !self.pending_user_inputs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Normalised output envelope for a completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub output: Value,
    pub error: Option<String>,
}

impl StepOutput {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            error: None,
        }
    }
}

/// An entry awaiting resolution via `{{PROMPT_USER}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUserInput {
    pub step_id: String,
    pub field: String,
    pub description: Option<String>,
}

/// One append-only entry in `Task.executionHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration",
        deserialize_with = "deserialize_opt_duration"
    )]
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

fn serialize_opt_duration<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis: Option<u64> = Option::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

// ---------------------------------------------------------------------------
// Learning signals
// ---------------------------------------------------------------------------

/// One record per tool name, updated by the Learning Observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPerformance {
    pub tool_name: String,
    pub total_executions: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_retries: f64,
    pub optimal_contexts: Vec<OptimalContext>,
    pub common_errors: Vec<CommonError>,
    pub last_updated: DateTime<Utc>,
}

impl ToolPerformance {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            total_executions: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            avg_retries: 0.0,
            optimal_contexts: Vec::new(),
            common_errors: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimalContext {
    pub context: String,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonError {
    /// Truncated to 200 chars; the matching key used to merge entries.
    pub error: String,
    pub frequency: u64,
    pub percentage: f64,
    pub contexts: Vec<String>,
}

/// Content-addressed by `pattern_id = hash(goal_pattern, step_sequence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPattern {
    pub pattern_id: String,
    pub goal_pattern: String,
    pub step_sequence: Vec<String>,
    pub usage_count: u64,
    pub success_rate: f64,
    pub avg_execution_time_ms: f64,
    pub last_used: DateTime<Utc>,
}

/// Per-task cost estimate, upserted by the Learning Observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTracking {
    pub task_id: Uuid,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub api_calls: u64,
    pub estimated_cost: f64,
    pub timestamp: DateTime<Utc>,
}
