// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference `Repository` backends for the task execution engine.
//!
//! This crate owns no business logic — it is a narrow, generic document
//! store (`collection`, `id`, `version`, `body`) with optimistic-locked
//! upserts, matching the shape the teacher workspace's own (source-less)
//! `llm-orchestrator-state` crate declared in its `Cargo.toml`
//! (`sqlx` with `runtime-tokio-rustls`, `postgres`, `sqlite`, `uuid`,
//! `chrono`, `json`). `task-engine-core`'s `store_adapter` module (behind
//! its `state-persistence` feature) maps its typed entities onto this
//! generic document API, so this crate never depends back on
//! `task-engine-core`.

pub mod error;
pub mod memory;
pub mod postgres_store;
pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use error::{Result, StoreError};

/// One row of the generic `(collection, id) -> body` document model.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub body: Value,
    pub updated_at: DateTime<Utc>,
}

/// Abstract, optimistic-locked key-value document store.
///
/// `collection` namespaces documents (`"tasks"`, `"plans"`,
/// `"tool_performance"`, `"plan_patterns"`, `"cost_tracking"` in this
/// workspace); `id` is unique within a collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Upserts `body` at `(collection, id)`. If `expected_version` is
    /// `Some`, the write is rejected with [`StoreError::VersionConflict`]
    /// unless it matches the persisted version (absence of a prior
    /// document counts as version `0`). Returns the new version.
    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<i64>,
        body: Value,
    ) -> Result<i64>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Lists every document in a collection. Used only by the reference
    /// in-memory/demo paths and administrative tooling — the engine's own
    /// access patterns are always point lookups by id.
    async fn list(&self, collection: &str) -> Result<Vec<Document>>;
}
