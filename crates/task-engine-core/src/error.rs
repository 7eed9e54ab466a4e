// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the task execution engine.

use std::time::Duration;

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The engine's error taxonomy (spec.md §7).
///
/// Each variant maps to exactly one category in the error classifier
/// (`classify::Category`); variants that are always non-retryable carry no
/// further classification step, they are non-retryable by construction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unresolvable template reference, or traversal over a missing
    /// intermediate key. Non-retryable; task transitions to `failed`.
    #[error("template resolution failed for step '{step_id}': {reason}")]
    Template { step_id: String, reason: String },

    /// A cycle in the step dependency graph, or a reference to an unknown
    /// step id. Non-retryable; task transitions to `failed`.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// A tool error classified as retryable (network/timeout/connection,
    /// HTTP 429/5xx, or the classifier's default).
    #[error("retryable tool error: {0}")]
    ToolRetryable(String),

    /// A tool error classified as non-retryable (validation, not-found,
    /// HTTP 400/401/403/404).
    #[error("non-retryable tool error: {0}")]
    ToolNonRetryable(String),

    /// The per-step deadline expired on this attempt. Treated as
    /// non-retryable for the attempt it interrupts; the outer retry loop
    /// may still spend a further attempt from the step's budget.
    #[error("step timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The task's lock was already held by another runner at acquisition
    /// time. Surfaced to the caller; task state is unchanged.
    #[error("task is already running under another lock")]
    LockContention,

    /// A learning-observer failure. Always logged and swallowed by the
    /// caller; never surfaces as a task failure. Exists as a variant so
    /// observer internals have something to propagate with `?` before the
    /// call site discards it.
    #[error("learning observer failed: {0}")]
    Observer(String),

    /// No task (or plan) exists with the given id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested state transition is not permitted from the task's
    /// current status.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    /// The repository backend itself failed (connection, I/O, optimistic
    /// lock conflict surfaced as an error rather than a retry signal).
    /// Distinct from `Observer`: this means the engine could not execute
    /// at all, not that secondary analytics are unreliable.
    #[error("repository error: {0}")]
    Repository(String),

    /// `ResumeTask` was called against a task that isn't currently paused,
    /// or its inputs didn't cover every field in `pendingUserInputs`.
    #[error("invalid resume: {0}")]
    InvalidResume(String),

    /// Serialization/deserialization failure (e.g. a tool payload that
    /// claims to be JSON but isn't).
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all for conditions that don't fit a more specific variant
    /// (e.g. a requested tool has no registered invoker at all).
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error, on its own (without consulting the classifier),
    /// is unconditionally non-retryable. Used by the task executor's retry
    /// loop to short-circuit before calling into `classify`.
    pub fn is_unconditionally_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::Template { .. }
                | EngineError::Dependency(_)
                | EngineError::ToolNonRetryable(_)
                | EngineError::Timeout { .. }
                | EngineError::InvalidTransition { .. }
                | EngineError::InvalidResume(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
