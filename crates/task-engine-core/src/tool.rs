// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! External seams the engine consumes but never implements itself
//! (spec.md §6): tool dispatch and LLM-backed value generation.
//!
//! Shaped after `providers.rs`'s `LLMProvider` async trait - a single
//! `async fn` seam with a typed request/response pair, implemented
//! externally and injected by composition root.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::FieldType;

/// What a tool reported back for one call, before the Step Executor
/// normalises it into a `StepOutput` (spec.md §4.6 step 7).
///
/// Kept distinct from `Result<Value>` because a tool-reported error is not
/// a Rust-level failure to invoke the tool - the call itself succeeded in
/// transport terms, it is the tool's own business-logic outcome that was
/// negative. The Step Executor classifies and acts on that distinction.
#[derive(Debug, Clone)]
pub enum ToolCallOutcome {
    /// The tool ran and returned a payload. May itself be a JSON-encoded
    /// MCP-style envelope; normalisation happens downstream.
    Payload(Value),
    /// The tool signalled a business-logic error: `{isError: true,
    /// content: [{text}]}`. `message` is the concatenated `text` content.
    Error { message: String, http_status: Option<u16> },
}

/// Dispatches a named action to a local handler or a registered
/// remote-execution tool. The single composition seam for tool dispatch -
/// no process-wide tool registry lives inside the engine (spec.md §9).
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invokes `name` with `args`. A `NonRetryable` `EngineError` result
    /// means the tool call could not even be dispatched (unknown action,
    /// no remote fallback registered) - distinct from `ToolCallOutcome::Error`,
    /// which means the tool ran and reported failure.
    async fn call(&self, name: &str, args: Value) -> Result<ToolCallOutcome>;
}

/// Fills in a `{{GENERATE}}` sentinel with an LLM-produced scalar
/// (spec.md §4.6 step 5).
#[async_trait]
pub trait ValueGenerator: Send + Sync {
    async fn generate(
        &self,
        field: &str,
        field_type: FieldType,
        step_context: &Value,
        agent_config_id: &str,
    ) -> Result<Value>;
}

/// Infers a `{{GENERATE}}` field's type from its name when `Plan.missingData`
/// carries no declared type for it (spec.md §4.6 step 5 fallback rule).
pub fn infer_field_type(field_name: &str) -> FieldType {
    let lower = field_name.to_ascii_lowercase();
    if lower.contains("id") {
        FieldType::Id
    } else if lower.contains("timestamp") || lower.contains("time") || lower.contains("date") {
        FieldType::Timestamp
    } else {
        FieldType::String
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_id_fields() {
        assert_eq!(infer_field_type("facilityId"), FieldType::Id);
        assert_eq!(infer_field_type("id"), FieldType::Id);
    }

    #[test]
    fn infers_timestamp_fields() {
        assert_eq!(infer_field_type("createdAt_timestamp"), FieldType::Timestamp);
        assert_eq!(infer_field_type("dueDate"), FieldType::Timestamp);
        assert_eq!(infer_field_type("startTime"), FieldType::Timestamp);
    }

    #[test]
    fn falls_back_to_string() {
        assert_eq!(infer_field_type("source"), FieldType::String);
    }
}
