// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ambient engine configuration.
//!
//! Deliberately narrow: no file or environment parsing lives here (that is
//! part of the excluded CLI/config-wrapper layer), but the struct itself is
//! the kind of ambient infrastructure every crate in this lineage carries.

use std::time::Duration;

/// Tunables the Task Executor and Error Classifier draw defaults from when
/// a `Task` doesn't override them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default per-step timeout, used when constructing a new `Task`.
    pub default_timeout: Duration,
    /// Default per-step retry cap, used when constructing a new `Task`.
    pub default_max_retries: u32,
    /// Base delay for the classifier's exponential backoff.
    pub base_backoff: Duration,
    /// Hard cap the backoff saturates at.
    pub max_backoff: Duration,
    /// Whether the Task Executor invokes the Learning Observer on terminal
    /// transitions. Disabling this is useful for tests that only care
    /// about step-execution semantics.
    pub learning_enabled: bool,
    /// Cost heuristic: tokens assumed per history entry when a tool
    /// invocation reports no measured token counts (spec.md §4.8).
    pub estimated_tokens_per_history_entry: u64,
    /// Per-1k-token rate used to derive `CostTracking.estimated_cost`.
    pub input_cost_per_1k_tokens: f64,
    pub output_cost_per_1k_tokens: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            default_max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(30_000),
            learning_enabled: true,
            estimated_tokens_per_history_entry: 100,
            input_cost_per_1k_tokens: 0.003,
            output_cost_per_1k_tokens: 0.015,
        }
    }
}
