// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timeout Guard (spec.md §4.3).
//!
//! Thin wrapper over `tokio::time::timeout`, grounded on `executor.rs`'s
//! use of the same primitive around `execute_step_inner`.

use std::future::Future;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Runs `fut` under a `deadline`. On expiry, returns `EngineError::Timeout`
/// rather than the attempt's own result - the step fails this attempt
/// immediately, but the outer retry loop may still spend a further attempt
/// from its budget (spec.md §4.3, Open Question (a)).
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(EngineError::Timeout { duration: deadline }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_when_under_deadline() {
        let result = with_deadline(Duration::from_millis(100), async {
            Ok::<_, EngineError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn times_out_when_over_deadline() {
        let result = with_deadline(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, EngineError>(42)
        })
        .await;
        assert!(matches!(result.unwrap_err(), EngineError::Timeout { .. }));
    }
}
