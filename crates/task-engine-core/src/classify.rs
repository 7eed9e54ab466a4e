// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error Classifier (spec.md §4.2).
//!
//! Categorises a raised tool error by textual/structural inspection and
//! computes exponential backoff with jitter. Grounded on
//! `executor.rs::get_retry_policy`'s multiplier/cap shape and
//! `other_examples/..OpenIntentOS..executor.rs`'s backoff loop.

use std::time::Duration;

use rand::Rng;

/// The three categories spec.md §4.2 names. `Recoverable` is reserved: no
/// producer in this engine's scope raises it (see DESIGN.md Open Question
/// resolution (c)); it is modelled here so the type is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Retryable,
    NonRetryable,
    Recoverable,
}

/// A raw signal a tool can report about one failed call, independent of
/// whatever Rust error type wraps it.
#[derive(Debug, Clone, Default)]
pub struct ToolFailure<'a> {
    pub message: &'a str,
    pub http_status: Option<u16>,
}

/// Categorises a tool failure per spec.md §4.2's trigger table.
pub fn classify(failure: &ToolFailure<'_>) -> Category {
    if let Some(status) = failure.http_status {
        if status == 429 || (500..600).contains(&status) {
            return Category::Retryable;
        }
        if matches!(status, 400 | 401 | 403 | 404) {
            return Category::NonRetryable;
        }
    }

    let lower = failure.message.to_ascii_lowercase();

    let non_retryable_markers = [
        "validation",
        "missing required",
        "not found",
        "invalid",
        "unauthorized",
        "forbidden",
    ];
    if non_retryable_markers.iter().any(|m| lower.contains(m)) {
        return Category::NonRetryable;
    }

    let retryable_markers = ["network", "timeout", "timed out", "connection", "unavailable"];
    if retryable_markers.iter().any(|m| lower.contains(m)) {
        return Category::Retryable;
    }

    // Default per spec.md §4.2.
    Category::Retryable
}

/// `delay(attempt) = min(baseDelay * 2^attempt, 30_000ms)` plus uniform
/// jitter in `[0, 30%)` of that delay.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let scaled = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = scaled.min(cap.as_secs_f64());
    let jitter_fraction = rand::thread_rng().gen_range(0.0..0.30);
    let with_jitter = capped * (1.0 + jitter_fraction);
    Duration::from_secs_f64(with_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_5xx_and_429_are_retryable() {
        for status in [429, 500, 503, 599] {
            let f = ToolFailure {
                message: "",
                http_status: Some(status),
            };
            assert_eq!(classify(&f), Category::Retryable);
        }
    }

    #[test]
    fn http_4xx_are_non_retryable() {
        for status in [400, 401, 403, 404] {
            let f = ToolFailure {
                message: "",
                http_status: Some(status),
            };
            assert_eq!(classify(&f), Category::NonRetryable);
        }
    }

    #[test]
    fn validation_and_not_found_messages_are_non_retryable() {
        let f = ToolFailure {
            message: "validation error: not found",
            http_status: None,
        };
        assert_eq!(classify(&f), Category::NonRetryable);
    }

    #[test]
    fn network_messages_are_retryable() {
        let f = ToolFailure {
            message: "connection reset while dialing upstream",
            http_status: None,
        };
        assert_eq!(classify(&f), Category::Retryable);
    }

    #[test]
    fn unclassified_message_defaults_to_retryable() {
        let f = ToolFailure {
            message: "something odd happened",
            http_status: None,
        };
        assert_eq!(classify(&f), Category::Retryable);
    }

    #[test]
    fn backoff_at_attempt_zero_is_at_least_base() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_millis(30_000);
        let delay = backoff_delay(0, base, cap);
        assert!(delay >= base);
    }

    #[test]
    fn backoff_saturates_at_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_millis(30_000);
        // ceil(log2(30_000/500)) = 6, well past saturation at attempt 10.
        let delay = backoff_delay(10, base, cap);
        assert!(delay.as_secs_f64() >= cap.as_secs_f64());
        assert!(delay.as_secs_f64() <= cap.as_secs_f64() * 1.30 + 0.001);
    }
}
