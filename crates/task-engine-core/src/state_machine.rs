// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task status state machine and lock-token contract (spec.md §4.4).

use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::TaskStatus;

/// Validates a `Task` status transition against spec.md §4.4's table:
///
/// ```text
/// pending     -> in_progress | failed | cancelled
/// in_progress -> completed   | failed | paused | cancelled
/// paused      -> in_progress | failed | cancelled
/// failed      -> in_progress | cancelled   (retry)
/// completed, cancelled -> (terminal)
/// ```
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    use TaskStatus::*;

    let allowed = matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Failed)
            | (Pending, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Paused)
            | (InProgress, Cancelled)
            | (Paused, InProgress)
            | (Paused, Failed)
            | (Paused, Cancelled)
            | (Failed, InProgress)
            | (Failed, Cancelled)
    );

    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        })
    }
}

/// A freshly minted lock token, handed out on successful acquisition.
///
/// Acquisition itself is a compare-and-set against the persisted task
/// (`Repository::update_task_fields` with `expected_lock = None`) that
/// atomically sets `status = in_progress` and `lock_token = fresh` only if
/// the current lock is empty; this module only mints the token and decides
/// legality, the repository enforces the actual compare-and-set.
pub fn mint_lock_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn pending_can_start_pause_fail_cancel() {
        assert!(validate_transition(Pending, InProgress).is_ok());
        assert!(validate_transition(Pending, Failed).is_ok());
        assert!(validate_transition(Pending, Cancelled).is_ok());
        assert!(validate_transition(Pending, Paused).is_err());
        assert!(validate_transition(Pending, Completed).is_err());
    }

    #[test]
    fn in_progress_covers_all_live_outcomes() {
        for to in [Completed, Failed, Paused, Cancelled] {
            assert!(validate_transition(InProgress, to).is_ok());
        }
        assert!(validate_transition(InProgress, Pending).is_err());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for to in [Pending, InProgress, Paused, Completed, Failed, Cancelled] {
            assert!(validate_transition(Completed, to).is_err());
            assert!(validate_transition(Cancelled, to).is_err());
        }
    }

    #[test]
    fn failed_can_be_retried_or_cancelled_only() {
        assert!(validate_transition(Failed, InProgress).is_ok());
        assert!(validate_transition(Failed, Cancelled).is_ok());
        assert!(validate_transition(Failed, Completed).is_err());
        assert!(validate_transition(Failed, Paused).is_err());
    }

    #[test]
    fn lock_tokens_are_unique() {
        assert_ne!(mint_lock_token(), mint_lock_token());
    }
}
