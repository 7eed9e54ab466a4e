// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error type for document-store operations.
//!
//! Grounded on `llm-orchestrator-audit::storage::StorageError`: one
//! `thiserror` variant per failure class, `#[from]` conversions for the
//! underlying I/O and serialization errors.

use thiserror::Error;

/// Errors a [`crate::DocumentStore`] backend can surface.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// The caller's `expected_version` no longer matches the persisted
    /// document. Mirrors the engine's `lockToken` compare-and-set
    /// discipline, but at the document-store layer it is keyed on a plain
    /// monotonic version counter rather than an opaque token.
    #[error("version conflict on {collection}/{id}: expected {expected:?}, found {actual}")]
    VersionConflict {
        collection: String,
        id: String,
        expected: Option<i64>,
        actual: i64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
