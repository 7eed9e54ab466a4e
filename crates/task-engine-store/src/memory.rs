// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory reference `DocumentStore`, used by the core crate's own test
//! suite and as a drop-in demo backend.
//!
//! Grounded on `executor.rs`'s use of a flat `DashMap<String, V>` for
//! concurrent in-process state (`step_statuses`, `step_results`):
//! documents live in a single `DashMap` keyed by `(collection, id)`, with
//! the version check performed inside the entry's write lock so two
//! concurrent `put`s to the same key never both "win".

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::{Document, DocumentStore};

type Key = (String, String);

/// An in-process, non-persistent `DocumentStore`. Cheap to construct,
/// suitable for tests and single-process demos.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    docs: DashMap<Key, Document>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let key = (collection.to_string(), id.to_string());
        Ok(self.docs.get(&key).map(|d| d.clone()))
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<i64>,
        body: Value,
    ) -> Result<i64> {
        let key = (collection.to_string(), id.to_string());

        match self.docs.entry(key) {
            Entry::Occupied(mut entry) => {
                let current_version = entry.get().version;
                if let Some(expected) = expected_version {
                    if expected != current_version {
                        return Err(StoreError::VersionConflict {
                            collection: collection.to_string(),
                            id: id.to_string(),
                            expected: Some(expected),
                            actual: current_version,
                        });
                    }
                }
                let new_version = current_version + 1;
                entry.insert(Document {
                    id: id.to_string(),
                    version: new_version,
                    body,
                    updated_at: Utc::now(),
                });
                Ok(new_version)
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = expected_version {
                    if expected != 0 {
                        return Err(StoreError::VersionConflict {
                            collection: collection.to_string(),
                            id: id.to_string(),
                            expected: Some(expected),
                            actual: 0,
                        });
                    }
                }
                entry.insert(Document {
                    id: id.to_string(),
                    version: 1,
                    body,
                    updated_at: Utc::now(),
                });
                Ok(1)
            }
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let key = (collection.to_string(), id.to_string());
        self.docs.remove(&key);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self
            .docs
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| e.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStore::new();
        let version = store.put("tasks", "t1", None, json!({"status": "pending"})).await.unwrap();
        assert_eq!(version, 1);

        let doc = store.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.body["status"], "pending");
    }

    #[tokio::test]
    async fn put_rejects_stale_expected_version() {
        let store = InMemoryStore::new();
        store.put("tasks", "t1", None, json!({"n": 1})).await.unwrap();

        let err = store.put("tasks", "t1", Some(0), json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn put_accepts_matching_expected_version() {
        let store = InMemoryStore::new();
        let v1 = store.put("tasks", "t1", None, json!({"n": 1})).await.unwrap();
        let v2 = store.put("tasks", "t1", Some(v1), json!({"n": 2})).await.unwrap();
        assert_eq!(v2, v1 + 1);
    }

    #[tokio::test]
    async fn initial_put_rejects_nonzero_expected_version() {
        let store = InMemoryStore::new();
        let err = store.put("tasks", "t1", Some(1), json!({"n": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let store = InMemoryStore::new();
        store.put("tasks", "t1", None, json!({"n": 1})).await.unwrap();
        store.delete("tasks", "t1").await.unwrap();
        assert!(store.get("tasks", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_only_documents_in_that_collection() {
        let store = InMemoryStore::new();
        store.put("tasks", "t1", None, json!({"n": 1})).await.unwrap();
        store.put("tasks", "t2", None, json!({"n": 2})).await.unwrap();
        store.put("plans", "p1", None, json!({"n": 3})).await.unwrap();
        let docs = store.list("tasks").await.unwrap();
        assert_eq!(docs.len(), 2);
    }
}
