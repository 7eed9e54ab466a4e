// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed `DocumentStore`.
//!
//! Grounded on `llm-orchestrator-audit::database::DatabaseAuditStorage`'s
//! shape (pool construction, `migrate`, query-per-method with
//! `map_err(|e| StorageError::Database(..))`), adapted to `sqlx`'s SQLite
//! driver and a single generic `documents` table rather than a
//! domain-specific one.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::{Document, DocumentStore};

/// A `sqlx`-backed `DocumentStore` over SQLite. Suitable for single-node
/// deployments and local development; `PostgresStore` is the
/// multi-writer-safe counterpart.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT version, body, updated_at FROM documents WHERE collection = ?1 AND id = ?2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let body_text: String = row.try_get("body").map_err(|e| StoreError::Database(e.to_string()))?;
                let body: Value = serde_json::from_str(&body_text)?;
                Ok(Some(Document {
                    id: id.to_string(),
                    version: row.try_get("version").map_err(|e| StoreError::Database(e.to_string()))?,
                    body,
                    updated_at: row
                        .try_get("updated_at")
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<i64>,
        body: Value,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM documents WHERE collection = ?1 AND id = ?2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_version = current.unwrap_or(0);
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
        let body_text = serde_json::to_string(&body)?;
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, version, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, id) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(new_version)
        .bind(&body_text)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(new_version)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT id, version, body, updated_at FROM documents WHERE collection = ?1")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?;
                let body_text: String = row.try_get("body").map_err(|e| StoreError::Database(e.to_string()))?;
                let body: Value = serde_json::from_str(&body_text)?;
                Ok(Document {
                    id,
                    version: row.try_get("version").map_err(|e| StoreError::Database(e.to_string()))?,
                    body,
                    updated_at: row
                        .try_get("updated_at")
                        .map_err(|e| StoreError::Database(e.to_string()))?,
                })
            })
            .collect()
    }
}
