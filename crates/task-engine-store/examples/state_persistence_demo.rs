// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demonstrates the optimistic-locked document API this crate exposes:
//! write a document, attempt a conflicting write under a stale expected
//! version, then write it correctly.

use serde_json::json;
use task_engine_store::memory::InMemoryStore;
use task_engine_store::DocumentStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let store = InMemoryStore::new();

    let v1 = store
        .put("tasks", "demo-task", None, json!({"status": "pending"}))
        .await
        .expect("initial put");
    println!("wrote version {v1}");

    match store
        .put("tasks", "demo-task", Some(0), json!({"status": "in_progress"}))
        .await
    {
        Ok(_) => unreachable!("stale expected_version should have been rejected"),
        Err(err) => println!("expected conflict: {err}"),
    }

    let v2 = store
        .put("tasks", "demo-task", Some(v1), json!({"status": "in_progress"}))
        .await
        .expect("put with correct expected version");
    println!("wrote version {v2}");

    let doc = store.get("tasks", "demo-task").await.unwrap().unwrap();
    println!("final document: {}", doc.body);
}
