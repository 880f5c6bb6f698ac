// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for windlass-engine integration tests.
//!
//! Provides a TestContext wiring a real SQLite database (in a temp
//! directory) and an in-memory key-value store behind a RunEngine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use windlass_engine::config::EngineConfig;
use windlass_engine::engine::RunEngine;
use windlass_engine::persistence::{Persistence, SqlitePersistence, TaskRunRecord};
use windlass_engine::types::{
    EnvironmentType, RuntimeEnvironment, TriggerRequest, TriggerResult,
};
use windlass_keyval::{KeyValueStore, MemoryStore};

/// Test context holding the engine and direct handles to its backends.
pub struct TestContext {
    pub engine: RunEngine,
    pub persistence: Arc<SqlitePersistence>,
    pub store: Arc<MemoryStore>,
    _tmp: TempDir,
}

impl TestContext {
    /// Create a context over a fresh SQLite database.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Create a context with a customized configuration.
    pub async fn with_config(config: EngineConfig) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let db_path = tmp.path().join("windlass-test.db");
        let persistence = Arc::new(
            SqlitePersistence::from_path(&db_path)
                .await
                .expect("sqlite persistence"),
        );
        let store = Arc::new(MemoryStore::new());
        let engine = RunEngine::new(
            persistence.clone() as Arc<dyn Persistence>,
            store.clone() as Arc<dyn KeyValueStore>,
            config,
        );
        Self {
            engine,
            persistence,
            store,
            _tmp: tmp,
        }
    }

    /// Fetch a run directly from the database.
    pub async fn run(&self, run_id: &str) -> TaskRunRecord {
        self.persistence
            .get_run(run_id)
            .await
            .expect("get_run")
            .expect("run exists")
    }
}

/// A configuration tuned for tests: deterministic fairness and fast lock
/// timeouts.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        database_url: "sqlite::memory:".to_string(),
        lock_acquire_timeout: Duration::from_millis(500),
        snapshot_reuse_count: 0,
        max_dequeues: 3,
        retry_base_delay: Duration::from_millis(50),
        retry_max_delay: Duration::from_millis(400),
        ..EngineConfig::default()
    }
}

/// A development environment record.
pub fn dev_environment(id: &str) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id: id.to_string(),
        organization_id: "org_test".to_string(),
        project_id: "proj_test".to_string(),
        env_type: EnvironmentType::Development,
        concurrency_limit: None,
    }
}

/// A deployed environment record.
pub fn deployed_environment(id: &str) -> RuntimeEnvironment {
    RuntimeEnvironment {
        env_type: EnvironmentType::Deployed,
        ..dev_environment(id)
    }
}

/// A minimal trigger request for the given environment.
pub fn trigger_request(friendly_id: &str, environment: RuntimeEnvironment) -> TriggerRequest {
    TriggerRequest {
        friendly_id: friendly_id.to_string(),
        environment,
        task_identifier: "send-email".to_string(),
        queue_name: "default".to_string(),
        payload: "{\"to\":\"user@example.com\"}".to_string(),
        payload_type: "application/json".to_string(),
        priority_ms: 0,
        concurrency_key: None,
        idempotency_key: None,
        idempotency_key_expires_at: None,
        max_attempts: None,
        max_duration_seconds: None,
        machine_preset: None,
        delay_until: None,
        ttl_expires_at: None,
        parent_run_id: None,
        root_run_id: None,
        resume_parent_on_completion: false,
        batch_id: None,
        schedule_id: None,
        deployed_version: None,
    }
}

/// Unwrap a trigger result into the created run, panicking on a duplicate.
pub fn unwrap_triggered(result: TriggerResult) -> TaskRunRecord {
    match result {
        TriggerResult::Triggered(run) => *run,
        other => panic!("expected a new run, got {other:?}"),
    }
}

/// A timestamp `ms` milliseconds in the past.
pub fn past(ms: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::milliseconds(ms)
}

/// A timestamp `ms` milliseconds in the future.
pub fn future(ms: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ms)
}
