// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service objects implementing the engine's subsystems.
//!
//! Every system holds the same [`EngineResources`] behind an `Arc`, so
//! systems can construct one another cheaply when a flow crosses subsystem
//! boundaries (e.g. stall recovery driving the attempt system).
//!
//! Locking discipline: public operations acquire the run lock and then call
//! `pub(crate)` `*_locked` methods. `*_locked` methods assume the caller
//! holds the lock for every run they touch; the lock is not reentrant.

pub mod attempt;
pub mod batch;
pub mod checkpoint;
pub mod schedule;
pub mod snapshot;
pub mod waitpoint;

use std::sync::Arc;

use uuid::Uuid;
use windlass_keyval::KeyValueStore;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::lock::RunLockService;
use crate::persistence::{Persistence, WaitpointRecord};
use crate::queue::{RunQueue, fair::FairQueueSelector};
use crate::types::CompletedWaitpoint;

/// Dependencies shared by every system, wired once by the engine.
pub struct EngineResources {
    /// Relational storage.
    pub persistence: Arc<dyn Persistence>,
    /// Shared low-latency store.
    pub store: Arc<dyn KeyValueStore>,
    /// Queue operations.
    pub queue: RunQueue,
    /// Fair queue selection.
    pub selector: FairQueueSelector,
    /// Distributed run locks.
    pub lock: RunLockService,
    /// In-process event bus.
    pub events: EventBus,
    /// Engine configuration.
    pub config: EngineConfig,
}

/// A prefixed unique id, e.g. `run_0192af…`.
pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

pub(crate) fn completed_waitpoint(record: &WaitpointRecord) -> CompletedWaitpoint {
    CompletedWaitpoint {
        id: record.id.clone(),
        output: record.output.clone(),
        output_is_error: record.output_is_error,
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::persistence::mock::{MockPersistence, sample_run};
    use crate::persistence::{ExecutionStatus, RunStatus, TaskRunRecord};
    use crate::queue::fair::FairQueueConfig;
    use crate::systems::snapshot::SnapshotSystem;
    use windlass_keyval::MemoryStore;

    /// Create a run with an initial snapshot and run waitpoint in the mock.
    pub(crate) async fn seed_run(
        res: &Arc<EngineResources>,
        id: &str,
        execution_status: ExecutionStatus,
        run_status: RunStatus,
    ) -> TaskRunRecord {
        let mut run = sample_run(id, "env_1");
        run.status = run_status.as_str().to_string();
        let snapshot =
            SnapshotSystem::initial_snapshot(&run, execution_status, run_status, "seed");
        let waitpoint = WaitpointRecord {
            id: run.associated_waitpoint_id.clone(),
            kind: "RUN".to_string(),
            status: "PENDING".to_string(),
            environment_id: run.environment_id.clone(),
            completed_by_run_id: Some(run.id.clone()),
            idempotency_key: None,
            scheduled_for: None,
            output: None,
            output_is_error: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        res.persistence
            .create_run_with_snapshot(&run, &snapshot, &waitpoint)
            .await
            .unwrap();
        run
    }

    /// Resources over mock persistence and an in-memory store, for unit
    /// tests. The mock is returned separately for direct assertions.
    pub(crate) fn test_resources() -> (Arc<EngineResources>, Arc<MockPersistence>) {
        let persistence = Arc::new(MockPersistence::new());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            database_url: "sqlite::memory:".to_string(),
            ..EngineConfig::default()
        };
        let resources = EngineResources {
            persistence: persistence.clone(),
            store: store.clone(),
            queue: RunQueue::new(store.clone()),
            selector: FairQueueSelector::with_seed(
                store.clone(),
                FairQueueConfig {
                    parent_queue_limit: config.parent_queue_limit,
                    queue_age_randomization: config.queue_age_randomization,
                    max_env_count: config.max_env_count,
                    snapshot_reuse_count: 0,
                    default_env_concurrency_limit: config.default_env_concurrency_limit,
                },
                1,
            ),
            lock: RunLockService::new(
                store,
                Duration::from_secs(5),
                Duration::from_millis(500),
            ),
            events: EventBus::default(),
            config,
        };
        (Arc::new(resources), persistence)
    }
}
