// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpoints: suspending blocked runs so they stop consuming compute.
//!
//! The engine stores only an opaque location for the externally-produced
//! image. A suspended run resumes through the queue (see the waitpoint
//! system) or directly via [`CheckpointSystem::continue_run_execution`] when
//! the worker kept the process alive.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::error::{EngineError, Result};
use crate::persistence::{
    CheckpointRecord, ExecutionStatus, RunStatus, SnapshotRecord, TaskRunRecord,
};
use crate::systems::snapshot::{SnapshotSystem, SnapshotTransition};
use crate::systems::{EngineResources, new_id};
use crate::types::CheckpointOutcome;

/// Checkpoint creation and resume-in-place.
#[derive(Clone)]
pub struct CheckpointSystem {
    res: Arc<EngineResources>,
}

impl CheckpointSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    fn snapshots(&self) -> SnapshotSystem {
        SnapshotSystem::new(self.res.clone())
    }

    /// Record a checkpoint for a blocked run and suspend it.
    ///
    /// Only a run in `EXECUTING_WITH_WAITPOINTS` can suspend. A run already
    /// pending cancellation gets [`CheckpointOutcome::CancelRequested`] and
    /// the checkpoint is discarded. A checkpoint presented against a
    /// superseded snapshot is rejected, so a run that was unblocked while
    /// the image was being produced keeps executing.
    #[instrument(skip(self, location), fields(run_id = %run_id))]
    pub async fn create_checkpoint(
        &self,
        run_id: &str,
        snapshot_id: &str,
        location: String,
        reason: Option<String>,
    ) -> Result<CheckpointOutcome> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();
        let snapshot_id = snapshot_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let snapshots = this.snapshots();
                let latest = snapshots.latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;

                if status == ExecutionStatus::PendingCancel {
                    debug!("Checkpoint discarded, run is pending cancellation");
                    return Ok(CheckpointOutcome::CancelRequested);
                }

                SnapshotSystem::require_latest(&latest, &snapshot_id)?;
                if status != ExecutionStatus::ExecutingWithWaitpoints {
                    return Err(EngineError::InvalidStateTransition {
                        run_id: run_id.clone(),
                        status: status.as_str().to_string(),
                        operation: "createCheckpoint".to_string(),
                    });
                }

                let run = this.get_run(&run_id).await?;
                let checkpoint = CheckpointRecord {
                    id: new_id("ckpt"),
                    run_id: run_id.clone(),
                    snapshot_id: latest.id.clone(),
                    location,
                    reason,
                    created_at: Utc::now(),
                };
                this.res.persistence.create_checkpoint(&checkpoint).await?;

                guard.ensure_held()?;
                this.res.queue.release_concurrency(&run).await?;
                let snapshot = snapshots
                    .transition_locked(SnapshotTransition {
                        checkpoint_id: Some(checkpoint.id.clone()),
                        ..SnapshotTransition::new(
                            &run,
                            ExecutionStatus::Suspended,
                            RunStatus::Waiting,
                            "Checkpointed and suspended",
                        )
                    })
                    .await?;

                info!(checkpoint_id = %checkpoint.id, "Run suspended on checkpoint");
                Ok(CheckpointOutcome::Suspended { snapshot })
            })
            .await
    }

    /// Resume a run whose worker kept the process alive.
    ///
    /// From `SUSPENDED`, the run moves straight to `PENDING_EXECUTING` with
    /// its completed blockers forwarded, skipping the queue; its concurrency
    /// slots are reacquired. From `PENDING_EXECUTING`, this is a redelivery
    /// no-op returning the latest snapshot.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn continue_run_execution(
        &self,
        run_id: &str,
        snapshot_id: &str,
    ) -> Result<SnapshotRecord> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();
        let snapshot_id = snapshot_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let snapshots = this.snapshots();
                let latest = snapshots.latest(&run_id).await?;
                SnapshotSystem::require_latest(&latest, &snapshot_id)?;

                let status = SnapshotSystem::status_of(&latest)?;
                match status {
                    ExecutionStatus::PendingExecuting => Ok(latest),
                    ExecutionStatus::Suspended => {
                        let run = this.get_run(&run_id).await?;
                        let completed = snapshots.take_completed_blockers(&run_id).await?;
                        let ids = completed.iter().map(|w| w.id.clone()).collect();

                        guard.ensure_held()?;
                        this.res.queue.reacquire_concurrency(&run).await?;
                        snapshots
                            .transition_locked(SnapshotTransition {
                                completed_waitpoint_ids: ids,
                                ..SnapshotTransition::new(
                                    &run,
                                    ExecutionStatus::PendingExecuting,
                                    RunStatus::Dequeued,
                                    "Resumed in place from checkpoint",
                                )
                            })
                            .await
                    }
                    other => Err(EngineError::InvalidStateTransition {
                        run_id: run_id.clone(),
                        status: other.as_str().to_string(),
                        operation: "continueRunExecution".to_string(),
                    }),
                }
            })
            .await
    }

    /// Fetch a checkpoint, failing if it does not exist.
    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointRecord> {
        self.res
            .persistence
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    async fn get_run(&self, run_id: &str) -> Result<TaskRunRecord> {
        self.res
            .persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::testkit::{seed_run, test_resources};

    #[tokio::test]
    async fn test_checkpoint_suspends_blocked_run() {
        let (res, _) = test_resources();
        let system = CheckpointSystem::new(res.clone());
        let run = seed_run(
            &res,
            "run_1",
            ExecutionStatus::ExecutingWithWaitpoints,
            RunStatus::Waiting,
        )
        .await;
        res.queue.reacquire_concurrency(&run).await.unwrap();
        let latest = SnapshotSystem::new(res.clone()).latest(&run.id).await.unwrap();

        let outcome = system
            .create_checkpoint(&run.id, &latest.id, "img://cold-storage/1".to_string(), None)
            .await
            .unwrap();

        let snapshot = match outcome {
            CheckpointOutcome::Suspended { snapshot } => snapshot,
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(snapshot.execution_status, "SUSPENDED");
        let checkpoint_id = snapshot.checkpoint_id.unwrap();
        let checkpoint = system.get_checkpoint(&checkpoint_id).await.unwrap();
        assert_eq!(checkpoint.location, "img://cold-storage/1");
        assert_eq!(checkpoint.snapshot_id, latest.id);

        let (current, _) = res.queue.env_concurrency("env_1", 10).await.unwrap();
        assert_eq!(current, 0);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_rejected() {
        let (res, _) = test_resources();
        let system = CheckpointSystem::new(res.clone());
        let run = seed_run(
            &res,
            "run_1",
            ExecutionStatus::ExecutingWithWaitpoints,
            RunStatus::Waiting,
        )
        .await;

        let result = system
            .create_checkpoint(&run.id, "snap_stale", "img://x".to_string(), None)
            .await;
        assert!(matches!(result, Err(EngineError::StaleSnapshot { .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_during_pending_cancel_is_discarded() {
        let (res, _) = test_resources();
        let system = CheckpointSystem::new(res.clone());
        let run = seed_run(
            &res,
            "run_1",
            ExecutionStatus::PendingCancel,
            RunStatus::Executing,
        )
        .await;
        let latest = SnapshotSystem::new(res.clone()).latest(&run.id).await.unwrap();

        let outcome = system
            .create_checkpoint(&run.id, &latest.id, "img://x".to_string(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, CheckpointOutcome::CancelRequested));
    }

    #[tokio::test]
    async fn test_checkpoint_rejected_while_unblocked() {
        let (res, _) = test_resources();
        let system = CheckpointSystem::new(res.clone());
        let run = seed_run(&res, "run_1", ExecutionStatus::Executing, RunStatus::Executing).await;
        let latest = SnapshotSystem::new(res.clone()).latest(&run.id).await.unwrap();

        let result = system
            .create_checkpoint(&run.id, &latest.id, "img://x".to_string(), None)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_continue_from_suspended_forwards_blockers() {
        let (res, _) = test_resources();
        let system = CheckpointSystem::new(res.clone());
        let run = seed_run(&res, "run_1", ExecutionStatus::Suspended, RunStatus::Waiting).await;

        let wp = crate::systems::waitpoint::WaitpointSystem::new(res.clone());
        let (waitpoint, _) = wp.create_manual_waitpoint("env_1", None).await.unwrap();
        res.persistence
            .add_run_blockers(&run.id, std::slice::from_ref(&waitpoint.id))
            .await
            .unwrap();
        wp.complete_waitpoint(&waitpoint.id, Some("out".to_string()), false)
            .await
            .unwrap();

        let latest = SnapshotSystem::new(res.clone()).latest(&run.id).await.unwrap();
        let snapshot = system.continue_run_execution(&run.id, &latest.id).await.unwrap();

        assert_eq!(snapshot.execution_status, "PENDING_EXECUTING");
        let ids: Vec<String> = serde_json::from_str(&snapshot.completed_waitpoint_ids).unwrap();
        assert_eq!(ids, vec![waitpoint.id]);

        let (current, _) = res.queue.env_concurrency("env_1", 10).await.unwrap();
        assert_eq!(current, 1);
    }
}
