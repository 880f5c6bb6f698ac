// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution snapshot system: the run state machine, heartbeat tracking and
//! stall recovery.
//!
//! Snapshots are append-only; the latest snapshot (highest sequence) is the
//! run's authoritative state. Every status that can stall arms a
//! heartbeat-timeout job on transition; a heartbeat re-arms it, and a
//! transition to a non-heartbeating status cancels it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::jobs::{JobPayload, heartbeat_dedup_key};
use crate::persistence::{
    ExecutionStatus, RunStatus, SnapshotRecord, TaskRunRecord, WaitpointStatus,
};
use crate::systems::attempt::AttemptSystem;
use crate::systems::{EngineResources, completed_waitpoint, new_id};
use crate::types::{EnvironmentType, RunExecutionData};

/// Inputs for one state transition.
pub struct SnapshotTransition<'a> {
    /// The run transitioning.
    pub run: &'a TaskRunRecord,
    /// The new execution status.
    pub execution_status: ExecutionStatus,
    /// The new mirrored run status.
    pub run_status: RunStatus,
    /// Human-readable description of the transition.
    pub description: String,
    /// Worker process driving the transition, if any.
    pub worker_id: Option<String>,
    /// Runner instance, if any.
    pub runner_id: Option<String>,
    /// Checkpoint recorded with a `SUSPENDED` transition.
    pub checkpoint_id: Option<String>,
    /// Completed waitpoint ids forwarded to the resuming executor.
    pub completed_waitpoint_ids: Vec<String>,
}

impl<'a> SnapshotTransition<'a> {
    /// A transition with no worker, runner, checkpoint or forwarded
    /// waitpoints.
    pub fn new(
        run: &'a TaskRunRecord,
        execution_status: ExecutionStatus,
        run_status: RunStatus,
        description: impl Into<String>,
    ) -> Self {
        Self {
            run,
            execution_status,
            run_status,
            description: description.into(),
            worker_id: None,
            runner_id: None,
            checkpoint_id: None,
            completed_waitpoint_ids: Vec::new(),
        }
    }
}

/// The run state machine.
#[derive(Clone)]
pub struct SnapshotSystem {
    res: Arc<EngineResources>,
}

impl SnapshotSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    /// Build (without persisting) the initial snapshot written in the same
    /// transaction as the run itself.
    pub(crate) fn initial_snapshot(
        run: &TaskRunRecord,
        execution_status: ExecutionStatus,
        run_status: RunStatus,
        description: &str,
    ) -> SnapshotRecord {
        SnapshotRecord {
            id: new_id("snap"),
            run_id: run.id.clone(),
            seq: 0,
            execution_status: execution_status.as_str().to_string(),
            run_status: run_status.as_str().to_string(),
            environment_id: run.environment_id.clone(),
            environment_type: run.environment_type.clone(),
            description: description.to_string(),
            worker_id: None,
            runner_id: None,
            checkpoint_id: None,
            completed_waitpoint_ids: "[]".to_string(),
            created_at: Utc::now(),
        }
    }

    /// Append a snapshot, mirror the run status, and arm or cancel the
    /// heartbeat timer for the new status. Caller holds the run lock.
    pub(crate) async fn transition_locked(
        &self,
        t: SnapshotTransition<'_>,
    ) -> Result<SnapshotRecord> {
        let record = SnapshotRecord {
            id: new_id("snap"),
            run_id: t.run.id.clone(),
            seq: 0,
            execution_status: t.execution_status.as_str().to_string(),
            run_status: t.run_status.as_str().to_string(),
            environment_id: t.run.environment_id.clone(),
            environment_type: t.run.environment_type.clone(),
            description: t.description.clone(),
            worker_id: t.worker_id,
            runner_id: t.runner_id,
            checkpoint_id: t.checkpoint_id,
            completed_waitpoint_ids: serde_json::to_string(&t.completed_waitpoint_ids)?,
            created_at: Utc::now(),
        };

        let created = self.res.persistence.create_snapshot(&record).await?;
        self.res
            .persistence
            .update_run_status(&t.run.id, t.run_status.as_str())
            .await?;

        if t.execution_status.expects_heartbeat() {
            self.arm_heartbeat(&t.run.id, &created.id, t.execution_status)
                .await?;
        } else {
            self.res
                .persistence
                .cancel_job(&heartbeat_dedup_key(&t.run.id))
                .await?;
        }

        debug!(
            run_id = %t.run.id,
            snapshot_id = %created.id,
            status = t.execution_status.as_str(),
            description = %t.description,
            "Created execution snapshot"
        );
        Ok(created)
    }

    /// The run's latest snapshot, or [`EngineError::SnapshotNotFound`].
    pub async fn latest(&self, run_id: &str) -> Result<SnapshotRecord> {
        self.res
            .persistence
            .latest_snapshot(run_id)
            .await?
            .ok_or_else(|| EngineError::SnapshotNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Parse a snapshot's execution status string.
    pub(crate) fn status_of(snapshot: &SnapshotRecord) -> Result<ExecutionStatus> {
        ExecutionStatus::parse(&snapshot.execution_status).ok_or_else(|| {
            EngineError::CorruptRecord {
                entity: "snapshot".to_string(),
                details: format!(
                    "unknown execution status '{}' on snapshot '{}'",
                    snapshot.execution_status, snapshot.id
                ),
            }
        })
    }

    /// Reject an operation presented with a snapshot id that is not latest.
    pub(crate) fn require_latest(
        latest: &SnapshotRecord,
        presented_snapshot_id: &str,
    ) -> Result<()> {
        if latest.id != presented_snapshot_id {
            return Err(EngineError::StaleSnapshot {
                run_id: latest.run_id.clone(),
                presented: presented_snapshot_id.to_string(),
                latest: latest.id.clone(),
            });
        }
        Ok(())
    }

    /// Record a heartbeat for the given snapshot.
    ///
    /// A heartbeat for a superseded snapshot is a successful no-op: the
    /// worker is simply behind and will learn its fate from the next call.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn heartbeat_run(&self, run_id: &str, snapshot_id: &str) -> Result<()> {
        let latest = self.latest(run_id).await?;
        if latest.id != snapshot_id {
            debug!(snapshot_id, latest = %latest.id, "Heartbeat for superseded snapshot ignored");
            return Ok(());
        }

        let status = Self::status_of(&latest)?;
        if !status.expects_heartbeat() {
            debug!(status = %latest.execution_status, "Heartbeat in non-heartbeating status ignored");
            return Ok(());
        }

        self.arm_heartbeat(run_id, snapshot_id, status).await
    }

    async fn arm_heartbeat(
        &self,
        run_id: &str,
        snapshot_id: &str,
        status: ExecutionStatus,
    ) -> Result<()> {
        let timeout = self.heartbeat_timeout(status);
        let payload = JobPayload::HeartbeatTimeout {
            run_id: run_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
        };
        let run_at = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default();
        self.res
            .persistence
            .enqueue_job(
                payload.dedup_key().as_deref(),
                &serde_json::to_string(&payload)?,
                run_at,
            )
            .await
    }

    fn heartbeat_timeout(&self, status: ExecutionStatus) -> Duration {
        let config = &self.res.config;
        match status {
            ExecutionStatus::PendingExecuting => config.heartbeat_timeout_pending_executing,
            ExecutionStatus::Executing => config.heartbeat_timeout_executing,
            ExecutionStatus::ExecutingWithWaitpoints => {
                config.heartbeat_timeout_executing_with_waitpoints
            }
            ExecutionStatus::PendingCancel => config.heartbeat_timeout_pending_cancel,
            _ => config.heartbeat_timeout_executing,
        }
    }

    /// Stall recovery: the heartbeat deadline for `snapshot_id` passed
    /// without a heartbeat.
    ///
    /// Runs under the run lock and re-reads the latest snapshot first; a
    /// timer for a superseded snapshot is acknowledged and dropped.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn handle_heartbeat_timeout(&self, run_id: &str, snapshot_id: &str) -> Result<()> {
        let res = self.res.clone();
        let this = self.clone();
        let run_id_owned = run_id.to_string();
        let snapshot_id = snapshot_id.to_string();

        res.lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let latest = this.latest(&run_id).await?;
                if latest.id != snapshot_id {
                    debug!(snapshot_id, latest = %latest.id, "Stale heartbeat timer dropped");
                    return Ok(());
                }

                let run = this
                    .res
                    .persistence
                    .get_run(&run_id)
                    .await?
                    .ok_or_else(|| EngineError::RunNotFound {
                        run_id: run_id.clone(),
                    })?;
                let status = Self::status_of(&latest)?;
                let attempt = AttemptSystem::new(this.res.clone());

                warn!(status = status.as_str(), "Run missed heartbeat deadline");

                // Dev workers are interactive; there is no infra to recover
                // the run, so a stall always finalizes it.
                if run.environment_type == EnvironmentType::Development.as_str() {
                    guard.ensure_held()?;
                    attempt
                        .finish_run_locked(
                            &run,
                            RunStatus::Canceled,
                            None,
                            Some("Run canceled: development worker stopped responding"),
                        )
                        .await?;
                    return Ok(());
                }

                match status {
                    ExecutionStatus::PendingExecuting => {
                        guard.ensure_held()?;
                        attempt.try_nack_and_requeue_locked(&run).await?;
                    }
                    ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints => {
                        guard.ensure_held()?;
                        attempt.fail_stalled_attempt_locked(&run).await?;
                    }
                    ExecutionStatus::PendingCancel => {
                        guard.ensure_held()?;
                        info!("Cancellation acknowledgement timed out, force-finalizing");
                        attempt
                            .finish_run_locked(
                                &run,
                                RunStatus::Canceled,
                                None,
                                Some("Run canceled: worker did not acknowledge cancellation"),
                            )
                            .await?;
                    }
                    other => {
                        error!(
                            status = other.as_str(),
                            "Heartbeat timer fired for a status that never heartbeats"
                        );
                        return Err(EngineError::InvalidStateTransition {
                            run_id: run.id.clone(),
                            status: other.as_str().to_string(),
                            operation: "handleHeartbeatTimeout".to_string(),
                        });
                    }
                }
                Ok(())
            })
            .await
    }

    /// Everything a worker needs to know about a run's current state.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_run_execution_data(&self, run_id: &str) -> Result<RunExecutionData> {
        let run = self
            .res
            .persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let snapshot = self.latest(run_id).await?;
        let completed = self.res.persistence.completed_blockers(run_id).await?;

        Ok(RunExecutionData {
            max_duration_seconds: run.max_duration_seconds,
            completed_waitpoints: completed.iter().map(completed_waitpoint).collect(),
            snapshot,
            run,
        })
    }

    /// Snapshots created after `snapshot_id`, oldest first.
    pub async fn get_snapshots_since(
        &self,
        run_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<SnapshotRecord>> {
        self.res
            .persistence
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| EngineError::SnapshotNotFound {
                run_id: run_id.to_string(),
            })?;
        self.res
            .persistence
            .snapshots_since(run_id, snapshot_id)
            .await
    }

    /// Whether a run's blocking waitpoints are all completed.
    pub(crate) async fn is_unblocked(&self, run_id: &str) -> Result<bool> {
        Ok(self.res.persistence.pending_blocker_count(run_id).await? == 0)
    }

    /// Collect and clear the run's completed blockers, returning what should
    /// be forwarded on the next snapshot.
    pub(crate) async fn take_completed_blockers(
        &self,
        run_id: &str,
    ) -> Result<Vec<crate::persistence::WaitpointRecord>> {
        let completed = self.res.persistence.completed_blockers(run_id).await?;
        debug_assert!(
            completed
                .iter()
                .all(|w| w.status == WaitpointStatus::Completed.as_str())
        );
        self.res.persistence.clear_blockers(run_id).await?;
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::testkit::{seed_run as seeded_run, test_resources};

    #[tokio::test]
    async fn test_transition_appends_and_latest_resolves() {
        let (res, _) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        let first = system.latest(&run.id).await.unwrap();
        let second = system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::PendingExecuting,
                RunStatus::Dequeued,
                "Dequeued",
            ))
            .await
            .unwrap();

        assert!(second.seq > first.seq);
        assert_eq!(system.latest(&run.id).await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_heartbeating_transition_arms_timer() {
        let (res, mock) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Executing,
                RunStatus::Executing,
                "Attempt started",
            ))
            .await
            .unwrap();

        let jobs = mock.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dedup_key.as_deref(), Some("heartbeat:run_1"));
    }

    #[tokio::test]
    async fn test_non_heartbeating_transition_cancels_timer() {
        let (res, mock) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Executing,
                RunStatus::Executing,
                "Attempt started",
            ))
            .await
            .unwrap();
        system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Suspended,
                RunStatus::Waiting,
                "Checkpointed",
            ))
            .await
            .unwrap();

        assert!(mock.all_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_for_superseded_snapshot_is_noop() {
        let (res, mock) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        let old = system.latest(&run.id).await.unwrap();
        system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Executing,
                RunStatus::Executing,
                "Attempt started",
            ))
            .await
            .unwrap();
        let armed = mock.all_jobs()[0].run_at;

        system.heartbeat_run(&run.id, &old.id).await.unwrap();
        // Timer untouched by the stale heartbeat
        assert_eq!(mock.all_jobs()[0].run_at, armed);
    }

    #[tokio::test]
    async fn test_heartbeat_rearms_timer() {
        let (res, mock) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        let snapshot = system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Executing,
                RunStatus::Executing,
                "Attempt started",
            ))
            .await
            .unwrap();
        let armed = mock.all_jobs()[0].run_at;

        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        system.heartbeat_run(&run.id, &snapshot.id).await.unwrap();

        let jobs = mock.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].run_at > armed);
    }

    #[tokio::test]
    async fn test_timeout_for_superseded_snapshot_dropped() {
        let (res, _) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        let old = system.latest(&run.id).await.unwrap();
        system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::Executing,
                RunStatus::Executing,
                "Attempt started",
            ))
            .await
            .unwrap();

        // Must not touch the run
        system.handle_heartbeat_timeout(&run.id, &old.id).await.unwrap();
        let latest = system.latest(&run.id).await.unwrap();
        assert_eq!(latest.execution_status, "EXECUTING");
    }

    #[tokio::test]
    async fn test_timeout_in_non_heartbeating_status_raises() {
        let (res, _) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;
        let latest = system.latest(&run.id).await.unwrap();

        let result = system.handle_heartbeat_timeout(&run.id, &latest.id).await;
        assert!(matches!(
            result,
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_snapshot_guard() {
        let (res, _) = test_resources();
        let system = SnapshotSystem::new(res.clone());
        let run = seeded_run(&res, "run_1", ExecutionStatus::Queued, RunStatus::Pending).await;

        let old = system.latest(&run.id).await.unwrap();
        let new = system
            .transition_locked(SnapshotTransition::new(
                &run,
                ExecutionStatus::PendingExecuting,
                RunStatus::Dequeued,
                "Dequeued",
            ))
            .await
            .unwrap();

        assert!(SnapshotSystem::require_latest(&new, &new.id).is_ok());
        assert!(matches!(
            SnapshotSystem::require_latest(&new, &old.id),
            Err(EngineError::StaleSnapshot { .. })
        ));
    }
}
