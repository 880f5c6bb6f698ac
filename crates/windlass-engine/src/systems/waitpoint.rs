// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waitpoints: named completion conditions runs block on.
//!
//! Completing a waitpoint never touches blocked runs directly; it enqueues
//! one `ContinueRunIfUnblocked` job per blocked run, deduplicated per run, so
//! concurrent completions of a run's last blockers coalesce into a single
//! continuation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::jobs::JobPayload;
use crate::persistence::{
    ExecutionStatus, RunStatus, SnapshotRecord, TaskRunRecord, WaitpointKind, WaitpointRecord,
    WaitpointStatus,
};
use crate::queue::resume_score;
use crate::systems::snapshot::{SnapshotSystem, SnapshotTransition};
use crate::systems::{EngineResources, new_id};

/// Waitpoint creation, blocking and completion.
#[derive(Clone)]
pub struct WaitpointSystem {
    res: Arc<EngineResources>,
}

impl WaitpointSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    fn snapshots(&self) -> SnapshotSystem {
        SnapshotSystem::new(self.res.clone())
    }

    /// Create a waitpoint that auto-completes at `scheduled_for`.
    #[instrument(skip(self))]
    pub async fn create_datetime_waitpoint(
        &self,
        environment_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<WaitpointRecord> {
        let waitpoint = WaitpointRecord {
            id: new_id("wp"),
            kind: WaitpointKind::DateTime.as_str().to_string(),
            status: WaitpointStatus::Pending.as_str().to_string(),
            environment_id: environment_id.to_string(),
            completed_by_run_id: None,
            idempotency_key: None,
            scheduled_for: Some(scheduled_for),
            output: None,
            output_is_error: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.res.persistence.create_waitpoint(&waitpoint).await?;

        let payload = JobPayload::CompleteDateTimeWaitpoint {
            waitpoint_id: waitpoint.id.clone(),
        };
        self.res
            .persistence
            .enqueue_job(
                payload.dedup_key().as_deref(),
                &serde_json::to_string(&payload)?,
                scheduled_for,
            )
            .await?;

        debug!(waitpoint_id = %waitpoint.id, %scheduled_for, "Created datetime waitpoint");
        Ok(waitpoint)
    }

    /// Create a manually-completed waitpoint.
    ///
    /// With an idempotency key, a still-pending waitpoint carrying the same
    /// key in the environment is returned instead; the boolean is true when
    /// an existing waitpoint was reused.
    #[instrument(skip(self))]
    pub async fn create_manual_waitpoint(
        &self,
        environment_id: &str,
        idempotency_key: Option<String>,
    ) -> Result<(WaitpointRecord, bool)> {
        if let Some(key) = &idempotency_key
            && let Some(existing) = self
                .res
                .persistence
                .find_manual_waitpoint_by_key(environment_id, key)
                .await?
        {
            return Ok((existing, true));
        }

        let waitpoint = WaitpointRecord {
            id: new_id("wp"),
            kind: WaitpointKind::Manual.as_str().to_string(),
            status: WaitpointStatus::Pending.as_str().to_string(),
            environment_id: environment_id.to_string(),
            completed_by_run_id: None,
            idempotency_key,
            scheduled_for: None,
            output: None,
            output_is_error: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.res.persistence.create_waitpoint(&waitpoint).await?;
        Ok((waitpoint, false))
    }

    /// Fetch a waitpoint, failing if it does not exist.
    pub async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<WaitpointRecord> {
        self.res
            .persistence
            .get_waitpoint(waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::WaitpointNotFound {
                waitpoint_id: waitpoint_id.to_string(),
            })
    }

    /// Block an executing run on the given waitpoints.
    ///
    /// The run transitions to `EXECUTING_WITH_WAITPOINTS`. With
    /// `release_concurrency`, its concurrency slots are freed while it is
    /// blocked so other runs can proceed. If every waitpoint has already
    /// completed, a continuation is enqueued immediately.
    #[instrument(skip(self, waitpoint_ids), fields(run_id = %run_id))]
    pub async fn block_run_with_waitpoints(
        &self,
        run_id: &str,
        snapshot_id: &str,
        waitpoint_ids: Vec<String>,
        release_concurrency: bool,
    ) -> Result<SnapshotRecord> {
        if waitpoint_ids.is_empty() {
            return Err(EngineError::ValidationError {
                field: "waitpoint_ids".to_string(),
                message: "at least one waitpoint is required".to_string(),
            });
        }

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
                if !matches!(
                    status,
                    ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints
                ) {
                    return Err(EngineError::InvalidStateTransition {
                        run_id: run_id.clone(),
                        status: status.as_str().to_string(),
                        operation: "blockRunWithWaitpoints".to_string(),
                    });
                }

                let run = this.get_run(&run_id).await?;
                this.res
                    .persistence
                    .add_run_blockers(&run_id, &waitpoint_ids)
                    .await?;

                guard.ensure_held()?;
                if release_concurrency {
                    this.res.queue.release_concurrency(&run).await?;
                }
                let snapshot = snapshots
                    .transition_locked(SnapshotTransition::new(
                        &run,
                        ExecutionStatus::ExecutingWithWaitpoints,
                        RunStatus::Waiting,
                        format!("Blocked on {} waitpoint(s)", waitpoint_ids.len()),
                    ))
                    .await?;

                // All blockers may have completed between creation and this
                // join; the continuation job is the single recovery path.
                if this.res.persistence.pending_blocker_count(&run_id).await? == 0 {
                    this.enqueue_continuation(&run_id).await?;
                }

                Ok(snapshot)
            })
            .await
    }

    /// Complete a waitpoint and fan continuation jobs out to blocked runs.
    ///
    /// Idempotent: completing an already-completed waitpoint is a no-op and
    /// the original output wins.
    #[instrument(skip(self, output), fields(waitpoint_id = %waitpoint_id))]
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: &str,
        output: Option<String>,
        output_is_error: bool,
    ) -> Result<()> {
        let completed = self
            .res
            .persistence
            .complete_waitpoint_once(waitpoint_id, output.as_deref(), output_is_error, Utc::now())
            .await?;
        if !completed {
            debug!("Waitpoint already completed, ignoring");
            return Ok(());
        }

        self.res.events.publish(EngineEvent::WaitpointCompleted {
            waitpoint_id: waitpoint_id.to_string(),
        });

        let blocked = self.res.persistence.blocked_run_ids(waitpoint_id).await?;
        for run_id in &blocked {
            self.enqueue_continuation(run_id).await?;
        }
        info!(blocked_runs = blocked.len(), "Waitpoint completed");
        Ok(())
    }

    /// Job handler: continue a run if all of its blockers have completed.
    ///
    /// Blocked-but-executing runs resume in place; suspended runs are
    /// requeued ahead of fresh work. Redeliveries and runs that still have
    /// pending blockers are no-ops.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn handle_continue_run_if_unblocked(&self, run_id: &str) -> Result<()> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let snapshots = this.snapshots();
                if !snapshots.is_unblocked(&run_id).await? {
                    debug!("Run still has pending blockers");
                    return Ok(());
                }

                let latest = snapshots.latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;
                let run = this.get_run(&run_id).await?;

                guard.ensure_held()?;
                match status {
                    ExecutionStatus::ExecutingWithWaitpoints => {
                        let completed = snapshots.take_completed_blockers(&run_id).await?;
                        let ids = completed.iter().map(|w| w.id.clone()).collect();
                        this.res.queue.reacquire_concurrency(&run).await?;
                        snapshots
                            .transition_locked(SnapshotTransition {
                                completed_waitpoint_ids: ids,
                                ..SnapshotTransition::new(
                                    &run,
                                    ExecutionStatus::Executing,
                                    RunStatus::Executing,
                                    "Unblocked, resuming execution",
                                )
                            })
                            .await?;
                        this.res.events.publish(EngineEvent::RunReadyToContinue {
                            run_id: run.id.clone(),
                        });
                        Ok(())
                    }
                    ExecutionStatus::Suspended => {
                        // Resumes outrank fresh work; blockers stay joined so
                        // the dequeue forwards their outputs.
                        this.res.queue.enqueue(&run, resume_score(&run)).await?;
                        snapshots
                            .transition_locked(SnapshotTransition::new(
                                &run,
                                ExecutionStatus::QueuedExecuting,
                                RunStatus::Pending,
                                "Unblocked, requeued for resume",
                            ))
                            .await?;
                        this.res.events.publish(EngineEvent::RunReadyToContinue {
                            run_id: run.id.clone(),
                        });
                        Ok(())
                    }
                    _ => {
                        debug!(status = status.as_str(), "Run not blocked, nothing to continue");
                        Ok(())
                    }
                }
            })
            .await
    }

    async fn enqueue_continuation(&self, run_id: &str) -> Result<()> {
        let payload = JobPayload::ContinueRunIfUnblocked {
            run_id: run_id.to_string(),
        };
        self.res
            .persistence
            .enqueue_job(
                payload.dedup_key().as_deref(),
                &serde_json::to_string(&payload)?,
                Utc::now(),
            )
            .await
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
