// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run attempt lifecycle: start, complete, retry, cancel and nack/requeue.
//!
//! At-most-one-active-attempt is enforced by requiring callers to present
//! the latest snapshot id on start and complete; a stale id is rejected
//! before any state is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::jobs::JobPayload;
use crate::persistence::{ExecutionStatus, RunStatus, SnapshotRecord, TaskRunRecord};
use crate::queue::queue_score;
use crate::systems::EngineResources;
use crate::systems::snapshot::{SnapshotSystem, SnapshotTransition};
use crate::systems::waitpoint::WaitpointSystem;
use crate::types::{AttemptCompletion, AttemptDecision, EnvironmentType};

/// Orchestrates individual execution attempts.
#[derive(Clone)]
pub struct AttemptSystem {
    res: Arc<EngineResources>,
}

impl AttemptSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    fn snapshots(&self) -> SnapshotSystem {
        SnapshotSystem::new(self.res.clone())
    }

    /// Claim the run for execution.
    ///
    /// The caller must present the latest snapshot id (the one handed out by
    /// dequeue); the run must be in `PENDING_EXECUTING`. Increments the
    /// attempt counter and transitions to `EXECUTING`.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn start_run_attempt(
        &self,
        run_id: &str,
        snapshot_id: &str,
        worker_id: Option<String>,
        runner_id: Option<String>,
    ) -> Result<(TaskRunRecord, SnapshotRecord)> {
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
                if status != ExecutionStatus::PendingExecuting {
                    return Err(EngineError::InvalidStateTransition {
                        run_id: run_id.clone(),
                        status: status.as_str().to_string(),
                        operation: "startRunAttempt".to_string(),
                    });
                }

                let mut run = this.get_run(&run_id).await?;
                let attempt = this.res.persistence.increment_attempt_number(&run_id).await?;
                run.attempt_number = attempt;

                guard.ensure_held()?;
                let snapshot = snapshots
                    .transition_locked(SnapshotTransition {
                        worker_id,
                        runner_id,
                        ..SnapshotTransition::new(
                            &run,
                            ExecutionStatus::Executing,
                            RunStatus::Executing,
                            format!("Attempt {attempt} started"),
                        )
                    })
                    .await?;

                info!(attempt, "Run attempt started");
                Ok((run, snapshot))
            })
            .await
    }

    /// Record the outcome of an attempt and decide what happens next.
    #[instrument(skip(self, completion), fields(run_id = %run_id))]
    pub async fn complete_run_attempt(
        &self,
        run_id: &str,
        snapshot_id: &str,
        completion: AttemptCompletion,
    ) -> Result<AttemptDecision> {
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
                let run = this.get_run(&run_id).await?;

                guard.ensure_held()?;
                match status {
                    ExecutionStatus::PendingCancel => {
                        this.finish_run_locked(&run, RunStatus::Canceled, None, None)
                            .await?;
                        Ok(AttemptDecision::RunPendingCancel)
                    }
                    ExecutionStatus::Executing | ExecutionStatus::ExecutingWithWaitpoints => {
                        this.decide_completion_locked(&run, completion).await
                    }
                    other => Err(EngineError::InvalidStateTransition {
                        run_id: run.id.clone(),
                        status: other.as_str().to_string(),
                        operation: "completeRunAttempt".to_string(),
                    }),
                }
            })
            .await
    }

    async fn decide_completion_locked(
        &self,
        run: &TaskRunRecord,
        completion: AttemptCompletion,
    ) -> Result<AttemptDecision> {
        match completion {
            AttemptCompletion::Success { output } => {
                self.finish_run_locked(run, RunStatus::Completed, output.as_deref(), None)
                    .await?;
                Ok(AttemptDecision::RunFinished)
            }
            AttemptCompletion::Failure { error, retriable } => {
                if !retriable || run.attempt_number >= run.max_attempts {
                    self.finish_run_locked(run, RunStatus::Failed, None, Some(&error))
                        .await?;
                    return Ok(AttemptDecision::RunFinished);
                }

                // Dev workers stay attached; requeueing through the shared
                // queue would just hand the run back to the same process.
                if run.environment_type == EnvironmentType::Development.as_str() {
                    self.snapshots()
                        .transition_locked(SnapshotTransition::new(
                            run,
                            ExecutionStatus::PendingExecuting,
                            RunStatus::Dequeued,
                            format!("Attempt {} failed, retrying in place", run.attempt_number),
                        ))
                        .await?;
                    return Ok(AttemptDecision::RetryImmediately);
                }

                self.retry_queued_locked(
                    run,
                    &format!("Attempt {} failed, requeued with backoff", run.attempt_number),
                )
                .await?;
                Ok(AttemptDecision::RetryQueued)
            }
        }
    }

    /// Cancel a run.
    ///
    /// In-flight runs are flipped to `PENDING_CANCEL` and the executor is
    /// notified; runs not currently executing are finalized immediately.
    /// Cancelling a finished run is a no-op.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &str, reason: Option<String>) -> Result<SnapshotRecord> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let snapshots = this.snapshots();
                let latest = snapshots.latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;
                let run = this.get_run(&run_id).await?;

                match status {
                    ExecutionStatus::Finished => {
                        debug!("Cancel requested for a finished run, ignored");
                        Ok(latest)
                    }
                    ExecutionStatus::PendingCancel => Ok(latest),
                    ExecutionStatus::Executing
                    | ExecutionStatus::ExecutingWithWaitpoints
                    | ExecutionStatus::PendingExecuting => {
                        guard.ensure_held()?;
                        let run_status = RunStatus::parse(&latest.run_status)
                            .unwrap_or(RunStatus::Executing);
                        let snapshot = snapshots
                            .transition_locked(SnapshotTransition::new(
                                &run,
                                ExecutionStatus::PendingCancel,
                                run_status,
                                "Cancellation requested",
                            ))
                            .await?;
                        this.res.events.publish(EngineEvent::CancelRequested {
                            run_id: run.id.clone(),
                        });
                        Ok(snapshot)
                    }
                    // Not executing anywhere: cancel takes effect immediately
                    _ => {
                        guard.ensure_held()?;
                        this.res.queue.remove(&run).await?;
                        this.finish_run_locked(
                            &run,
                            RunStatus::Canceled,
                            None,
                            reason.as_deref(),
                        )
                        .await
                    }
                }
            })
            .await
    }

    /// Finalize a run: terminal snapshot, queue and concurrency cleanup,
    /// run waitpoint completion and batch bookkeeping. Caller holds the
    /// run lock.
    pub(crate) async fn finish_run_locked(
        &self,
        run: &TaskRunRecord,
        status: RunStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<SnapshotRecord> {
        debug_assert!(status.is_final());
        let now = Utc::now();

        let snapshot = self
            .snapshots()
            .transition_locked(SnapshotTransition::new(
                run,
                ExecutionStatus::Finished,
                status,
                format!("Run finished with status {}", status.as_str()),
            ))
            .await?;

        self.res
            .persistence
            .finalize_run(&run.id, status.as_str(), output, error, now)
            .await?;

        self.res.queue.remove(run).await?;
        self.res.queue.release_concurrency(run).await?;
        self.res.persistence.cancel_job(&format!("ttl:{}", run.id)).await?;
        self.res
            .persistence
            .cancel_job(&format!("delay:{}", run.id))
            .await?;

        // Unblock anything waiting on this run.
        let waitpoints = WaitpointSystem::new(self.res.clone());
        let waitpoint_output = output.or(error);
        waitpoints
            .complete_waitpoint(
                &run.associated_waitpoint_id,
                waitpoint_output.map(str::to_string),
                status != RunStatus::Completed,
            )
            .await?;

        if let Some(batch_id) = &run.batch_id {
            let payload = JobPayload::TryCompleteBatch {
                batch_id: batch_id.clone(),
            };
            self.res
                .persistence
                .enqueue_job(
                    payload.dedup_key().as_deref(),
                    &serde_json::to_string(&payload)?,
                    now,
                )
                .await?;
        }

        self.res.events.publish(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            status: status.as_str().to_string(),
        });
        info!(run_id = %run.id, status = status.as_str(), "Run finished");
        Ok(snapshot)
    }

    /// Push a run back onto its queue after a failed delivery (stall in
    /// `PENDING_EXECUTING`). Exhausting the nack budget fails the run with a
    /// terminal internal error. Caller holds the run lock.
    pub(crate) async fn try_nack_and_requeue_locked(&self, run: &TaskRunRecord) -> Result<bool> {
        let requeued = self
            .res
            .queue
            .nack(run, queue_score(run), self.res.config.max_dequeues)
            .await?;

        if !requeued {
            warn!(run_id = %run.id, "Delivery attempts exhausted, failing run");
            self.finish_run_locked(
                run,
                RunStatus::SystemFailure,
                None,
                Some("Run could not be delivered to a worker"),
            )
            .await?;
            return Ok(false);
        }

        self.snapshots()
            .transition_locked(SnapshotTransition::new(
                run,
                ExecutionStatus::Queued,
                RunStatus::Pending,
                "Delivery failed, requeued",
            ))
            .await?;
        Ok(true)
    }

    /// Force-fail an attempt that stalled mid-execution and requeue if
    /// attempts remain. Caller holds the run lock.
    pub(crate) async fn fail_stalled_attempt_locked(&self, run: &TaskRunRecord) -> Result<()> {
        if run.attempt_number >= run.max_attempts {
            self.finish_run_locked(
                run,
                RunStatus::Crashed,
                None,
                Some("Run stalled: no heartbeat received within the deadline"),
            )
            .await?;
            return Ok(());
        }

        self.retry_queued_locked(
            run,
            &format!("Attempt {} stalled, requeued with backoff", run.attempt_number),
        )
        .await
    }

    /// Requeue for a retry: future-dated score so the run becomes claimable
    /// only after the backoff delay. Caller holds the run lock.
    async fn retry_queued_locked(&self, run: &TaskRunRecord, description: &str) -> Result<()> {
        let delay = self.backoff_delay(run.attempt_number);
        let score = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.res.queue.release_concurrency(run).await?;
        self.res.queue.enqueue(run, score).await?;
        self.snapshots()
            .transition_locked(SnapshotTransition::new(
                run,
                ExecutionStatus::Queued,
                RunStatus::Pending,
                description,
            ))
            .await?;

        debug!(run_id = %run.id, delay_ms = delay.as_millis() as u64, "Retry requeued");
        Ok(())
    }

    fn backoff_delay(&self, attempt: i32) -> Duration {
        let base = self.res.config.retry_base_delay;
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        (base * 2u32.saturating_pow(exponent)).min(self.res.config.retry_max_delay)
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
