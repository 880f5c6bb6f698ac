// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-deferred run admission: delayed runs, TTL expiry and runs parked for
//! an undeployed task version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::jobs::JobPayload;
use crate::persistence::{ExecutionStatus, RunStatus, TaskRunRecord};
use crate::systems::attempt::AttemptSystem;
use crate::systems::snapshot::{SnapshotSystem, SnapshotTransition};
use crate::systems::EngineResources;

/// Admission of runs whose queueing was deferred.
#[derive(Clone)]
pub struct ScheduleSystem {
    res: Arc<EngineResources>,
}

impl ScheduleSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    fn snapshots(&self) -> SnapshotSystem {
        SnapshotSystem::new(self.res.clone())
    }

    /// The admission score of a deferred run: its delay instant when one is
    /// set, its trigger instant otherwise. A delayed run competes with runs
    /// triggered at its delay expiry, not at its trigger time.
    fn admission_score(run: &TaskRunRecord) -> i64 {
        let base = run
            .delay_until
            .unwrap_or(run.queue_timestamp)
            .timestamp_millis();
        base - run.priority_ms
    }

    /// Job handler: enqueue a delayed run whose delay elapsed.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn handle_enqueue_delayed_run(&self, run_id: &str) -> Result<()> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let snapshots = this.snapshots();
                let latest = snapshots.latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;
                if status != ExecutionStatus::RunCreated {
                    debug!(status = status.as_str(), "Delayed run no longer pending admission");
                    return Ok(());
                }

                let run = this.get_run(&run_id).await?;
                guard.ensure_held()?;
                this.res
                    .queue
                    .enqueue(&run, Self::admission_score(&run))
                    .await?;
                snapshots
                    .transition_locked(SnapshotTransition::new(
                        &run,
                        ExecutionStatus::Queued,
                        RunStatus::Pending,
                        "Delay elapsed, queued",
                    ))
                    .await?;
                this.res.events.publish(EngineEvent::RunQueued {
                    run_id: run.id.clone(),
                    master_queue: run.master_queue.clone(),
                });
                info!("Delayed run queued");
                Ok(())
            })
            .await
    }

    /// Move a delayed run's admission to a new instant. Fails once the run
    /// has already been queued.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn reschedule_delayed_run(
        &self,
        run_id: &str,
        delay_until: DateTime<Utc>,
    ) -> Result<()> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let latest = this.snapshots().latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;
                if status != ExecutionStatus::RunCreated
                    || latest.run_status != RunStatus::Delayed.as_str()
                {
                    return Err(EngineError::InvalidStateTransition {
                        run_id: run_id.clone(),
                        status: status.as_str().to_string(),
                        operation: "rescheduleDelayedRun".to_string(),
                    });
                }

                guard.ensure_held()?;
                this.res
                    .persistence
                    .update_run_delay(&run_id, delay_until)
                    .await?;
                let payload = JobPayload::EnqueueDelayedRun {
                    run_id: run_id.clone(),
                };
                this.res
                    .persistence
                    .enqueue_job(
                        payload.dedup_key().as_deref(),
                        &serde_json::to_string(&payload)?,
                        delay_until,
                    )
                    .await?;
                Ok(())
            })
            .await
    }

    /// Job handler: expire a run whose TTL elapsed before it ever started.
    ///
    /// Only a run still sitting in its queue with no attempts expires; a run
    /// that started (or finished) in the meantime is left alone.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn handle_expire_run(&self, run_id: &str) -> Result<()> {
        let this = self.clone();
        let run_id_owned = run_id.to_string();

        self.res
            .lock
            .with_lock(&[run_id], move |guard| async move {
                let run_id = run_id_owned;
                let latest = this.snapshots().latest(&run_id).await?;
                let status = SnapshotSystem::status_of(&latest)?;
                let run = this.get_run(&run_id).await?;

                if status != ExecutionStatus::Queued || run.attempt_number > 0 {
                    debug!(status = status.as_str(), "Run no longer expirable");
                    return Ok(());
                }

                guard.ensure_held()?;
                AttemptSystem::new(this.res.clone())
                    .finish_run_locked(
                        &run,
                        RunStatus::Expired,
                        None,
                        Some("Run expired before execution started"),
                    )
                    .await?;
                info!("Run expired");
                Ok(())
            })
            .await
    }

    /// Queue runs parked for task versions that just became deployable, in
    /// trigger order. Returns the ids of the runs queued.
    #[instrument(skip(self, task_identifiers))]
    pub async fn resolve_pending_version(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<Vec<String>> {
        let parked = self
            .res
            .persistence
            .pending_version_runs(environment_id, task_identifiers)
            .await?;

        let mut queued = Vec::with_capacity(parked.len());
        for run in parked {
            let this = self.clone();
            let run = run.clone();
            let run_id = run.id.clone();

            self.res
                .lock
                .with_lock(&[run_id.as_str()], move |guard| async move {
                    let snapshots = this.snapshots();
                    let latest = snapshots.latest(&run.id).await?;
                    let status = SnapshotSystem::status_of(&latest)?;
                    if status != ExecutionStatus::RunCreated {
                        return Ok(());
                    }

                    guard.ensure_held()?;
                    this.res
                        .queue
                        .enqueue(&run, Self::admission_score(&run))
                        .await?;
                    snapshots
                        .transition_locked(SnapshotTransition::new(
                            &run,
                            ExecutionStatus::Queued,
                            RunStatus::Pending,
                            "Task version deployed, queued",
                        ))
                        .await?;
                    this.res.events.publish(EngineEvent::RunQueued {
                        run_id: run.id.clone(),
                        master_queue: run.master_queue.clone(),
                    });
                    Ok(())
                })
                .await?;
            queued.push(run_id);
        }

        info!(count = queued.len(), "Resolved pending-version runs");
        Ok(queued)
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
