// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine facade: wires the subsystems together and exposes the public
//! API surface (trigger, dequeue, the scheduled-job worker).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use windlass_keyval::KeyValueStore;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::jobs::JobPayload;
use crate::lock::RunLockService;
use crate::persistence::{
    ExecutionStatus, Persistence, RunStatus, ScheduledJobRecord, TaskRunRecord, WaitpointKind,
    WaitpointRecord, WaitpointStatus,
};
use crate::queue::fair::{FairQueueConfig, FairQueueSelector};
use crate::queue::{ClaimedRun, RunQueue, queue_score};
use crate::systems::attempt::AttemptSystem;
use crate::systems::batch::BatchSystem;
use crate::systems::checkpoint::CheckpointSystem;
use crate::systems::schedule::ScheduleSystem;
use crate::systems::snapshot::{SnapshotSystem, SnapshotTransition};
use crate::systems::waitpoint::WaitpointSystem;
use crate::systems::{EngineResources, completed_waitpoint, new_id};
use crate::types::{DequeuedRun, EnvironmentType, TriggerRequest, TriggerResult};

/// How a freshly-triggered run is admitted.
enum Admission {
    Queued,
    Delayed,
    PendingVersion,
}

/// The run orchestration engine.
///
/// One instance per process; all subsystems share the same resources. The
/// engine itself is cheap to clone through [`RunEngine::attempts`] and
/// friends, which hand out system views over the shared state.
pub struct RunEngine {
    res: Arc<EngineResources>,
    shutdown: watch::Sender<bool>,
}

impl RunEngine {
    /// Wire an engine over the given storage backends.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        store: Arc<dyn KeyValueStore>,
        config: EngineConfig,
    ) -> Self {
        let selector = FairQueueSelector::new(
            store.clone(),
            FairQueueConfig {
                parent_queue_limit: config.parent_queue_limit,
                queue_age_randomization: config.queue_age_randomization,
                max_env_count: config.max_env_count,
                snapshot_reuse_count: config.snapshot_reuse_count,
                default_env_concurrency_limit: config.default_env_concurrency_limit,
            },
        );
        let lock = RunLockService::new(store.clone(), config.lock_ttl, config.lock_acquire_timeout);
        let res = Arc::new(EngineResources {
            persistence,
            queue: RunQueue::new(store.clone()),
            selector,
            lock,
            events: EventBus::default(),
            store,
            config,
        });
        let (shutdown, _) = watch::channel(false);
        Self { res, shutdown }
    }

    /// The attempt system.
    pub fn attempts(&self) -> AttemptSystem {
        AttemptSystem::new(self.res.clone())
    }

    /// The waitpoint system.
    pub fn waitpoints(&self) -> WaitpointSystem {
        WaitpointSystem::new(self.res.clone())
    }

    /// The checkpoint system.
    pub fn checkpoints(&self) -> CheckpointSystem {
        CheckpointSystem::new(self.res.clone())
    }

    /// The batch system.
    pub fn batches(&self) -> BatchSystem {
        BatchSystem::new(self.res.clone())
    }

    /// The schedule system.
    pub fn schedule(&self) -> ScheduleSystem {
        ScheduleSystem::new(self.res.clone())
    }

    /// The snapshot system.
    pub fn snapshots(&self) -> SnapshotSystem {
        SnapshotSystem::new(self.res.clone())
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.res.events.subscribe()
    }

    /// Verify the storage backends are reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.res.persistence.health_check().await?;
        self.res.store.get("health:probe").await?;
        Ok(())
    }

    /// Create a run and admit it: queue it, defer it until its delay, or
    /// park it until its task version is deployed.
    #[instrument(skip(self, request), fields(task = %request.task_identifier))]
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult> {
        let now = Utc::now();

        if let Some(key) = &request.idempotency_key
            && let Some(existing) = self
                .res
                .persistence
                .find_run_by_idempotency_key(&request.environment.id, key, now)
                .await?
        {
            debug!(key, "Trigger deduplicated by idempotency key");
            return Ok(TriggerResult::DuplicateIdempotencyKey {
                existing: Box::new(existing),
            });
        }

        let admission = if request.delay_until.is_some_and(|at| at > now) {
            Admission::Delayed
        } else if request.environment.env_type == EnvironmentType::Deployed
            && request.deployed_version.is_none()
        {
            Admission::PendingVersion
        } else {
            Admission::Queued
        };

        let run = self.build_run(&request, &admission, now);
        let run_waitpoint = WaitpointRecord {
            id: run.associated_waitpoint_id.clone(),
            kind: WaitpointKind::Run.as_str().to_string(),
            status: WaitpointStatus::Pending.as_str().to_string(),
            environment_id: run.environment_id.clone(),
            completed_by_run_id: Some(run.id.clone()),
            idempotency_key: None,
            scheduled_for: None,
            output: None,
            output_is_error: false,
            completed_at: None,
            created_at: now,
        };
        let (execution_status, run_status, description) = match admission {
            Admission::Queued => (ExecutionStatus::Queued, RunStatus::Pending, "Triggered"),
            Admission::Delayed => (
                ExecutionStatus::RunCreated,
                RunStatus::Delayed,
                "Triggered with delay",
            ),
            Admission::PendingVersion => (
                ExecutionStatus::RunCreated,
                RunStatus::PendingVersion,
                "Triggered, waiting for a deployed version",
            ),
        };
        let snapshot =
            SnapshotSystem::initial_snapshot(&run, execution_status, run_status, description);

        match self
            .res
            .persistence
            .create_run_with_snapshot(&run, &snapshot, &run_waitpoint)
            .await
        {
            Ok(()) => {}
            // Lost a race with a concurrent identical trigger.
            Err(EngineError::DuplicateIdempotencyKey { key }) => {
                let existing = self
                    .res
                    .persistence
                    .find_run_by_idempotency_key(&request.environment.id, &key, now)
                    .await?
                    .ok_or(EngineError::DuplicateIdempotencyKey { key })?;
                return Ok(TriggerResult::DuplicateIdempotencyKey {
                    existing: Box::new(existing),
                });
            }
            Err(err) => return Err(err),
        }

        if let Some(limit) = request.environment.concurrency_limit {
            self.res
                .queue
                .set_env_concurrency_limit(&request.environment.id, limit)
                .await?;
        }
        self.res.events.publish(EngineEvent::RunCreated {
            run_id: run.id.clone(),
            environment_id: run.environment_id.clone(),
        });

        match admission {
            Admission::Queued => {
                self.res.queue.enqueue(&run, queue_score(&run)).await?;
                self.res.events.publish(EngineEvent::RunQueued {
                    run_id: run.id.clone(),
                    master_queue: run.master_queue.clone(),
                });
            }
            Admission::Delayed => {
                let payload = JobPayload::EnqueueDelayedRun {
                    run_id: run.id.clone(),
                };
                self.res
                    .persistence
                    .enqueue_job(
                        payload.dedup_key().as_deref(),
                        &serde_json::to_string(&payload)?,
                        run.delay_until.unwrap_or(now),
                    )
                    .await?;
            }
            Admission::PendingVersion => {}
        }

        if let Some(ttl_at) = run.ttl_expires_at {
            let payload = JobPayload::ExpireRun {
                run_id: run.id.clone(),
            };
            self.res
                .persistence
                .enqueue_job(
                    payload.dedup_key().as_deref(),
                    &serde_json::to_string(&payload)?,
                    ttl_at,
                )
                .await?;
        }

        if request.resume_parent_on_completion
            && let Some(parent_run_id) = &request.parent_run_id
        {
            let parent_latest = self.snapshots().latest(parent_run_id).await?;
            self.waitpoints()
                .block_run_with_waitpoints(
                    parent_run_id,
                    &parent_latest.id,
                    vec![run.associated_waitpoint_id.clone()],
                    true,
                )
                .await?;
        }

        info!(run_id = %run.id, "Run triggered");
        Ok(TriggerResult::Triggered(Box::new(run)))
    }

    fn build_run(
        &self,
        request: &TriggerRequest,
        admission: &Admission,
        now: chrono::DateTime<Utc>,
    ) -> TaskRunRecord {
        let env = &request.environment;
        // Deployed runs route through their deployment's master queue so new
        // workers drain version-targeted work first; the environment master
        // is the fallback every worker polls. Parked runs have no version
        // yet and route through the environment master alone.
        let (master_queue, secondary) = match (env.env_type, &request.deployed_version) {
            (EnvironmentType::Development, _) => (format!("env:{}", env.id), None),
            (EnvironmentType::Deployed, Some(version)) => (
                format!("deployment:{version}"),
                Some(format!("env:{}", env.id)),
            ),
            (EnvironmentType::Deployed, None) => (format!("env:{}", env.id), None),
        };

        let run_status = match admission {
            Admission::Queued => RunStatus::Pending,
            Admission::Delayed => RunStatus::Delayed,
            Admission::PendingVersion => RunStatus::PendingVersion,
        };

        TaskRunRecord {
            id: new_id("run"),
            friendly_id: request.friendly_id.clone(),
            status: run_status.as_str().to_string(),
            organization_id: env.organization_id.clone(),
            project_id: env.project_id.clone(),
            environment_id: env.id.clone(),
            environment_type: env.env_type.as_str().to_string(),
            task_identifier: request.task_identifier.clone(),
            queue_name: request.queue_name.clone(),
            payload: request.payload.clone(),
            payload_type: request.payload_type.clone(),
            queue_timestamp: request.delay_until.unwrap_or(now),
            priority_ms: request.priority_ms,
            concurrency_key: request.concurrency_key.clone(),
            idempotency_key: request.idempotency_key.clone(),
            idempotency_key_expires_at: request.idempotency_key_expires_at,
            max_attempts: request
                .max_attempts
                .unwrap_or(self.res.config.default_max_attempts),
            attempt_number: 0,
            max_duration_seconds: request.max_duration_seconds,
            machine_preset: request.machine_preset.clone(),
            delay_until: request.delay_until,
            ttl_expires_at: request.ttl_expires_at,
            parent_run_id: request.parent_run_id.clone(),
            root_run_id: request.root_run_id.clone(),
            resume_parent_on_completion: request.resume_parent_on_completion,
            batch_id: request.batch_id.clone(),
            schedule_id: request.schedule_id.clone(),
            deployed_version: request.deployed_version.clone(),
            master_queue,
            secondary_master_queue: secondary,
            associated_waitpoint_id: new_id("wp"),
            output: None,
            error: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Claim up to `max_count` runs from a master queue for a consumer.
    ///
    /// Fair selection picks the order of tenant queues; each claimed run is
    /// validated and transitioned to `PENDING_EXECUTING` under its lock. A
    /// claim that loses its validation race is rolled back and dequeue moves
    /// on.
    #[instrument(skip(self), fields(consumer_id = %consumer_id, master_queue = %master_queue))]
    pub async fn dequeue_from_master_queue(
        &self,
        consumer_id: &str,
        master_queue: &str,
        max_count: usize,
    ) -> Result<Vec<DequeuedRun>> {
        let env_queues = self
            .res
            .selector
            .distribute(master_queue, consumer_id)
            .await?;

        let mut dequeued = Vec::new();
        'environments: for env in env_queues {
            for queue_key in &env.queue_keys {
                while dequeued.len() < max_count {
                    let Some(claim) = self
                        .res
                        .queue
                        .claim(queue_key, self.res.config.default_env_concurrency_limit)
                        .await?
                    else {
                        break;
                    };
                    if let Some(run) = self.finalize_claim(consumer_id, claim).await? {
                        dequeued.push(run);
                    }
                }
                if dequeued.len() >= max_count {
                    break 'environments;
                }
            }
        }

        debug!(count = dequeued.len(), "Dequeue complete");
        Ok(dequeued)
    }

    /// Turn a queue claim into a `PENDING_EXECUTING` run, or roll it back.
    async fn finalize_claim(
        &self,
        consumer_id: &str,
        claim: ClaimedRun,
    ) -> Result<Option<DequeuedRun>> {
        let Some(run) = self.res.persistence.get_run(&claim.run_id).await? else {
            warn!(run_id = %claim.run_id, "Claimed run has no record, dropping claim");
            self.res.queue.rollback_claim(&claim).await?;
            return Ok(None);
        };

        let this_res = self.res.clone();
        let run_id = run.id.clone();
        let consumer = consumer_id.to_string();

        let result = self
            .res
            .lock
            .with_lock(&[run_id.as_str()], move |guard| async move {
                let snapshots = SnapshotSystem::new(this_res.clone());
                let latest = snapshots.latest(&run.id).await?;
                let status = SnapshotSystem::status_of(&latest)?;

                let forwarded = match status {
                    ExecutionStatus::Queued => Vec::new(),
                    // A resuming run carries its completed blockers forward.
                    ExecutionStatus::QueuedExecuting => {
                        snapshots.take_completed_blockers(&run.id).await?
                    }
                    other => {
                        // The run left the queueable state after the claim
                        // (canceled, expired, finished). Free the claim's
                        // concurrency without putting the run back.
                        debug!(status = other.as_str(), "Claimed run not queueable, releasing");
                        this_res.queue.release_concurrency(&run).await?;
                        this_res.queue.refresh_masters(&run).await?;
                        return Ok(None);
                    }
                };

                guard.ensure_held()?;
                let snapshot = snapshots
                    .transition_locked(SnapshotTransition {
                        worker_id: Some(consumer.clone()),
                        completed_waitpoint_ids: forwarded.iter().map(|w| w.id.clone()).collect(),
                        ..SnapshotTransition::new(
                            &run,
                            ExecutionStatus::PendingExecuting,
                            RunStatus::Dequeued,
                            "Dequeued",
                        )
                    })
                    .await?;
                this_res.queue.refresh_masters(&run).await?;
                this_res.events.publish(EngineEvent::RunDequeued {
                    run_id: run.id.clone(),
                    consumer_id: consumer,
                });

                Ok(Some(DequeuedRun {
                    completed_waitpoints: forwarded.iter().map(completed_waitpoint).collect(),
                    run,
                    snapshot,
                }))
            })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            // Another process holds the run; hand the claim back.
            Err(EngineError::LockTimeout { .. }) => {
                self.res.queue.rollback_claim(&claim).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Spawn the background worker that drains due scheduled jobs.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let res = self.res.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(res.config.worker_poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Job worker started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match drain_due_jobs(&res).await {
                            Ok(_) => {}
                            Err(err @ EngineError::CorruptRecord { .. }) => {
                                error!(error = %err, "Job worker halting on undecodable job payload");
                                break;
                            }
                            Err(err) => {
                                error!(error = %err, "Job worker tick failed");
                            }
                        }
                    }
                }
            }
            info!("Job worker stopped");
        })
    }

    /// Process one batch of due jobs immediately. The background worker does
    /// this on every poll; callers can drive it directly in tests or when
    /// embedding the engine without the worker task.
    pub async fn tick_jobs(&self) -> Result<usize> {
        drain_due_jobs(&self.res).await
    }

    /// Signal the background worker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Fetch and dispatch due jobs, returning how many were processed.
async fn drain_due_jobs(res: &Arc<EngineResources>) -> Result<usize> {
    let now = Utc::now();
    let jobs = res
        .persistence
        .due_jobs(now, res.config.worker_batch_size)
        .await?;
    let count = jobs.len();

    for job in jobs {
        // An undecodable payload means this process cannot interpret the
        // persisted schema. Deleting the row would destroy durable work
        // (a heartbeat deadline, a delayed admission), so the error is
        // fatal: the job stays put for a correctly-configured process.
        let payload =
            serde_json::from_str::<JobPayload>(&job.payload).map_err(|err| {
                EngineError::CorruptRecord {
                    entity: "scheduled_job".to_string(),
                    details: format!("job {} payload is undecodable: {err}", job.id),
                }
            })?;

        match dispatch_job(res, &payload).await {
            Ok(()) => res.persistence.delete_job(job.id).await?,
            Err(err) => handle_job_failure(res, &job, &err).await?,
        }
    }
    Ok(count)
}

async fn dispatch_job(res: &Arc<EngineResources>, payload: &JobPayload) -> Result<()> {
    match payload {
        JobPayload::HeartbeatTimeout {
            run_id,
            snapshot_id,
        } => {
            SnapshotSystem::new(res.clone())
                .handle_heartbeat_timeout(run_id, snapshot_id)
                .await
        }
        JobPayload::EnqueueDelayedRun { run_id } => {
            ScheduleSystem::new(res.clone())
                .handle_enqueue_delayed_run(run_id)
                .await
        }
        JobPayload::ExpireRun { run_id } => {
            ScheduleSystem::new(res.clone()).handle_expire_run(run_id).await
        }
        JobPayload::CompleteDateTimeWaitpoint { waitpoint_id } => {
            WaitpointSystem::new(res.clone())
                .complete_waitpoint(waitpoint_id, None, false)
                .await
        }
        JobPayload::ContinueRunIfUnblocked { run_id } => {
            WaitpointSystem::new(res.clone())
                .handle_continue_run_if_unblocked(run_id)
                .await
        }
        JobPayload::TryCompleteBatch { batch_id } => {
            BatchSystem::new(res.clone())
                .handle_try_complete_batch(batch_id)
                .await
        }
    }
}

async fn handle_job_failure(
    res: &Arc<EngineResources>,
    job: &ScheduledJobRecord,
    err: &EngineError,
) -> Result<()> {
    let attempts = job.attempts + 1;
    if attempts >= res.config.job_max_attempts {
        error!(
            job_id = job.id,
            attempts,
            error = %err,
            "Job exhausted its attempts, dropping"
        );
        res.persistence.delete_job(job.id).await?;
        return Ok(());
    }

    let delay = res.config.retry_base_delay * attempts as u32;
    warn!(job_id = job.id, attempts, error = %err, "Job failed, rescheduling");
    let run_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
    res.persistence.reschedule_job(job.id, run_at, attempts).await
}
