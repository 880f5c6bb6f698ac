// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence layer for runs, execution snapshots, waitpoints, checkpoints,
//! batches and scheduled jobs.
//!
//! Status fields are stored as strings and interpreted through the enums in
//! this module. Snapshots are append-only; the latest snapshot for a run is
//! resolved by creation sequence, never cached.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use postgres::PostgresPersistence;
pub use sqlite::SqlitePersistence;

// ============================================================================
// Status enums
// ============================================================================

/// Execution status of a run, carried by its latest snapshot.
///
/// `FINISHED` is the only terminal status. `PENDING_CANCEL` is reachable from
/// any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Run exists but has not been queued (delayed or pending version).
    RunCreated,
    /// Run is in its queue awaiting a consumer.
    Queued,
    /// A previously-suspended run is back in its queue.
    QueuedExecuting,
    /// A consumer claimed the run; the attempt has not started yet.
    PendingExecuting,
    /// An attempt is executing.
    Executing,
    /// The attempt is executing but blocked on waitpoints.
    ExecutingWithWaitpoints,
    /// The run is checkpointed and suspended, consuming no compute.
    Suspended,
    /// Cancellation was requested; awaiting executor acknowledgement.
    PendingCancel,
    /// Terminal.
    Finished,
}

impl ExecutionStatus {
    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::Queued => "QUEUED",
            Self::QueuedExecuting => "QUEUED_EXECUTING",
            Self::PendingExecuting => "PENDING_EXECUTING",
            Self::Executing => "EXECUTING",
            Self::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            Self::Suspended => "SUSPENDED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Finished => "FINISHED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUN_CREATED" => Some(Self::RunCreated),
            "QUEUED" => Some(Self::Queued),
            "QUEUED_EXECUTING" => Some(Self::QueuedExecuting),
            "PENDING_EXECUTING" => Some(Self::PendingExecuting),
            "EXECUTING" => Some(Self::Executing),
            "EXECUTING_WITH_WAITPOINTS" => Some(Self::ExecutingWithWaitpoints),
            "SUSPENDED" => Some(Self::Suspended),
            "PENDING_CANCEL" => Some(Self::PendingCancel),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Whether a run in this status is expected to heartbeat. These are the
    /// statuses that schedule a heartbeat-timeout job.
    pub fn expects_heartbeat(&self) -> bool {
        matches!(
            self,
            Self::PendingExecuting
                | Self::Executing
                | Self::ExecutingWithWaitpoints
                | Self::PendingCancel
        )
    }
}

/// User-visible run status, mirrored onto each snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Queued, awaiting a consumer.
    Pending,
    /// Parked until the targeted task version is deployed.
    PendingVersion,
    /// Waiting for its delay to elapse before queueing.
    Delayed,
    /// Claimed by a consumer; attempt not yet started.
    Dequeued,
    /// An attempt is executing.
    Executing,
    /// Blocked on waitpoints or suspended.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished with a task-level failure.
    Failed,
    /// Finished after the executor crashed or stalled.
    Crashed,
    /// Finished with an internal engine error.
    SystemFailure,
    /// Canceled.
    Canceled,
    /// Expired before ever executing.
    Expired,
}

impl RunStatus {
    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PendingVersion => "PENDING_VERSION",
            Self::Delayed => "DELAYED",
            Self::Dequeued => "DEQUEUED",
            Self::Executing => "EXECUTING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Crashed => "CRASHED",
            Self::SystemFailure => "SYSTEM_FAILURE",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PENDING_VERSION" => Some(Self::PendingVersion),
            "DELAYED" => Some(Self::Delayed),
            "DEQUEUED" => Some(Self::Dequeued),
            "EXECUTING" => Some(Self::Executing),
            "WAITING" => Some(Self::Waiting),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CRASHED" => Some(Self::Crashed),
            "SYSTEM_FAILURE" => Some(Self::SystemFailure),
            "CANCELED" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether this is a final run status.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Crashed
                | Self::SystemFailure
                | Self::Canceled
                | Self::Expired
        )
    }
}

/// Waitpoint variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitpointKind {
    /// Completes when the associated run finishes.
    Run,
    /// Auto-completes at a timestamp.
    DateTime,
    /// Explicitly completed or failed by a caller.
    Manual,
    /// Completes when a batch of runs resolves.
    Batch,
}

impl WaitpointKind {
    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::DateTime => "DATETIME",
            Self::Manual => "MANUAL",
            Self::Batch => "BATCH",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUN" => Some(Self::Run),
            "DATETIME" => Some(Self::DateTime),
            "MANUAL" => Some(Self::Manual),
            "BATCH" => Some(Self::Batch),
            _ => None,
        }
    }
}

/// Waitpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitpointStatus {
    /// Not yet completed; blocks joined runs.
    Pending,
    /// Completed; no longer blocks anything.
    Completed,
}

impl WaitpointStatus {
    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One logical task invocation. Status transitions happen only through
/// creation of new snapshots; the `status` column mirrors the latest one.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskRunRecord {
    /// Internal id.
    pub id: String,
    /// Caller-visible friendly id.
    pub friendly_id: String,
    /// Run status (see [`RunStatus`]).
    pub status: String,
    /// Owning organization.
    pub organization_id: String,
    /// Owning project.
    pub project_id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Environment type at trigger time.
    pub environment_type: String,
    /// Task identifier within the project.
    pub task_identifier: String,
    /// Queue name within the environment.
    pub queue_name: String,
    /// Serialized payload.
    pub payload: String,
    /// MIME type of the payload.
    pub payload_type: String,
    /// Arrival timestamp used as the base queue score.
    pub queue_timestamp: DateTime<Utc>,
    /// Explicit priority offset in milliseconds.
    pub priority_ms: i64,
    /// Optional concurrency key fanning the queue out per key.
    pub concurrency_key: Option<String>,
    /// Optional idempotency key, unique per environment while unexpired.
    pub idempotency_key: Option<String>,
    /// When the idempotency key stops deduplicating.
    pub idempotency_key_expires_at: Option<DateTime<Utc>>,
    /// Attempts allowed before terminal failure.
    pub max_attempts: i32,
    /// Attempts consumed so far.
    pub attempt_number: i32,
    /// Max wall-clock seconds per attempt, executor-enforced.
    pub max_duration_seconds: Option<i32>,
    /// Machine preset name for the executor.
    pub machine_preset: Option<String>,
    /// Queueing is deferred until this instant.
    pub delay_until: Option<DateTime<Utc>>,
    /// Run expires if still queued at this instant.
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// Parent run, for sub-runs.
    pub parent_run_id: Option<String>,
    /// Root of the trigger tree.
    pub root_run_id: Option<String>,
    /// Whether the parent blocks on this run's waitpoint.
    pub resume_parent_on_completion: bool,
    /// Batch membership.
    pub batch_id: Option<String>,
    /// Schedule that produced this run.
    pub schedule_id: Option<String>,
    /// Deployment version the run targets.
    pub deployed_version: Option<String>,
    /// Primary master queue the run routes through.
    pub master_queue: String,
    /// Secondary master queue (environment fallback in deployed envs).
    pub secondary_master_queue: Option<String>,
    /// The run-associated waitpoint completed when this run finishes.
    pub associated_waitpoint_id: String,
    /// Final output, once finished.
    pub output: Option<String>,
    /// Final error detail, once finished unsuccessfully.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time, once the run reached a final status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRunRecord {
    /// The run's queue key inside the shared store.
    pub fn queue_key(&self) -> String {
        match &self.concurrency_key {
            Some(ck) => format!("{}:{}:ck:{}", self.environment_id, self.queue_name, ck),
            None => format!("{}:{}", self.environment_id, self.queue_name),
        }
    }
}

/// Immutable record of a run's execution state at a point in time.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SnapshotRecord {
    /// Snapshot id.
    pub id: String,
    /// The run this snapshot belongs to.
    pub run_id: String,
    /// Monotonic creation sequence within the run. The highest sequence is
    /// the run's latest snapshot.
    pub seq: i64,
    /// Execution status (see [`ExecutionStatus`]).
    pub execution_status: String,
    /// Run status mirror (see [`RunStatus`]).
    pub run_status: String,
    /// Owning environment.
    pub environment_id: String,
    /// Environment type.
    pub environment_type: String,
    /// Human-readable transition description.
    pub description: String,
    /// Worker process that produced the transition, if any.
    pub worker_id: Option<String>,
    /// Runner instance executing the attempt, if any.
    pub runner_id: Option<String>,
    /// Checkpoint recorded with a `SUSPENDED` snapshot.
    pub checkpoint_id: Option<String>,
    /// Waitpoint ids whose outputs this snapshot carries forward to the
    /// resuming executor, JSON array.
    pub completed_waitpoint_ids: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A named completion condition a run can block on.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WaitpointRecord {
    /// Waitpoint id.
    pub id: String,
    /// Variant (see [`WaitpointKind`]).
    pub kind: String,
    /// Lifecycle status (see [`WaitpointStatus`]).
    pub status: String,
    /// Owning environment.
    pub environment_id: String,
    /// For `RUN` waitpoints, the run whose completion resolves this.
    pub completed_by_run_id: Option<String>,
    /// Optional idempotency key (manual waitpoints).
    pub idempotency_key: Option<String>,
    /// For `DATETIME` waitpoints, the auto-completion instant.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Output payload recorded at completion.
    pub output: Option<String>,
    /// Whether the output represents an error.
    pub output_is_error: bool,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An externally-produced restorable image reference for a suspended run.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CheckpointRecord {
    /// Checkpoint id.
    pub id: String,
    /// The suspended run.
    pub run_id: String,
    /// The snapshot that was latest when the checkpoint was taken.
    pub snapshot_id: String,
    /// Opaque reference to the externally-stored image.
    pub location: String,
    /// Why the run suspended (e.g. which wait it was blocked on).
    pub reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A group of runs triggered together, resolved through a batch waitpoint.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct BatchRecord {
    /// Batch id.
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// The batch waitpoint completed when every member run finishes.
    pub waitpoint_id: String,
    /// Number of member runs.
    pub run_count: i64,
    /// Lifecycle status: `PENDING` or `COMPLETED`.
    pub status: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A row in the at-least-once scheduled-job table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ScheduledJobRecord {
    /// Job id.
    pub id: i64,
    /// Dedup key; enqueueing with an existing key replaces the row.
    pub dedup_key: Option<String>,
    /// Serialized [`crate::jobs::JobPayload`].
    pub payload: String,
    /// Earliest execution time.
    pub run_at: DateTime<Utc>,
    /// Delivery attempts so far.
    pub attempts: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Trait
// ============================================================================

/// Storage backend for the engine.
///
/// Implementations must be safe for concurrent use from multiple processes;
/// multi-statement operations named as one method are transactional.
#[async_trait]
pub trait Persistence: Send + Sync {
    // --- runs ---

    /// Create a run, its initial snapshot and its run-associated waitpoint in
    /// one transaction. A unique violation on the idempotency key surfaces as
    /// [`crate::EngineError::DuplicateIdempotencyKey`].
    async fn create_run_with_snapshot(
        &self,
        run: &TaskRunRecord,
        snapshot: &SnapshotRecord,
        run_waitpoint: &WaitpointRecord,
    ) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<TaskRunRecord>>;

    /// Find an unexpired run with this idempotency key in the environment.
    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRunRecord>>;

    /// Update the run's mirrored status column.
    async fn update_run_status(&self, run_id: &str, status: &str) -> Result<()>;

    /// Increment the run's attempt counter, returning the new value.
    async fn increment_attempt_number(&self, run_id: &str) -> Result<i32>;

    /// Record the run's final status, output and error.
    async fn finalize_run(
        &self,
        run_id: &str,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Reschedule a delayed run that has not been enqueued yet.
    async fn update_run_delay(&self, run_id: &str, delay_until: DateTime<Utc>) -> Result<()>;

    /// Runs parked with status `PENDING_VERSION` for any of the given task
    /// identifiers, in trigger order.
    async fn pending_version_runs(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<Vec<TaskRunRecord>>;

    // --- snapshots ---

    /// Append a snapshot, returning it with its assigned sequence.
    async fn create_snapshot(&self, snapshot: &SnapshotRecord) -> Result<SnapshotRecord>;

    /// The run's latest snapshot (highest sequence).
    async fn latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>>;

    /// Fetch a snapshot by id.
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>>;

    /// Snapshots created after the given snapshot, oldest first.
    async fn snapshots_since(&self, run_id: &str, snapshot_id: &str)
    -> Result<Vec<SnapshotRecord>>;

    // --- waitpoints ---

    /// Create a waitpoint.
    async fn create_waitpoint(&self, waitpoint: &WaitpointRecord) -> Result<()>;

    /// Fetch a waitpoint by id.
    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>>;

    /// Find a pending manual waitpoint with this idempotency key.
    async fn find_manual_waitpoint_by_key(
        &self,
        environment_id: &str,
        key: &str,
    ) -> Result<Option<WaitpointRecord>>;

    /// Complete a waitpoint at most once. Returns false if it was already
    /// completed (conditional update on status).
    async fn complete_waitpoint_once(
        &self,
        waitpoint_id: &str,
        output: Option<&str>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Join a run to the given waitpoints as blockers.
    async fn add_run_blockers(&self, run_id: &str, waitpoint_ids: &[String]) -> Result<()>;

    /// Number of the run's blocking waitpoints still pending.
    async fn pending_blocker_count(&self, run_id: &str) -> Result<i64>;

    /// Ids of runs joined to this waitpoint.
    async fn blocked_run_ids(&self, waitpoint_id: &str) -> Result<Vec<String>>;

    /// The run's joined waitpoints that have completed, oldest first.
    async fn completed_blockers(&self, run_id: &str) -> Result<Vec<WaitpointRecord>>;

    /// Remove all of the run's waitpoint joins.
    async fn clear_blockers(&self, run_id: &str) -> Result<()>;

    // --- checkpoints ---

    /// Create a checkpoint.
    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()>;

    /// Fetch a checkpoint by id.
    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>>;

    // --- batches ---

    /// Create a batch.
    async fn create_batch(&self, batch: &BatchRecord) -> Result<()>;

    /// Fetch a batch by id.
    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>>;

    /// Mark a batch completed at most once. Returns false if it was already
    /// completed.
    async fn complete_batch_once(&self, batch_id: &str, completed_at: DateTime<Utc>)
    -> Result<bool>;

    /// Number of member runs that have not reached a final status.
    async fn unfinished_batch_run_count(&self, batch_id: &str) -> Result<i64>;

    // --- scheduled jobs ---

    /// Enqueue a job. When `dedup_key` matches an existing row, that row is
    /// replaced (payload, run time and attempt counter reset).
    async fn enqueue_job(
        &self,
        dedup_key: Option<&str>,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete any job with this dedup key.
    async fn cancel_job(&self, dedup_key: &str) -> Result<()>;

    /// Jobs due at or before `now`, oldest first, at most `limit`.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJobRecord>>;

    /// Delete a job after successful dispatch.
    async fn delete_job(&self, job_id: i64) -> Result<()>;

    /// Push a failed job's run time back and record the attempt count.
    async fn reschedule_job(&self, job_id: i64, run_at: DateTime<Utc>, attempts: i32)
    -> Result<()>;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock;
