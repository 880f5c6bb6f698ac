// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public request/response types for the engine API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::{SnapshotRecord, TaskRunRecord};

/// The environment a run belongs to. Environments are the unit of queue
/// visibility and concurrency enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    /// Environment id.
    pub id: String,
    /// Owning organization id.
    pub organization_id: String,
    /// Owning project id.
    pub project_id: String,
    /// Environment type.
    pub env_type: EnvironmentType,
    /// Maximum concurrently-executing runs, if the environment declared one.
    pub concurrency_limit: Option<i64>,
}

/// Environment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    /// Interactive development environment served by a locally-attached
    /// worker. Stalls here are finalized instead of recovered.
    Development,
    /// Deployed environment (staging/production) served by managed workers.
    Deployed,
}

impl EnvironmentType {
    /// Canonical string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "DEVELOPMENT",
            Self::Deployed => "DEPLOYED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEVELOPMENT" => Some(Self::Development),
            "DEPLOYED" => Some(Self::Deployed),
            _ => None,
        }
    }
}

/// A trigger request: one task invocation to orchestrate.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// Caller-visible friendly id (e.g. `run_abc123`).
    pub friendly_id: String,
    /// The environment the run executes in.
    pub environment: RuntimeEnvironment,
    /// Task identifier within the project.
    pub task_identifier: String,
    /// Queue name the run is scheduled on.
    pub queue_name: String,
    /// Serialized payload handed to the executor.
    pub payload: String,
    /// MIME type of the payload.
    pub payload_type: String,
    /// Explicit priority offset in milliseconds. Positive values move the
    /// run ahead of same-age work.
    pub priority_ms: i64,
    /// Optional per-queue concurrency key (fans a queue out per key).
    pub concurrency_key: Option<String>,
    /// Optional idempotency key. Re-triggering with the same key within the
    /// expiry window returns the original run.
    pub idempotency_key: Option<String>,
    /// When the idempotency key stops deduplicating.
    pub idempotency_key_expires_at: Option<DateTime<Utc>>,
    /// Maximum attempts before the run fails terminally. Falls back to the
    /// engine default when absent.
    pub max_attempts: Option<i32>,
    /// Maximum wall-clock seconds per attempt, enforced by the executor.
    pub max_duration_seconds: Option<i32>,
    /// Machine preset name for the executor.
    pub machine_preset: Option<String>,
    /// Defer queueing until this instant.
    pub delay_until: Option<DateTime<Utc>>,
    /// Expire the run if still queued at this instant.
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// Parent run id, for sub-runs.
    pub parent_run_id: Option<String>,
    /// Root run id of the trigger tree.
    pub root_run_id: Option<String>,
    /// Block the parent on this run's completion waitpoint.
    pub resume_parent_on_completion: bool,
    /// Batch this run belongs to, if any.
    pub batch_id: Option<String>,
    /// Deployment version the run targets. `None` parks the run until the
    /// version is deployed.
    pub deployed_version: Option<String>,
    /// Schedule that produced this run, if any.
    pub schedule_id: Option<String>,
}

/// Outcome of a trigger call. Duplicate idempotency keys are an expected
/// business outcome, not an error.
#[derive(Debug, Clone)]
pub enum TriggerResult {
    /// A new run was created (and queued, delayed, or parked).
    Triggered(Box<TaskRunRecord>),
    /// A run with this idempotency key already exists within its window.
    DuplicateIdempotencyKey {
        /// The previously-created run.
        existing: Box<TaskRunRecord>,
    },
}

/// A run handed to a dequeue consumer, with everything the executor needs
/// to start an attempt.
#[derive(Debug, Clone)]
pub struct DequeuedRun {
    /// The run.
    pub run: TaskRunRecord,
    /// The snapshot created by the dequeue (status `PENDING_EXECUTING`).
    pub snapshot: SnapshotRecord,
    /// Outputs of waitpoints completed while the run was blocked, forwarded
    /// so a resuming executor can observe them.
    pub completed_waitpoints: Vec<CompletedWaitpoint>,
}

/// A completed blocking waitpoint forwarded to a resuming run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedWaitpoint {
    /// Waitpoint id.
    pub id: String,
    /// Output payload recorded at completion, if any.
    pub output: Option<String>,
    /// Whether the output represents an error.
    pub output_is_error: bool,
}

/// Everything a worker needs to know about a run's current state.
#[derive(Debug, Clone)]
pub struct RunExecutionData {
    /// The run.
    pub run: TaskRunRecord,
    /// The latest execution snapshot.
    pub snapshot: SnapshotRecord,
    /// Completed blocking waitpoints not yet consumed by a continuation.
    pub completed_waitpoints: Vec<CompletedWaitpoint>,
    /// Max wall-clock seconds per attempt, for the executor to enforce.
    pub max_duration_seconds: Option<i32>,
}

/// How an attempt ended, as reported by the executor.
#[derive(Debug, Clone)]
pub enum AttemptCompletion {
    /// The attempt succeeded.
    Success {
        /// Serialized output of the task.
        output: Option<String>,
    },
    /// The attempt failed.
    Failure {
        /// Serialized error detail.
        error: String,
        /// Whether the failure may be retried.
        retriable: bool,
    },
}

/// What the engine decided after an attempt completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    /// The run reached a terminal state.
    RunFinished,
    /// The run was requeued with a backoff delay.
    RetryQueued,
    /// The executor should retry in place without requeueing.
    RetryImmediately,
    /// A cancellation was requested; the executor must stop and acknowledge.
    RunPendingCancel,
}

/// Outcome of a checkpoint creation call.
#[derive(Debug, Clone)]
pub enum CheckpointOutcome {
    /// The run was suspended on the checkpoint.
    Suspended {
        /// The new `SUSPENDED` snapshot.
        snapshot: SnapshotRecord,
    },
    /// The run is pending cancellation; the checkpoint was discarded and the
    /// executor should proceed with cancellation instead.
    CancelRequested,
}
