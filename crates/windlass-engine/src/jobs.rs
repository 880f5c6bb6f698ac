// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled-job payload catalog.
//!
//! Time-based transitions run through the at-least-once scheduled-job table.
//! Payloads are a tagged union; every handler is idempotent because jobs can
//! be delivered more than once. A payload that fails to deserialize indicates
//! schema drift and is fatal: the worker halts and leaves the row in place
//! for a correctly-configured process, rather than retrying or deleting it.

use serde::{Deserialize, Serialize};

/// The payload of one scheduled job, dispatched by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobPayload {
    /// A run in a heartbeating status missed its heartbeat deadline.
    HeartbeatTimeout {
        /// The run to check.
        run_id: String,
        /// The snapshot the timer was armed for. The timer is dropped when
        /// this is no longer the latest snapshot.
        snapshot_id: String,
    },
    /// A delayed run's delay elapsed; enqueue it.
    EnqueueDelayedRun {
        /// The delayed run.
        run_id: String,
    },
    /// A run's TTL elapsed; expire it if it never started.
    ExpireRun {
        /// The run to expire.
        run_id: String,
    },
    /// A datetime waitpoint reached its scheduled instant.
    CompleteDateTimeWaitpoint {
        /// The waitpoint to complete.
        waitpoint_id: String,
    },
    /// Re-check a run whose blockers may all have completed, and continue it
    /// if so. Concurrent waitpoint completions coalesce into one of these
    /// per run via the dedup key.
    ContinueRunIfUnblocked {
        /// The possibly-unblocked run.
        run_id: String,
    },
    /// Re-check whether every run in a batch reached a final status.
    TryCompleteBatch {
        /// The batch to check.
        batch_id: String,
    },
}

impl JobPayload {
    /// The dedup key for this payload, where one makes sense. Enqueueing a
    /// job whose dedup key matches an existing row replaces that row.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            Self::HeartbeatTimeout { run_id, .. } => Some(format!("heartbeat:{run_id}")),
            Self::EnqueueDelayedRun { run_id } => Some(format!("delay:{run_id}")),
            Self::ExpireRun { run_id } => Some(format!("ttl:{run_id}")),
            Self::CompleteDateTimeWaitpoint { waitpoint_id } => {
                Some(format!("datetime:{waitpoint_id}"))
            }
            Self::ContinueRunIfUnblocked { run_id } => Some(format!("continue:{run_id}")),
            Self::TryCompleteBatch { batch_id } => Some(format!("batch:{batch_id}")),
        }
    }
}

/// Dedup key of a run's heartbeat-timeout job, used to cancel the timer when
/// the run transitions to a status that does not heartbeat.
pub(crate) fn heartbeat_dedup_key(run_id: &str) -> String {
    format!("heartbeat:{run_id}")
}
