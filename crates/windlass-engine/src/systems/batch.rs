// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batches: groups of runs resolved through a single batch waitpoint.
//!
//! Every member run's finalization enqueues a `TryCompleteBatch` job; the
//! handler completes the batch exactly once, when no member remains
//! unfinished. Redeliveries and early checks are no-ops.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::error::{EngineError, Result};
use crate::persistence::{BatchRecord, WaitpointKind, WaitpointRecord, WaitpointStatus};
use crate::systems::waitpoint::WaitpointSystem;
use crate::systems::{EngineResources, new_id};

/// Batch creation and completion tracking.
#[derive(Clone)]
pub struct BatchSystem {
    res: Arc<EngineResources>,
}

impl BatchSystem {
    /// Create the system over shared resources.
    pub fn new(res: Arc<EngineResources>) -> Self {
        Self { res }
    }

    /// Create a batch and its waitpoint ahead of triggering the member runs.
    ///
    /// Member runs are triggered afterwards carrying the batch id; a caller
    /// that wants to block on the whole batch joins the returned batch's
    /// waitpoint.
    #[instrument(skip(self))]
    pub async fn create_batch(&self, environment_id: &str, run_count: i64) -> Result<BatchRecord> {
        if run_count <= 0 {
            return Err(EngineError::ValidationError {
                field: "run_count".to_string(),
                message: format!("must be positive, got {run_count}"),
            });
        }

        let waitpoint = WaitpointRecord {
            id: new_id("wp"),
            kind: WaitpointKind::Batch.as_str().to_string(),
            status: WaitpointStatus::Pending.as_str().to_string(),
            environment_id: environment_id.to_string(),
            completed_by_run_id: None,
            idempotency_key: None,
            scheduled_for: None,
            output: None,
            output_is_error: false,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.res.persistence.create_waitpoint(&waitpoint).await?;

        let batch = BatchRecord {
            id: new_id("batch"),
            environment_id: environment_id.to_string(),
            waitpoint_id: waitpoint.id,
            run_count,
            status: "PENDING".to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.res.persistence.create_batch(&batch).await?;

        info!(batch_id = %batch.id, run_count, "Created batch");
        Ok(batch)
    }

    /// Fetch a batch, failing if it does not exist.
    pub async fn get_batch(&self, batch_id: &str) -> Result<BatchRecord> {
        self.res
            .persistence
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| EngineError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    /// Job handler: complete the batch if every member run has finished.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn handle_try_complete_batch(&self, batch_id: &str) -> Result<()> {
        let unfinished = self
            .res
            .persistence
            .unfinished_batch_run_count(batch_id)
            .await?;
        if unfinished > 0 {
            debug!(unfinished, "Batch not complete yet");
            return Ok(());
        }

        let batch = self.get_batch(batch_id).await?;
        if !self
            .res
            .persistence
            .complete_batch_once(batch_id, Utc::now())
            .await?
        {
            debug!("Batch already completed");
            return Ok(());
        }

        WaitpointSystem::new(self.res.clone())
            .complete_waitpoint(&batch.waitpoint_id, None, false)
            .await?;
        info!("Batch completed");
        Ok(())
    }
}
