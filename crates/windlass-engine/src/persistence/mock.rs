// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory [`Persistence`] implementation for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    BatchRecord, CheckpointRecord, Persistence, RunStatus, ScheduledJobRecord, SnapshotRecord,
    TaskRunRecord, WaitpointRecord, WaitpointStatus,
};
use crate::error::{EngineError, Result};

#[derive(Default)]
struct MockState {
    runs: HashMap<String, TaskRunRecord>,
    snapshots: Vec<SnapshotRecord>,
    next_seq: i64,
    waitpoints: HashMap<String, WaitpointRecord>,
    // (run_id, waitpoint_id)
    blockers: Vec<(String, String)>,
    checkpoints: HashMap<String, CheckpointRecord>,
    batches: HashMap<String, BatchRecord>,
    jobs: Vec<ScheduledJobRecord>,
    next_job_id: i64,
}

/// In-memory mock of the persistence layer.
#[derive(Default)]
pub(crate) struct MockPersistence {
    state: Mutex<MockState>,
}

impl MockPersistence {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All scheduled jobs, for assertions.
    pub(crate) fn all_jobs(&self) -> Vec<ScheduledJobRecord> {
        self.lock().jobs.clone()
    }
}

#[async_trait]
impl Persistence for MockPersistence {
    async fn create_run_with_snapshot(
        &self,
        run: &TaskRunRecord,
        snapshot: &SnapshotRecord,
        run_waitpoint: &WaitpointRecord,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(key) = &run.idempotency_key {
            let duplicate = state.runs.values().any(|r| {
                r.environment_id == run.environment_id && r.idempotency_key.as_ref() == Some(key)
            });
            if duplicate {
                return Err(EngineError::DuplicateIdempotencyKey { key: key.clone() });
            }
        }
        state.runs.insert(run.id.clone(), run.clone());
        state.next_seq += 1;
        let mut snapshot = snapshot.clone();
        snapshot.seq = state.next_seq;
        state.snapshots.push(snapshot);
        state
            .waitpoints
            .insert(run_waitpoint.id.clone(), run_waitpoint.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<TaskRunRecord>> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRunRecord>> {
        let state = self.lock();
        Ok(state
            .runs
            .values()
            .find(|r| {
                r.environment_id == environment_id
                    && r.idempotency_key.as_deref() == Some(key)
                    && r.idempotency_key_expires_at.is_none_or(|at| at > now)
            })
            .cloned())
    }

    async fn update_run_status(&self, run_id: &str, status: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.status = status.to_string();
        }
        Ok(())
    }

    async fn increment_attempt_number(&self, run_id: &str) -> Result<i32> {
        let mut state = self.lock();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        run.attempt_number += 1;
        Ok(run.attempt_number)
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.status = status.to_string();
            run.output = output.map(str::to_string);
            run.error = error.map(str::to_string);
            run.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn update_run_delay(&self, run_id: &str, delay_until: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if let Some(run) = state.runs.get_mut(run_id) {
            run.delay_until = Some(delay_until);
        }
        Ok(())
    }

    async fn pending_version_runs(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<Vec<TaskRunRecord>> {
        let state = self.lock();
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| {
                r.environment_id == environment_id
                    && r.status == RunStatus::PendingVersion.as_str()
                    && task_identifiers.contains(&r.task_identifier)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn create_snapshot(&self, snapshot: &SnapshotRecord) -> Result<SnapshotRecord> {
        let mut state = self.lock();
        state.next_seq += 1;
        let mut snapshot = snapshot.clone();
        snapshot.seq = state.next_seq;
        state.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>> {
        let state = self.lock();
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.run_id == run_id)
            .max_by_key(|s| s.seq)
            .cloned())
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let state = self.lock();
        Ok(state
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned())
    }

    async fn snapshots_since(
        &self,
        run_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<SnapshotRecord>> {
        let state = self.lock();
        let Some(since) = state.snapshots.iter().find(|s| s.id == snapshot_id) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<_> = state
            .snapshots
            .iter()
            .filter(|s| s.run_id == run_id && s.seq > since.seq)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.seq);
        Ok(result)
    }

    async fn create_waitpoint(&self, waitpoint: &WaitpointRecord) -> Result<()> {
        self.lock()
            .waitpoints
            .insert(waitpoint.id.clone(), waitpoint.clone());
        Ok(())
    }

    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>> {
        Ok(self.lock().waitpoints.get(waitpoint_id).cloned())
    }

    async fn find_manual_waitpoint_by_key(
        &self,
        environment_id: &str,
        key: &str,
    ) -> Result<Option<WaitpointRecord>> {
        let state = self.lock();
        Ok(state
            .waitpoints
            .values()
            .find(|w| {
                w.environment_id == environment_id
                    && w.idempotency_key.as_deref() == Some(key)
                    && w.status == WaitpointStatus::Pending.as_str()
            })
            .cloned())
    }

    async fn complete_waitpoint_once(
        &self,
        waitpoint_id: &str,
        output: Option<&str>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(wp) = state.waitpoints.get_mut(waitpoint_id) else {
            return Ok(false);
        };
        if wp.status == WaitpointStatus::Completed.as_str() {
            return Ok(false);
        }
        wp.status = WaitpointStatus::Completed.as_str().to_string();
        wp.output = output.map(str::to_string);
        wp.output_is_error = output_is_error;
        wp.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn add_run_blockers(&self, run_id: &str, waitpoint_ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        for wp_id in waitpoint_ids {
            let join = (run_id.to_string(), wp_id.clone());
            if !state.blockers.contains(&join) {
                state.blockers.push(join);
            }
        }
        Ok(())
    }

    async fn pending_blocker_count(&self, run_id: &str) -> Result<i64> {
        let state = self.lock();
        let count = state
            .blockers
            .iter()
            .filter(|(r, wp_id)| {
                r == run_id
                    && state
                        .waitpoints
                        .get(wp_id)
                        .is_some_and(|w| w.status == WaitpointStatus::Pending.as_str())
            })
            .count();
        Ok(count as i64)
    }

    async fn blocked_run_ids(&self, waitpoint_id: &str) -> Result<Vec<String>> {
        let state = self.lock();
        Ok(state
            .blockers
            .iter()
            .filter(|(_, wp)| wp == waitpoint_id)
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn completed_blockers(&self, run_id: &str) -> Result<Vec<WaitpointRecord>> {
        let state = self.lock();
        let mut result: Vec<_> = state
            .blockers
            .iter()
            .filter(|(r, _)| r == run_id)
            .filter_map(|(_, wp_id)| state.waitpoints.get(wp_id))
            .filter(|w| w.status == WaitpointStatus::Completed.as_str())
            .cloned()
            .collect();
        result.sort_by_key(|w| w.completed_at);
        Ok(result)
    }

    async fn clear_blockers(&self, run_id: &str) -> Result<()> {
        self.lock().blockers.retain(|(r, _)| r != run_id);
        Ok(())
    }

    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        self.lock()
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.lock().checkpoints.get(checkpoint_id).cloned())
    }

    async fn create_batch(&self, batch: &BatchRecord) -> Result<()> {
        self.lock().batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        Ok(self.lock().batches.get(batch_id).cloned())
    }

    async fn complete_batch_once(
        &self,
        batch_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(batch) = state.batches.get_mut(batch_id) else {
            return Ok(false);
        };
        if batch.status == "COMPLETED" {
            return Ok(false);
        }
        batch.status = "COMPLETED".to_string();
        batch.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn unfinished_batch_run_count(&self, batch_id: &str) -> Result<i64> {
        let state = self.lock();
        let count = state
            .runs
            .values()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id) && r.completed_at.is_none())
            .count();
        Ok(count as i64)
    }

    async fn enqueue_job(
        &self,
        dedup_key: Option<&str>,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(key) = dedup_key {
            state.jobs.retain(|j| j.dedup_key.as_deref() != Some(key));
        }
        state.next_job_id += 1;
        let job = ScheduledJobRecord {
            id: state.next_job_id,
            dedup_key: dedup_key.map(str::to_string),
            payload: payload.to_string(),
            run_at,
            attempts: 0,
            created_at: Utc::now(),
        };
        state.jobs.push(job);
        Ok(())
    }

    async fn cancel_job(&self, dedup_key: &str) -> Result<()> {
        self.lock()
            .jobs
            .retain(|j| j.dedup_key.as_deref() != Some(dedup_key));
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJobRecord>> {
        let state = self.lock();
        let mut due: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| j.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.run_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete_job(&self, job_id: i64) -> Result<()> {
        self.lock().jobs.retain(|j| j.id != job_id);
        Ok(())
    }

    async fn reschedule_job(
        &self,
        job_id: i64,
        run_at: DateTime<Utc>,
        attempts: i32,
    ) -> Result<()> {
        let mut state = self.lock();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
            job.run_at = run_at;
            job.attempts = attempts;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// A minimal run record for tests.
pub(crate) fn sample_run(id: &str, environment_id: &str) -> TaskRunRecord {
    TaskRunRecord {
        id: id.to_string(),
        friendly_id: format!("run_{id}"),
        status: RunStatus::Pending.as_str().to_string(),
        organization_id: "org_1".to_string(),
        project_id: "proj_1".to_string(),
        environment_id: environment_id.to_string(),
        environment_type: "DEPLOYED".to_string(),
        task_identifier: "my-task".to_string(),
        queue_name: "default".to_string(),
        payload: "{}".to_string(),
        payload_type: "application/json".to_string(),
        queue_timestamp: Utc::now(),
        priority_ms: 0,
        concurrency_key: None,
        idempotency_key: None,
        idempotency_key_expires_at: None,
        max_attempts: 3,
        attempt_number: 0,
        max_duration_seconds: None,
        machine_preset: None,
        delay_until: None,
        ttl_expires_at: None,
        parent_run_id: None,
        root_run_id: None,
        resume_parent_on_completion: false,
        batch_id: None,
        schedule_id: None,
        deployed_version: Some("20260830.1".to_string()),
        master_queue: format!("env:{environment_id}"),
        secondary_master_queue: None,
        associated_waitpoint_id: format!("wp_{id}"),
        output: None,
        error: None,
        created_at: Utc::now(),
        completed_at: None,
    }
}
