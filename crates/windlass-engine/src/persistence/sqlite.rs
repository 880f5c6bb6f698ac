// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{EngineError, Result, is_unique_violation};
use crate::migrations;

use super::{
    BatchRecord, CheckpointRecord, Persistence, RunStatus, ScheduledJobRecord, SnapshotRecord,
    TaskRunRecord, WaitpointRecord, WaitpointStatus,
};

const RUN_COLUMNS: &str = "id, friendly_id, status, organization_id, project_id, environment_id, \
     environment_type, task_identifier, queue_name, payload, payload_type, queue_timestamp, \
     priority_ms, concurrency_key, idempotency_key, idempotency_key_expires_at, max_attempts, \
     attempt_number, max_duration_seconds, machine_preset, delay_until, ttl_expires_at, \
     parent_run_id, root_run_id, resume_parent_on_completion, batch_id, schedule_id, \
     deployed_version, master_queue, secondary_master_queue, associated_waitpoint_id, output, \
     error, created_at, completed_at";

const SNAPSHOT_COLUMNS: &str = "id, run_id, seq, execution_status, run_status, environment_id, \
     environment_type, description, worker_id, runner_id, checkpoint_id, completed_waitpoint_ids, \
     created_at";

const WAITPOINT_COLUMNS: &str = "id, kind, status, environment_id, completed_by_run_id, \
     idempotency_key, scheduled_for, output, output_is_error, completed_at, created_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// with sensible defaults and runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_run_with_snapshot(
        &self,
        run: &TaskRunRecord,
        snapshot: &SnapshotRecord,
        run_waitpoint: &WaitpointRecord,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO waitpoints (id, kind, status, environment_id, completed_by_run_id,
                                    idempotency_key, scheduled_for, output, output_is_error,
                                    completed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_waitpoint.id)
        .bind(&run_waitpoint.kind)
        .bind(&run_waitpoint.status)
        .bind(&run_waitpoint.environment_id)
        .bind(&run_waitpoint.completed_by_run_id)
        .bind(&run_waitpoint.idempotency_key)
        .bind(run_waitpoint.scheduled_for)
        .bind(&run_waitpoint.output)
        .bind(run_waitpoint.output_is_error)
        .bind(run_waitpoint.completed_at)
        .bind(run_waitpoint.created_at)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO task_runs ({RUN_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
                     ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&run.id)
        .bind(&run.friendly_id)
        .bind(&run.status)
        .bind(&run.organization_id)
        .bind(&run.project_id)
        .bind(&run.environment_id)
        .bind(&run.environment_type)
        .bind(&run.task_identifier)
        .bind(&run.queue_name)
        .bind(&run.payload)
        .bind(&run.payload_type)
        .bind(run.queue_timestamp)
        .bind(run.priority_ms)
        .bind(&run.concurrency_key)
        .bind(&run.idempotency_key)
        .bind(run.idempotency_key_expires_at)
        .bind(run.max_attempts)
        .bind(run.attempt_number)
        .bind(run.max_duration_seconds)
        .bind(&run.machine_preset)
        .bind(run.delay_until)
        .bind(run.ttl_expires_at)
        .bind(&run.parent_run_id)
        .bind(&run.root_run_id)
        .bind(run.resume_parent_on_completion)
        .bind(&run.batch_id)
        .bind(&run.schedule_id)
        .bind(&run.deployed_version)
        .bind(&run.master_queue)
        .bind(&run.secondary_master_queue)
        .bind(&run.associated_waitpoint_id)
        .bind(&run.output)
        .bind(&run.error)
        .bind(run.created_at)
        .bind(run.completed_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e)
                && let Some(key) = &run.idempotency_key
            {
                return Err(EngineError::DuplicateIdempotencyKey { key: key.clone() });
            }
            return Err(e.into());
        }

        insert_snapshot(&mut tx, snapshot).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<TaskRunRecord>> {
        let record = sqlx::query_as::<_, TaskRunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRunRecord>> {
        let record = sqlx::query_as::<_, TaskRunRecord>(&format!(
            "SELECT {RUN_COLUMNS} FROM task_runs \
             WHERE environment_id = ? AND idempotency_key = ? \
               AND (idempotency_key_expires_at IS NULL OR idempotency_key_expires_at > ?)"
        ))
        .bind(environment_id)
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_run_status(&self, run_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE task_runs SET status = ? WHERE id = ?")
            .bind(status)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn increment_attempt_number(&self, run_id: &str) -> Result<i32> {
        let attempt: Option<i32> = sqlx::query_scalar(
            "UPDATE task_runs SET attempt_number = attempt_number + 1 WHERE id = ? \
             RETURNING attempt_number",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        attempt.ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    async fn finalize_run(
        &self,
        run_id: &str,
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE task_runs SET status = ?, output = ?, error = ?, completed_at = ? \
             WHERE id = ?",
        )
        .bind(status)
        .bind(output)
        .bind(error)
        .bind(completed_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run_delay(&self, run_id: &str, delay_until: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE task_runs SET delay_until = ? WHERE id = ?")
            .bind(delay_until)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn pending_version_runs(
        &self,
        environment_id: &str,
        task_identifiers: &[String],
    ) -> Result<Vec<TaskRunRecord>> {
        if task_identifiers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; task_identifiers.len()].join(", ");
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs \
             WHERE environment_id = ? AND status = ? AND task_identifier IN ({placeholders}) \
             ORDER BY created_at ASC"
        );

        let mut query = sqlx::query_as::<_, TaskRunRecord>(&sql)
            .bind(environment_id)
            .bind(RunStatus::PendingVersion.as_str());
        for task_identifier in task_identifiers {
            query = query.bind(task_identifier);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn create_snapshot(&self, snapshot: &SnapshotRecord) -> Result<SnapshotRecord> {
        let mut tx = self.pool.begin().await?;
        let seq = insert_snapshot(&mut tx, snapshot).await?;
        tx.commit().await?;

        let mut created = snapshot.clone();
        created.seq = seq;
        Ok(created)
    }

    async fn latest_snapshot(&self, run_id: &str) -> Result<Option<SnapshotRecord>> {
        let record = sqlx::query_as::<_, SnapshotRecord>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM execution_snapshots \
             WHERE run_id = ? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let record = sqlx::query_as::<_, SnapshotRecord>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM execution_snapshots WHERE id = ?"
        ))
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn snapshots_since(
        &self,
        run_id: &str,
        snapshot_id: &str,
    ) -> Result<Vec<SnapshotRecord>> {
        let records = sqlx::query_as::<_, SnapshotRecord>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM execution_snapshots \
             WHERE run_id = ? \
               AND seq > (SELECT seq FROM execution_snapshots WHERE id = ?) \
             ORDER BY seq ASC"
        ))
        .bind(run_id)
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn create_waitpoint(&self, waitpoint: &WaitpointRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO waitpoints ({WAITPOINT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&waitpoint.id)
        .bind(&waitpoint.kind)
        .bind(&waitpoint.status)
        .bind(&waitpoint.environment_id)
        .bind(&waitpoint.completed_by_run_id)
        .bind(&waitpoint.idempotency_key)
        .bind(waitpoint.scheduled_for)
        .bind(&waitpoint.output)
        .bind(waitpoint.output_is_error)
        .bind(waitpoint.completed_at)
        .bind(waitpoint.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_waitpoint(&self, waitpoint_id: &str) -> Result<Option<WaitpointRecord>> {
        let record = sqlx::query_as::<_, WaitpointRecord>(&format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints WHERE id = ?"
        ))
        .bind(waitpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_manual_waitpoint_by_key(
        &self,
        environment_id: &str,
        key: &str,
    ) -> Result<Option<WaitpointRecord>> {
        let record = sqlx::query_as::<_, WaitpointRecord>(&format!(
            "SELECT {WAITPOINT_COLUMNS} FROM waitpoints \
             WHERE environment_id = ? AND idempotency_key = ? AND kind = 'MANUAL' \
               AND status = ? \
             LIMIT 1"
        ))
        .bind(environment_id)
        .bind(key)
        .bind(WaitpointStatus::Pending.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn complete_waitpoint_once(
        &self,
        waitpoint_id: &str,
        output: Option<&str>,
        output_is_error: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE waitpoints \
             SET status = ?, output = ?, output_is_error = ?, completed_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(WaitpointStatus::Completed.as_str())
        .bind(output)
        .bind(output_is_error)
        .bind(completed_at)
        .bind(waitpoint_id)
        .bind(WaitpointStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn add_run_blockers(&self, run_id: &str, waitpoint_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for waitpoint_id in waitpoint_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO task_run_waitpoints (run_id, waitpoint_id) VALUES (?, ?)",
            )
            .bind(run_id)
            .bind(waitpoint_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn pending_blocker_count(&self, run_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_run_waitpoints j \
             JOIN waitpoints w ON w.id = j.waitpoint_id \
             WHERE j.run_id = ? AND w.status = ?",
        )
        .bind(run_id)
        .bind(WaitpointStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn blocked_run_ids(&self, waitpoint_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT run_id FROM task_run_waitpoints WHERE waitpoint_id = ?")
                .bind(waitpoint_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids)
    }

    async fn completed_blockers(&self, run_id: &str) -> Result<Vec<WaitpointRecord>> {
        let records = sqlx::query_as::<_, WaitpointRecord>(&format!(
            "SELECT w.{} FROM waitpoints w \
             JOIN task_run_waitpoints j ON j.waitpoint_id = w.id \
             WHERE j.run_id = ? AND w.status = ? \
             ORDER BY w.completed_at ASC",
            WAITPOINT_COLUMNS.replace(", ", ", w.")
        ))
        .bind(run_id)
        .bind(WaitpointStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn clear_blockers(&self, run_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_run_waitpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (id, run_id, snapshot_id, location, reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.run_id)
        .bind(&checkpoint.snapshot_id)
        .bind(&checkpoint.location)
        .bind(&checkpoint.reason)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let record = sqlx::query_as::<_, CheckpointRecord>(
            "SELECT id, run_id, snapshot_id, location, reason, created_at \
             FROM checkpoints WHERE id = ?",
        )
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_batch(&self, batch: &BatchRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO batches (id, environment_id, waitpoint_id, run_count, status, \
                                  created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&batch.id)
        .bind(&batch.environment_id)
        .bind(&batch.waitpoint_id)
        .bind(batch.run_count)
        .bind(&batch.status)
        .bind(batch.created_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let record = sqlx::query_as::<_, BatchRecord>(
            "SELECT id, environment_id, waitpoint_id, run_count, status, created_at, \
                    completed_at \
             FROM batches WHERE id = ?",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn complete_batch_once(
        &self,
        batch_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batches SET status = 'COMPLETED', completed_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(completed_at)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unfinished_batch_run_count(&self, batch_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_runs WHERE batch_id = ? AND completed_at IS NULL",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn enqueue_job(
        &self,
        dedup_key: Option<&str>,
        payload: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_jobs (dedup_key, payload, run_at, attempts, created_at) \
             VALUES (?, ?, ?, 0, ?) \
             ON CONFLICT (dedup_key) DO UPDATE SET \
                 payload = excluded.payload, run_at = excluded.run_at, attempts = 0",
        )
        .bind(dedup_key)
        .bind(payload)
        .bind(run_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_job(&self, dedup_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE dedup_key = ?")
            .bind(dedup_key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJobRecord>> {
        let records = sqlx::query_as::<_, ScheduledJobRecord>(
            "SELECT id, dedup_key, payload, run_at, attempts, created_at \
             FROM scheduled_jobs WHERE run_at <= ? ORDER BY run_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_job(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reschedule_job(
        &self,
        job_id: i64,
        run_at: DateTime<Utc>,
        attempts: i32,
    ) -> Result<()> {
        sqlx::query("UPDATE scheduled_jobs SET run_at = ?, attempts = ? WHERE id = ?")
            .bind(run_at)
            .bind(attempts)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    snapshot: &SnapshotRecord,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO execution_snapshots (id, run_id, execution_status, run_status,
                                         environment_id, environment_type, description,
                                         worker_id, runner_id, checkpoint_id,
                                         completed_waitpoint_ids, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.run_id)
    .bind(&snapshot.execution_status)
    .bind(&snapshot.run_status)
    .bind(&snapshot.environment_id)
    .bind(&snapshot.environment_type)
    .bind(&snapshot.description)
    .bind(&snapshot.worker_id)
    .bind(&snapshot.runner_id)
    .bind(&snapshot.checkpoint_id)
    .bind(&snapshot.completed_waitpoint_ids)
    .bind(snapshot.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}
