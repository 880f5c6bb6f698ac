// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run queueing over the shared store.
//!
//! Each tenant queue is a sorted set of run ids scored by priority timestamp
//! (lower score serves first). Master queues are sorted sets of queue keys
//! scored by the oldest member of each queue. Concurrency is tracked as a
//! membership set (current) plus a counter (limit) per environment, and per
//! queue when a queue declares its own limit.

pub mod fair;

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use windlass_keyval::KeyValueStore;

use crate::error::Result;
use crate::persistence::TaskRunRecord;

/// Priority offset applied to resumed runs, in milliseconds (ten years).
///
/// Subtracting it from the queue score puts resumed work ahead of any fresh
/// work in age order without a special-case comparison anywhere.
pub const RESUME_PRIORITY_OFFSET_MS: i64 = 315_360_000_000;

/// Queue score for a fresh enqueue of this run.
pub fn queue_score(run: &TaskRunRecord) -> i64 {
    run.queue_timestamp.timestamp_millis() - run.priority_ms
}

/// Queue score for requeueing a resumed (previously suspended) run.
pub fn resume_score(run: &TaskRunRecord) -> i64 {
    queue_score(run) - RESUME_PRIORITY_OFFSET_MS
}

pub(crate) fn sub_queue_key(queue_key: &str) -> String {
    format!("queue:{queue_key}")
}

pub(crate) fn master_key(master_queue: &str) -> String {
    format!("master:{master_queue}")
}

pub(crate) fn env_current_key(environment_id: &str) -> String {
    format!("env:{environment_id}:cur")
}

pub(crate) fn env_limit_key(environment_id: &str) -> String {
    format!("env:{environment_id}:limit")
}

pub(crate) fn queue_current_key(queue_key: &str) -> String {
    format!("queue:{queue_key}:cur")
}

pub(crate) fn queue_limit_key(queue_key: &str) -> String {
    format!("queue:{queue_key}:limit")
}

fn nack_key(run_id: &str) -> String {
    format!("nacks:{run_id}")
}

/// The environment id portion of a queue key (`{env_id}:{queue_name}...`).
pub(crate) fn environment_of_queue_key(queue_key: &str) -> &str {
    queue_key.split(':').next().unwrap_or(queue_key)
}

/// A run claimed from a queue, with what is needed to roll the claim back.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    /// The claimed run id.
    pub run_id: String,
    /// The queue it was claimed from.
    pub queue_key: String,
    /// The score it was queued at.
    pub score: i64,
}

/// Queue operations over the shared store.
#[derive(Clone)]
pub struct RunQueue {
    store: Arc<dyn KeyValueStore>,
}

impl RunQueue {
    /// Create a queue over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Place the run into its tenant queue at `score` and refresh its master
    /// queues.
    pub async fn enqueue(&self, run: &TaskRunRecord, score: i64) -> Result<()> {
        let queue_key = run.queue_key();
        self.store
            .zadd(&sub_queue_key(&queue_key), &run.id, score)
            .await?;
        self.refresh_masters(run).await?;
        debug!(run_id = %run.id, queue_key = %queue_key, score, "Enqueued run");
        Ok(())
    }

    /// Remove the run from its tenant queue (cancel, expire) and refresh its
    /// master queues. Returns false if the run was not queued.
    pub async fn remove(&self, run: &TaskRunRecord) -> Result<bool> {
        let removed = self
            .store
            .zrem(&sub_queue_key(&run.queue_key()), &run.id)
            .await?;
        self.refresh_masters(run).await?;
        Ok(removed)
    }

    /// Re-point the run's master queue entries at the oldest member of its
    /// tenant queue, removing them when the queue is empty.
    pub async fn refresh_masters(&self, run: &TaskRunRecord) -> Result<()> {
        let queue_key = run.queue_key();
        let oldest = self.store.zpeek_min(&sub_queue_key(&queue_key)).await?;

        let mut masters = vec![run.master_queue.as_str()];
        if let Some(secondary) = &run.secondary_master_queue {
            masters.push(secondary.as_str());
        }

        for master in masters {
            match &oldest {
                Some(member) => {
                    self.store
                        .zadd(&master_key(master), &queue_key, member.score)
                        .await?;
                }
                None => {
                    self.store.zrem(&master_key(master), &queue_key).await?;
                }
            }
        }
        Ok(())
    }

    /// Try to claim the oldest due run from a queue, taking an environment
    /// (and queue, when limited) concurrency slot.
    ///
    /// Returns `None` when the queue has no due run or a limit is reached. A
    /// claim that later turns out unusable must be undone with
    /// [`RunQueue::rollback_claim`] so the run is neither lost nor
    /// double-claimed.
    pub async fn claim(
        &self,
        queue_key: &str,
        default_env_limit: i64,
    ) -> Result<Option<ClaimedRun>> {
        let environment_id = environment_of_queue_key(queue_key);

        let (env_current, env_limit) = self
            .env_concurrency(environment_id, default_env_limit)
            .await?;
        if env_current >= env_limit {
            return Ok(None);
        }

        if let Some(queue_limit) = self.store.get_counter(&queue_limit_key(queue_key)).await? {
            let queue_current = self.store.scard(&queue_current_key(queue_key)).await? as i64;
            if queue_current >= queue_limit {
                return Ok(None);
            }
        }

        let now_ms = Utc::now().timestamp_millis();
        let due = self
            .store
            .zrange_by_score(&sub_queue_key(queue_key), i64::MIN, now_ms, 1)
            .await?;
        let Some(candidate) = due.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may have raced us to this member.
        if !self
            .store
            .zrem(&sub_queue_key(queue_key), &candidate.member)
            .await?
        {
            return Ok(None);
        }

        self.store
            .sadd(&env_current_key(environment_id), &candidate.member)
            .await?;
        self.store
            .sadd(&queue_current_key(queue_key), &candidate.member)
            .await?;

        let claim = ClaimedRun {
            run_id: candidate.member,
            queue_key: queue_key.to_string(),
            score: candidate.score,
        };

        // The limit check and the slot take are separate store calls, so two
        // claimers in the same environment can both pass the check. Re-read
        // after taking the slot and back off when the limit was overshot.
        let (env_current, env_limit) = self
            .env_concurrency(environment_id, default_env_limit)
            .await?;
        let mut overshot = env_current > env_limit;
        if !overshot
            && let Some(queue_limit) = self.store.get_counter(&queue_limit_key(queue_key)).await?
        {
            overshot = self.store.scard(&queue_current_key(queue_key)).await? as i64 > queue_limit;
        }
        if overshot {
            debug!(run_id = %claim.run_id, queue_key, "Limit overshot under contention, rolling back claim");
            self.rollback_claim(&claim).await?;
            return Ok(None);
        }

        Ok(Some(claim))
    }

    /// Undo a claim: release the concurrency slots and put the run back at
    /// its original score.
    pub async fn rollback_claim(&self, claim: &ClaimedRun) -> Result<()> {
        let environment_id = environment_of_queue_key(&claim.queue_key);
        self.store
            .srem(&env_current_key(environment_id), &claim.run_id)
            .await?;
        self.store
            .srem(&queue_current_key(&claim.queue_key), &claim.run_id)
            .await?;
        self.store
            .zadd(&sub_queue_key(&claim.queue_key), &claim.run_id, claim.score)
            .await?;
        debug!(run_id = %claim.run_id, queue_key = %claim.queue_key, "Rolled back claim");
        Ok(())
    }

    /// Release the concurrency slots a run holds. Used on completion,
    /// suspension and waitpoint-blocking with concurrency release.
    pub async fn release_concurrency(&self, run: &TaskRunRecord) -> Result<()> {
        self.store
            .srem(&env_current_key(&run.environment_id), &run.id)
            .await?;
        self.store
            .srem(&queue_current_key(&run.queue_key()), &run.id)
            .await?;
        Ok(())
    }

    /// Re-take the concurrency slots for a run that continues executing.
    pub async fn reacquire_concurrency(&self, run: &TaskRunRecord) -> Result<()> {
        self.store
            .sadd(&env_current_key(&run.environment_id), &run.id)
            .await?;
        self.store
            .sadd(&queue_current_key(&run.queue_key()), &run.id)
            .await?;
        Ok(())
    }

    /// Push a run back onto its queue after a failed delivery, bounded by
    /// `max_dequeues`. Returns false when the nack budget is exhausted; the
    /// caller then fails the run terminally instead.
    pub async fn nack(&self, run: &TaskRunRecord, score: i64, max_dequeues: i32) -> Result<bool> {
        let nacks = self.store.incr_by(&nack_key(&run.id), 1).await?;
        if nacks > max_dequeues as i64 {
            debug!(run_id = %run.id, nacks, "Nack budget exhausted");
            return Ok(false);
        }
        self.release_concurrency(run).await?;
        self.enqueue(run, score).await?;
        Ok(true)
    }

    /// Current and limit concurrency for an environment.
    pub async fn env_concurrency(
        &self,
        environment_id: &str,
        default_limit: i64,
    ) -> Result<(i64, i64)> {
        let current = self.store.scard(&env_current_key(environment_id)).await? as i64;
        let limit = self
            .store
            .get_counter(&env_limit_key(environment_id))
            .await?
            .unwrap_or(default_limit);
        Ok((current, limit))
    }

    /// Declare an environment's concurrency limit.
    pub async fn set_env_concurrency_limit(&self, environment_id: &str, limit: i64) -> Result<()> {
        self.store
            .set_counter(&env_limit_key(environment_id), limit)
            .await?;
        Ok(())
    }

    /// Declare a queue-level concurrency limit.
    pub async fn set_queue_concurrency_limit(&self, queue_key: &str, limit: i64) -> Result<()> {
        self.store
            .set_counter(&queue_limit_key(queue_key), limit)
            .await?;
        Ok(())
    }

    /// Length of a tenant queue.
    pub async fn queue_length(&self, queue_key: &str) -> Result<u64> {
        self.store.zcard(&sub_queue_key(queue_key)).await.map_err(Into::into)
    }
}
