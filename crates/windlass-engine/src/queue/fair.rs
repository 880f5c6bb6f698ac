// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fair selection of tenant queues from a master queue.
//!
//! Distribution answers "which queues should this consumer look at next"
//! under three constraints: environments with no remaining concurrency
//! capacity are excluded, environment order is a weighted lottery over
//! capacity and queue age so large tenants cannot starve small ones, and
//! queue order within an environment follows age with a tunable amount of
//! randomization so adjacent-age queues do not get pinned by a fixed order.
//!
//! Results are deterministic under a fixed seed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use windlass_keyval::{KeyValueStore, ScoredMember};

use crate::error::Result;

use super::{env_current_key, env_limit_key, environment_of_queue_key, master_key};

/// Tunables for fair distribution.
#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    /// Queues inspected per distribution call, oldest first.
    pub parent_queue_limit: usize,
    /// Intra-environment ordering randomization, 0.0..=1.0.
    pub queue_age_randomization: f64,
    /// Keep only the top-N environments by weight, when set.
    pub max_env_count: Option<usize>,
    /// Consecutive calls that may reuse a cached master queue snapshot.
    pub snapshot_reuse_count: usize,
    /// Concurrency limit for environments that never declared one.
    pub default_env_concurrency_limit: i64,
}

/// Queues selected for one environment, in serving order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvQueues {
    /// The environment id.
    pub environment_id: String,
    /// Queue keys to try, in order.
    pub queue_keys: Vec<String>,
}

struct CachedSnapshot {
    master_queue: String,
    members: Vec<ScoredMember>,
    uses: usize,
}

/// Capacity- and age-weighted queue selection.
pub struct FairQueueSelector {
    store: Arc<dyn KeyValueStore>,
    config: FairQueueConfig,
    rng: Mutex<StdRng>,
    // Per-consumer master queue snapshots, bounded staleness.
    snapshots: Mutex<HashMap<String, CachedSnapshot>>,
}

impl FairQueueSelector {
    /// Create a selector with an entropy-seeded RNG.
    pub fn new(store: Arc<dyn KeyValueStore>, config: FairQueueConfig) -> Self {
        Self::with_rng(store, config, StdRng::from_entropy())
    }

    /// Create a selector with a fixed seed, for reproducible tests.
    pub fn with_seed(store: Arc<dyn KeyValueStore>, config: FairQueueConfig, seed: u64) -> Self {
        Self::with_rng(store, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(store: Arc<dyn KeyValueStore>, config: FairQueueConfig, rng: StdRng) -> Self {
        Self {
            store,
            config,
            rng: Mutex::new(rng),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Select queues from `master_queue` for `consumer_id`, grouped by
    /// environment in serving order.
    pub async fn distribute(
        &self,
        master_queue: &str,
        consumer_id: &str,
    ) -> Result<Vec<EnvQueues>> {
        let members = self.snapshot(master_queue, consumer_id).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let now_ms = Utc::now().timestamp_millis();

        // Group by environment, preserving age order within each group.
        let mut envs: Vec<EnvCandidate> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for member in &members {
            let environment_id = environment_of_queue_key(&member.member).to_string();
            let i = *index.entry(environment_id.clone()).or_insert_with(|| {
                envs.push(EnvCandidate {
                    environment_id,
                    queues: Vec::new(),
                });
                envs.len() - 1
            });
            envs[i].queues.push(member.clone());
        }

        // Capacity filter: environments at their limit are excluded entirely.
        let mut weighted = Vec::with_capacity(envs.len());
        for env in envs {
            let current = self
                .store
                .scard(&env_current_key(&env.environment_id))
                .await? as i64;
            let limit = self
                .store
                .get_counter(&env_limit_key(&env.environment_id))
                .await?
                .unwrap_or(self.config.default_env_concurrency_limit);
            if limit <= 0 || current >= limit {
                debug!(environment_id = %env.environment_id, current, limit, "Environment at capacity, skipped");
                continue;
            }
            let weight = env_weight(&env.queues, current, limit, now_ms);
            weighted.push((env, weight));
        }

        if let Some(max) = self.config.max_env_count
            && weighted.len() > max
        {
            weighted.sort_by(|a, b| b.1.total_cmp(&a.1));
            weighted.truncate(max);
        }

        let mut guard = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let rng = &mut *guard;
        let ordered = weighted_order(rng, weighted);

        Ok(ordered
            .into_iter()
            .map(|env| EnvQueues {
                queue_keys: order_queues(rng, env.queues, self.config.queue_age_randomization),
                environment_id: env.environment_id,
            })
            .collect())
    }

    /// Drop any cached snapshot for a consumer, forcing a fresh read.
    pub fn invalidate(&self, consumer_id: &str) {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(consumer_id);
    }

    /// The per-consumer master queue snapshot, reused up to
    /// `snapshot_reuse_count` consecutive calls.
    async fn snapshot(&self, master_queue: &str, consumer_id: &str) -> Result<Vec<ScoredMember>> {
        {
            let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = snapshots.get_mut(consumer_id)
                && cached.master_queue == master_queue
                && cached.uses < self.config.snapshot_reuse_count
            {
                cached.uses += 1;
                return Ok(cached.members.clone());
            }
        }

        let members = self
            .store
            .zrange_by_score(
                &master_key(master_queue),
                i64::MIN,
                Utc::now().timestamp_millis(),
                self.config.parent_queue_limit,
            )
            .await?;

        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(
            consumer_id.to_string(),
            CachedSnapshot {
                master_queue: master_queue.to_string(),
                members: members.clone(),
                uses: 0,
            },
        );
        Ok(members)
    }
}

struct EnvCandidate {
    environment_id: String,
    queues: Vec<ScoredMember>,
}

/// Weight of an environment: its available capacity fraction scaled by the
/// average age of its queues. Older, emptier environments win.
fn env_weight(queues: &[ScoredMember], current: i64, limit: i64, now_ms: i64) -> f64 {
    let available_fraction = (limit - current) as f64 / limit as f64;
    let total_age: i64 = queues.iter().map(|q| (now_ms - q.score).max(1)).sum();
    let avg_age = total_age as f64 / queues.len() as f64;
    available_fraction * avg_age
}

/// Order environments by a weighted lottery: each draw picks an environment
/// with probability proportional to its weight, so first-position share
/// tracks capacity and age over many calls.
fn weighted_order(rng: &mut StdRng, mut candidates: Vec<(EnvCandidate, f64)>) -> Vec<EnvCandidate> {
    let mut ordered = Vec::with_capacity(candidates.len());
    while !candidates.is_empty() {
        let total: f64 = candidates.iter().map(|(_, w)| w.max(f64::MIN_POSITIVE)).sum();
        let mut pick = rng.gen_range(0.0..total);
        let mut chosen = candidates.len() - 1;
        for (i, (_, weight)) in candidates.iter().enumerate() {
            pick -= weight.max(f64::MIN_POSITIVE);
            if pick <= 0.0 {
                chosen = i;
                break;
            }
        }
        ordered.push(candidates.remove(chosen).0);
    }
    ordered
}

/// Order an environment's queues by age with a randomization factor:
/// 0.0 keeps strict age order, 1.0 is a full shuffle. The sort key blends
/// each queue's age rank with a random rank.
fn order_queues(rng: &mut StdRng, queues: Vec<ScoredMember>, randomization: f64) -> Vec<String> {
    let n = queues.len();
    if n <= 1 {
        return queues.into_iter().map(|q| q.member).collect();
    }

    // Queues arrive age-ordered (ascending score); index is the age rank.
    let mut shuffle_ranks: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rng.gen_range(0..=i);
        shuffle_ranks.swap(i, j);
    }

    let mut keyed: Vec<(f64, String)> = queues
        .into_iter()
        .enumerate()
        .map(|(age_rank, q)| {
            let key = age_rank as f64 * (1.0 - randomization)
                + shuffle_ranks[age_rank] as f64 * randomization;
            (key, q.member)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    keyed.into_iter().map(|(_, member)| member).collect()
}
