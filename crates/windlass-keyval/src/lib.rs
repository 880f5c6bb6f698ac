// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass Keyval - shared low-latency store abstraction
//!
//! The run queue and the distributed run lock sit on top of a small set of
//! primitives: sorted sets (queue ordering by priority timestamp), unordered
//! sets (concurrency membership), atomic counters (concurrency limits) and
//! plain keys with TTL (lock tokens). [`KeyValueStore`] captures exactly that
//! surface so the engine can run against a process-local [`MemoryStore`] in
//! tests and single-node deployments, or a networked backend in production.
//!
//! Scores are `i64` milliseconds. Lower score sorts first.

#![deny(missing_docs)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Result type using KeyValError.
pub type Result<T> = std::result::Result<T, KeyValError>;

/// Errors surfaced by a key-value store backend.
#[derive(Debug, thiserror::Error)]
pub enum KeyValError {
    /// The backend is unreachable or failed internally.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A member of a sorted set together with its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    /// The member value.
    pub member: String,
    /// The member's score (milliseconds; lower sorts first).
    pub score: i64,
}

/// The store surface the queue and lock subsystems need.
///
/// All operations are atomic with respect to each other for a given backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Add `member` to the sorted set at `key` with `score`, replacing any
    /// previous score for the member.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Remove `member` from the sorted set at `key`. Returns true if removed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Score of `member` in the sorted set at `key`, if present.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;

    /// Number of members in the sorted set at `key`.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Members with `min <= score <= max`, ascending by (score, member),
    /// at most `limit` entries.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>>;

    /// Lowest-scored member of the sorted set at `key`, without removing it.
    async fn zpeek_min(&self, key: &str) -> Result<Option<ScoredMember>>;

    /// Remove and return the lowest-scored member of the sorted set at `key`.
    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>>;

    /// Add `member` to the unordered set at `key`. Returns true if it was
    /// not already present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove `member` from the unordered set at `key`. Returns true if removed.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// Cardinality of the unordered set at `key`.
    async fn scard(&self, key: &str) -> Result<u64>;

    /// All members of the unordered set at `key`.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically add `delta` to the counter at `key` (created at 0) and
    /// return the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Current value of the counter at `key`, if set.
    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// Set the counter at `key` to `value`.
    async fn set_counter(&self, key: &str, value: i64) -> Result<()>;

    /// Set `key` to `value` with a TTL, only if the key does not exist.
    /// Returns true if the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Value at `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key` only if its current value equals `expected`.
    /// Returns true if the key was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Entry in the sorted-set ordering index: (score, member).
type ZEntry = (i64, String);

#[derive(Default)]
struct Inner {
    zsets: HashMap<String, ZSet>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, i64>,
    strings: HashMap<String, StringEntry>,
}

#[derive(Default)]
struct ZSet {
    by_member: HashMap<String, i64>,
    ordered: BTreeSet<ZEntry>,
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local [`KeyValueStore`] implementation.
///
/// TTLs are enforced lazily on read. Suitable for tests and single-node
/// deployments; a clustered deployment needs a shared backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; propagate the data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn zset_mut(&mut self, key: &str) -> &mut ZSet {
        self.zsets.entry(key.to_string()).or_default()
    }

    fn string_live(&mut self, key: &str) -> Option<&StringEntry> {
        if self.strings.get(key).is_some_and(StringEntry::is_expired) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut inner = self.lock();
        let zset = inner.zset_mut(key);
        if let Some(old) = zset.by_member.insert(member.to_string(), score) {
            zset.ordered.remove(&(old, member.to_string()));
        }
        zset.ordered.insert((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        match zset.by_member.remove(member) {
            Some(score) => {
                zset.ordered.remove(&(score, member.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let inner = self.lock();
        Ok(inner
            .zsets
            .get(key)
            .and_then(|z| z.by_member.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.zsets.get(key).map_or(0, |z| z.by_member.len() as u64))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<ScoredMember>> {
        let inner = self.lock();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(zset
            .ordered
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .take(limit)
            .map(|(score, member)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect())
    }

    async fn zpeek_min(&self, key: &str) -> Result<Option<ScoredMember>> {
        let inner = self.lock();
        Ok(inner.zsets.get(key).and_then(|z| {
            z.ordered.iter().next().map(|(score, member)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
        }))
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>> {
        let mut inner = self.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(None);
        };
        let Some((score, member)) = zset.ordered.iter().next().cloned() else {
            return Ok(None);
        };
        zset.ordered.remove(&(score, member.clone()));
        zset.by_member.remove(&member);
        Ok(Some(ScoredMember { member, score }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock();
        Ok(inner
            .sets
            .get_mut(key)
            .is_some_and(|s| s.remove(member)))
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut inner = self.lock();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += delta;
        Ok(*counter)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let inner = self.lock();
        Ok(inner.counters.get(key).copied())
    }

    async fn set_counter(&self, key: &str, value: i64) -> Result<()> {
        let mut inner = self.lock();
        inner.counters.insert(key.to_string(), value);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock();
        if inner.string_live(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        Ok(inner.string_live(key).map(|e| e.value.clone()))
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.lock();
        let matches = inner
            .string_live(key)
            .is_some_and(|e| e.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zadd_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("q", "b", 20).await.unwrap();
        store.zadd("q", "a", 10).await.unwrap();
        store.zadd("q", "c", 10).await.unwrap();

        let members = store.zrange_by_score("q", i64::MIN, i64::MAX, 10).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_zadd_replaces_score() {
        let store = MemoryStore::new();
        store.zadd("q", "a", 10).await.unwrap();
        store.zadd("q", "a", 5).await.unwrap();

        assert_eq!(store.zscore("q", "a").await.unwrap(), Some(5));
        assert_eq!(store.zcard("q").await.unwrap(), 1);
        let min = store.zpeek_min("q").await.unwrap().unwrap();
        assert_eq!(min.score, 5);
    }

    #[tokio::test]
    async fn test_zpop_min_removes_lowest() {
        let store = MemoryStore::new();
        store.zadd("q", "old", 1).await.unwrap();
        store.zadd("q", "new", 2).await.unwrap();

        let popped = store.zpop_min("q").await.unwrap().unwrap();
        assert_eq!(popped.member, "old");
        assert_eq!(store.zcard("q").await.unwrap(), 1);
        assert!(store.zscore("q", "old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zrange_by_score_respects_bounds_and_limit() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            store.zadd("q", member, score).await.unwrap();
        }

        let members = store.zrange_by_score("q", 2, 4, 2).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_set_membership() {
        let store = MemoryStore::new();
        assert!(store.sadd("cur", "run_1").await.unwrap());
        assert!(!store.sadd("cur", "run_1").await.unwrap());
        assert_eq!(store.scard("cur").await.unwrap(), 1);
        assert!(store.srem("cur", "run_1").await.unwrap());
        assert!(!store.srem("cur", "run_1").await.unwrap());
        assert_eq!(store.scard("cur").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.get_counter("limit").await.unwrap(), None);
        assert_eq!(store.incr_by("limit", 5).await.unwrap(), 5);
        assert_eq!(store.incr_by("limit", -2).await.unwrap(), 3);
        store.set_counter("limit", 100).await.unwrap();
        assert_eq!(store.get_counter("limit").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_set_nx_ex_and_delete_if_eq() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_nx_ex("lock:r1", "tok-a", ttl).await.unwrap());
        assert!(!store.set_nx_ex("lock:r1", "tok-b", ttl).await.unwrap());
        assert_eq!(store.get("lock:r1").await.unwrap().as_deref(), Some("tok-a"));

        // Wrong token does not release
        assert!(!store.delete_if_eq("lock:r1", "tok-b").await.unwrap());
        assert!(store.delete_if_eq("lock:r1", "tok-a").await.unwrap());
        assert!(store.get("lock:r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        assert!(
            store
                .set_nx_ex("lock:r1", "tok", Duration::from_millis(10))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("lock:r1").await.unwrap().is_none());
        // Expired key can be re-acquired
        assert!(
            store
                .set_nx_ex("lock:r1", "tok2", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }
}
