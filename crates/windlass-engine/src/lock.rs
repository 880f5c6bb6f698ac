// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TTL-bound distributed locks over run identifiers.
//!
//! Every run-mutating sequence acquires the run's lock before reading the
//! latest snapshot and before writing a new one. The lock is held for
//! milliseconds, not for the attempt duration. A guard exposes expiry so
//! callers abort instead of committing on a stale assumption.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;
use windlass_keyval::KeyValueStore;

use crate::error::{EngineError, Result};

/// Acquires and releases TTL-bound locks in the shared store.
#[derive(Clone)]
pub struct RunLockService {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    acquire_timeout: Duration,
}

/// Proof of lock ownership, passed to the protected section.
pub struct RunLockGuard {
    resources: Vec<String>,
    expires_at: Instant,
}

impl RunLockGuard {
    /// Whether the lock TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Error if the lock TTL has elapsed. Call before committing writes.
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_expired() {
            return Err(EngineError::LockExpired {
                resource: self.resources.join(","),
            });
        }
        Ok(())
    }
}

impl RunLockService {
    /// Create a lock service over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, acquire_timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            acquire_timeout,
        }
    }

    /// Run `f` while holding locks on every id in `resource_ids`.
    ///
    /// Ids are sorted and deduplicated before acquisition so concurrent
    /// callers locking overlapping sets cannot deadlock. Acquisition retries
    /// with backoff until `acquire_timeout` elapses, then fails with
    /// [`EngineError::LockTimeout`].
    pub async fn with_lock<T, F, Fut>(&self, resource_ids: &[&str], f: F) -> Result<T>
    where
        F: FnOnce(RunLockGuard) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ids: Vec<String> = resource_ids.iter().map(|s| s.to_string()).collect();
        ids.sort();
        ids.dedup();

        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;

        let acquired = self.acquire_all(&ids, &token, deadline).await?;
        if !acquired {
            return Err(EngineError::LockTimeout {
                resource: ids.join(","),
            });
        }

        let guard = RunLockGuard {
            resources: ids.clone(),
            expires_at: Instant::now() + self.ttl,
        };

        let result = f(guard).await;
        self.release_all(&ids, &token).await;
        result
    }

    async fn acquire_all(&self, ids: &[String], token: &str, deadline: Instant) -> Result<bool> {
        let mut backoff = Duration::from_millis(5);
        loop {
            match self.try_acquire_all(ids, token).await? {
                true => return Ok(true),
                false if Instant::now() >= deadline => return Ok(false),
                false => {
                    tokio::time::sleep(backoff.min(deadline - Instant::now())).await;
                    backoff = (backoff * 2).min(Duration::from_millis(100));
                }
            }
        }
    }

    /// Acquire every lock or none: a partial acquisition is rolled back so
    /// two callers contending on overlapping sets cannot hold half each.
    async fn try_acquire_all(&self, ids: &[String], token: &str) -> Result<bool> {
        let mut held = Vec::with_capacity(ids.len());
        for id in ids {
            let key = lock_key(id);
            if self.store.set_nx_ex(&key, token, self.ttl).await? {
                held.push(key);
            } else {
                for key in &held {
                    if let Err(e) = self.store.delete_if_eq(key, token).await {
                        warn!(key = %key, error = %e, "Failed to roll back partial lock");
                    }
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn release_all(&self, ids: &[String], token: &str) {
        for id in ids {
            let key = lock_key(id);
            match self.store.delete_if_eq(&key, token).await {
                // Expired and possibly re-acquired by someone else; the token
                // compare already protected us from deleting their lock.
                Ok(false) => {}
                Ok(true) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to release lock"),
            }
        }
    }
}

fn lock_key(id: &str) -> String {
    format!("lock:{id}")
}
