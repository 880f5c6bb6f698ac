// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Windlass engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,

    /// TTL on a held run lock.
    pub lock_ttl: Duration,
    /// How long a caller waits to acquire a run lock before giving up.
    pub lock_acquire_timeout: Duration,

    /// Heartbeat timeout for runs in PENDING_EXECUTING.
    pub heartbeat_timeout_pending_executing: Duration,
    /// Heartbeat timeout for runs in EXECUTING.
    pub heartbeat_timeout_executing: Duration,
    /// Heartbeat timeout for runs in EXECUTING_WITH_WAITPOINTS.
    pub heartbeat_timeout_executing_with_waitpoints: Duration,
    /// Heartbeat timeout for runs in PENDING_CANCEL.
    pub heartbeat_timeout_pending_cancel: Duration,

    /// Maximum tenant queues inspected per distribution call.
    pub parent_queue_limit: usize,
    /// Intra-environment queue ordering randomization: 0.0 = strict age
    /// order, 1.0 = fully shuffled.
    pub queue_age_randomization: f64,
    /// When set, only the top-N environments (by capacity/age weight) are
    /// considered per distribution call.
    pub max_env_count: Option<usize>,
    /// How many consecutive distribution calls may reuse a cached parent
    /// queue snapshot before a fresh read is forced.
    pub snapshot_reuse_count: usize,
    /// Concurrency limit applied to environments that never declared one.
    pub default_env_concurrency_limit: i64,
    /// Times a run may be nacked back onto its queue before it is failed
    /// with a terminal internal error.
    pub max_dequeues: i32,

    /// Default max attempts for triggered runs that don't specify one.
    pub default_max_attempts: i32,
    /// Base delay for attempt retry backoff (doubles per attempt).
    pub retry_base_delay: Duration,
    /// Upper bound on attempt retry backoff.
    pub retry_max_delay: Duration,

    /// Background job worker poll interval.
    pub worker_poll_interval: Duration,
    /// Jobs fetched per worker poll.
    pub worker_batch_size: i64,
    /// Attempts before a failing background job is dropped.
    pub job_max_attempts: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            lock_ttl: Duration::from_millis(5_000),
            lock_acquire_timeout: Duration::from_millis(10_000),
            heartbeat_timeout_pending_executing: Duration::from_secs(60),
            heartbeat_timeout_executing: Duration::from_secs(60),
            heartbeat_timeout_executing_with_waitpoints: Duration::from_secs(60),
            heartbeat_timeout_pending_cancel: Duration::from_secs(60),
            parent_queue_limit: 100,
            queue_age_randomization: 0.3,
            max_env_count: None,
            snapshot_reuse_count: 1,
            default_env_concurrency_limit: 100,
            max_dequeues: 10,
            default_max_attempts: 1,
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_secs(60),
            worker_poll_interval: Duration::from_millis(500),
            worker_batch_size: 50,
            job_max_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WINDLASS_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `WINDLASS_LOCK_TTL_MS`: run lock TTL in milliseconds (default: 5000)
    /// - `WINDLASS_HEARTBEAT_TIMEOUT_SECS`: heartbeat timeout applied to all
    ///   heartbeating statuses (default: 60)
    /// - `WINDLASS_PARENT_QUEUE_LIMIT`: queues inspected per distribution
    ///   call (default: 100)
    /// - `WINDLASS_QUEUE_AGE_RANDOMIZATION`: 0.0..=1.0 (default: 0.3)
    /// - `WINDLASS_SNAPSHOT_REUSE_COUNT`: parent queue snapshot reuse bound
    ///   (default: 1)
    /// - `WINDLASS_MAX_DEQUEUES`: nack budget per run (default: 10)
    /// - `WINDLASS_WORKER_POLL_INTERVAL_MS`: scheduled-job poll interval in
    ///   milliseconds (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WINDLASS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WINDLASS_DATABASE_URL"))?;

        let lock_ttl_ms: u64 = parse_var("WINDLASS_LOCK_TTL_MS", 5_000)?;
        let heartbeat_secs: u64 = parse_var("WINDLASS_HEARTBEAT_TIMEOUT_SECS", 60)?;
        let parent_queue_limit: usize = parse_var("WINDLASS_PARENT_QUEUE_LIMIT", 100)?;
        let snapshot_reuse_count: usize = parse_var("WINDLASS_SNAPSHOT_REUSE_COUNT", 1)?;
        let max_dequeues: i32 = parse_var("WINDLASS_MAX_DEQUEUES", 10)?;
        let worker_poll_interval_ms: u64 = parse_var("WINDLASS_WORKER_POLL_INTERVAL_MS", 500)?;

        let queue_age_randomization: f64 = parse_var("WINDLASS_QUEUE_AGE_RANDOMIZATION", 0.3)?;
        if !(0.0..=1.0).contains(&queue_age_randomization) {
            return Err(ConfigError::Invalid(
                "WINDLASS_QUEUE_AGE_RANDOMIZATION",
                "must be between 0.0 and 1.0",
            ));
        }

        let heartbeat = Duration::from_secs(heartbeat_secs);

        Ok(Self {
            database_url,
            lock_ttl: Duration::from_millis(lock_ttl_ms),
            heartbeat_timeout_pending_executing: heartbeat,
            heartbeat_timeout_executing: heartbeat,
            heartbeat_timeout_executing_with_waitpoints: heartbeat,
            heartbeat_timeout_pending_cancel: heartbeat,
            parent_queue_limit,
            queue_age_randomization,
            snapshot_reuse_count,
            max_dequeues,
            worker_poll_interval: Duration::from_millis(worker_poll_interval_ms),
            ..Self::default()
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "could not be parsed")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
