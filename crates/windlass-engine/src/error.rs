// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the windlass engine.
//!
//! Expected business outcomes (duplicate idempotency key, stale snapshot)
//! are distinct variants so callers can match on them instead of parsing
//! message strings.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur while orchestrating runs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// Run was not found in the database.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Run exists but has no execution snapshot. Indicates a broken trigger
    /// transaction; runs are always created together with their first snapshot.
    SnapshotNotFound {
        /// The run ID missing a snapshot.
        run_id: String,
    },

    /// Waitpoint was not found.
    WaitpointNotFound {
        /// The waitpoint ID that was not found.
        waitpoint_id: String,
    },

    /// Batch was not found.
    BatchNotFound {
        /// The batch ID that was not found.
        batch_id: String,
    },

    /// Checkpoint was not found.
    CheckpointNotFound {
        /// The checkpoint ID that was not found.
        checkpoint_id: String,
    },

    /// The caller presented a snapshot ID that is no longer the run's latest.
    /// Acting on a stale view risks double execution, so the operation is
    /// rejected; the caller must re-fetch and retry.
    StaleSnapshot {
        /// The run ID.
        run_id: String,
        /// The snapshot ID the caller presented.
        presented: String,
        /// The run's actual latest snapshot ID.
        latest: String,
    },

    /// The run's current execution status does not permit the operation.
    InvalidStateTransition {
        /// The run ID.
        run_id: String,
        /// The run's current execution status.
        status: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// A run with this idempotency key already exists within its expiry window.
    DuplicateIdempotencyKey {
        /// The conflicting idempotency key.
        key: String,
    },

    /// The run lock could not be acquired within the acquisition timeout.
    LockTimeout {
        /// The lock resource that timed out.
        resource: String,
    },

    /// The run lock expired while the protected section was still running.
    /// The operation must abort rather than commit on a stale assumption.
    LockExpired {
        /// The lock resource that expired.
        resource: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A persisted record could not be interpreted (unknown status string,
    /// malformed payload). Indicates schema drift, not a run-level failure.
    CorruptRecord {
        /// The entity kind (run, snapshot, waitpoint, job).
        entity: String,
        /// Details of the corruption.
        details: String,
    },

    /// Key-value store operation failed.
    StoreError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Self::WaitpointNotFound { .. } => "WAITPOINT_NOT_FOUND",
            Self::BatchNotFound { .. } => "BATCH_NOT_FOUND",
            Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::StaleSnapshot { .. } => "STALE_SNAPSHOT",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::DuplicateIdempotencyKey { .. } => "DUPLICATE_IDEMPOTENCY_KEY",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockExpired { .. } => "LOCK_EXPIRED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::StoreError { .. } => "STORE_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error represents an expected business outcome rather than
    /// an infrastructure failure.
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdempotencyKey { .. }
                | Self::StaleSnapshot { .. }
                | Self::InvalidStateTransition { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => {
                write!(f, "Run '{}' not found", run_id)
            }
            Self::SnapshotNotFound { run_id } => {
                write!(f, "Run '{}' has no execution snapshot", run_id)
            }
            Self::WaitpointNotFound { waitpoint_id } => {
                write!(f, "Waitpoint '{}' not found", waitpoint_id)
            }
            Self::BatchNotFound { batch_id } => {
                write!(f, "Batch '{}' not found", batch_id)
            }
            Self::CheckpointNotFound { checkpoint_id } => {
                write!(f, "Checkpoint '{}' not found", checkpoint_id)
            }
            Self::StaleSnapshot {
                run_id,
                presented,
                latest,
            } => {
                write!(
                    f,
                    "Snapshot '{}' is not the latest for run '{}' (latest is '{}')",
                    presented, run_id, latest
                )
            }
            Self::InvalidStateTransition {
                run_id,
                status,
                operation,
            } => {
                write!(
                    f,
                    "Run '{}' in status '{}' does not permit '{}'",
                    run_id, status, operation
                )
            }
            Self::DuplicateIdempotencyKey { key } => {
                write!(f, "A run with idempotency key '{}' already exists", key)
            }
            Self::LockTimeout { resource } => {
                write!(f, "Timed out acquiring lock on '{}'", resource)
            }
            Self::LockExpired { resource } => {
                write!(f, "Lock on '{}' expired during operation", resource)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::CorruptRecord { entity, details } => {
                write!(f, "Corrupt {} record: {}", entity, details)
            }
            Self::StoreError { operation, details } => {
                write!(f, "Store error during '{}': {}", operation, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::CorruptRecord {
            entity: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<windlass_keyval::KeyValError> for EngineError {
    fn from(err: windlass_keyval::KeyValError) -> Self {
        EngineError::StoreError {
            operation: "keyval".to_string(),
            details: err.to_string(),
        }
    }
}

/// Whether a sqlx error is a unique constraint violation. Used by the
/// persistence backends to surface idempotency conflicts as their own error.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
