// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass Engine - Durable Task Run Orchestration
//!
//! This crate orchestrates the full lifecycle of task runs: fair multi-tenant
//! queueing, an append-only execution state machine, waitpoints, checkpoints
//! and heartbeat-based stall recovery. Relational state lives in PostgreSQL
//! or SQLite; queues, concurrency sets and distributed locks live in a shared
//! key-value store (`windlass-keyval`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        API Callers                               │
//! │            (trigger, cancel, waitpoints, batches)                │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RunEngine                                 │
//! │   trigger / dequeue / job worker                                 │
//! │   ┌──────────┬──────────┬────────────┬─────────┬──────────┐     │
//! │   │ snapshot │ attempt  │ waitpoint  │ checkpt │ schedule │ ... │
//! │   └──────────┴──────────┴────────────┴─────────┴──────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//!        │                            │                      ▲
//!        ▼                            ▼                      │ dequeue
//! ┌──────────────────┐     ┌─────────────────────┐   ┌───────────────┐
//! │  PostgreSQL /    │     │  Key-value store    │   │   Workers     │
//! │  SQLite          │     │  (queues, locks,    │   │  (attempt     │
//! │  (runs, snaps,   │     │   concurrency)      │   │   executors)  │
//! │   jobs, ...)     │     └─────────────────────┘   └───────────────┘
//! └──────────────────┘
//! ```
//!
//! # Execution State Machine
//!
//! Each run's state is an append-only series of execution snapshots; the
//! latest snapshot is authoritative. `PENDING_CANCEL` is reachable from any
//! non-terminal status and is omitted below for legibility.
//!
//! ```text
//!   ┌─────────────┐ delay / version      ┌────────┐
//!   │ RUN_CREATED │─────────────────────▶│ QUEUED │◀───────────── retry
//!   └─────────────┘   elapses/deploys    └───┬────┘
//!                                            │ dequeue
//!                                            ▼
//!                                  ┌───────────────────┐
//!                       ┌─────────▶│ PENDING_EXECUTING │
//!                       │          └────────┬──────────┘
//!                       │ dequeue           │ start attempt
//!                       │                   ▼
//!              ┌────────┴─────────┐    ┌───────────┐  complete   ┌──────────┐
//!              │ QUEUED_EXECUTING │    │ EXECUTING │────────────▶│ FINISHED │
//!              └──────────────────┘    └─────┬─────┘             └──────────┘
//!                       ▲                    │ block on waitpoints
//!                       │ unblocked          ▼
//!                       │         ┌──────────────────────────┐
//!               ┌───────┴───┐     │ EXECUTING_WITH_WAITPOINTS│
//!               │ SUSPENDED │◀────└──────────────────────────┘
//!               └───────────┘  checkpoint
//! ```
//!
//! # Fair Dequeueing
//!
//! Consumers dequeue from a master queue that tracks the oldest member of
//! every tenant queue routed through it. Selection filters out environments
//! at their concurrency limit, weights the rest by available capacity and
//! queue age, and orders each environment's queues by a blend of strict age
//! and random shuffle controlled by `queue_age_randomization`.
//!
//! # Stall Recovery
//!
//! Every status that expects an executor heartbeat arms a deadline job when
//! it is entered. A missed deadline requeues undelivered runs (bounded by
//! `max_dequeues`), retries or fails stalled attempts, and finalizes runs
//! whose cancellation was never acknowledged. Development environments are
//! the exception: their runs are finalized immediately because the attached
//! local worker is gone.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (see [`config`]):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WINDLASS_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `WINDLASS_LOCK_TTL_MS` | No | `5000` | Run lock time-to-live |
//! | `WINDLASS_QUEUE_AGE_RANDOMIZATION` | No | `0.3` | Fairness randomization, 0.0..=1.0 |
//! | `WINDLASS_MAX_DEQUEUES` | No | `10` | Delivery attempts before a run fails |
//! | `WINDLASS_WORKER_POLL_INTERVAL_MS` | No | `500` | Scheduled-job poll interval |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`engine`]: The [`engine::RunEngine`] facade (trigger, dequeue, worker)
//! - [`error`]: Error types with stable error codes
//! - [`events`]: In-process event bus
//! - [`jobs`]: Scheduled-job payload catalog
//! - [`lock`]: Distributed run locks over the key-value store
//! - [`persistence`]: Relational storage trait and backends
//! - [`queue`]: Tenant queues, master queues and fair selection
//! - [`systems`]: The engine subsystems (snapshots, attempts, waitpoints, ...)
//! - [`types`]: Public request/response types

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// The engine facade wiring all subsystems together.
pub mod engine;

/// Error types for engine operations with stable error codes.
pub mod error;

/// In-process event bus for run lifecycle notifications.
pub mod events;

/// Scheduled-job payloads for time-based transitions.
pub mod jobs;

/// Distributed run locks.
pub mod lock;

/// Embedded database migrations.
pub mod migrations;

/// Relational persistence for runs, snapshots, waitpoints and jobs.
pub mod persistence;

/// Run queues, master queues and fair multi-tenant selection.
pub mod queue;

/// The engine subsystems.
pub mod systems;

/// Public request and response types.
pub mod types;

pub use config::EngineConfig;
pub use engine::RunEngine;
pub use error::{EngineError, Result};
