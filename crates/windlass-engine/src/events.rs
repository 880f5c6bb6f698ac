// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus for cross-subsystem notification.
//!
//! The engine owns the bus; external attempt executors subscribe to learn
//! about runs becoming ready, cancellation requests and completions. Events
//! are advisory, not the source of truth; a slow subscriber that misses
//! events can always re-read state through the engine API.

use tokio::sync::broadcast;

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A run was created by a trigger call.
    RunCreated {
        /// The run id.
        run_id: String,
        /// The environment the run belongs to.
        environment_id: String,
    },
    /// A run was placed in its queue.
    RunQueued {
        /// The run id.
        run_id: String,
        /// The master queue the run routes through.
        master_queue: String,
    },
    /// A consumer claimed a run.
    RunDequeued {
        /// The run id.
        run_id: String,
        /// The claiming consumer.
        consumer_id: String,
    },
    /// Cancellation was requested for an in-flight run.
    CancelRequested {
        /// The run id.
        run_id: String,
    },
    /// A previously-blocked run has no pending blockers left.
    RunReadyToContinue {
        /// The run id.
        run_id: String,
    },
    /// A run reached its terminal snapshot.
    RunFinished {
        /// The run id.
        run_id: String,
        /// The final run status string.
        status: String,
    },
    /// A waitpoint completed.
    WaitpointCompleted {
        /// The waitpoint id.
        waitpoint_id: String,
    },
}

/// Broadcast channel wrapper owned by the engine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
