// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the core run lifecycle: trigger, dequeue, attempts,
//! retries and cancellation against a real SQLite database.

mod common;

use common::*;
use windlass_engine::types::{AttemptCompletion, AttemptDecision, TriggerResult};

#[tokio::test]
async fn test_trigger_dequeue_complete() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(
        ctx.engine
            .trigger(trigger_request("run_hello", dev_environment("env_a")))
            .await
            .unwrap(),
    );
    assert_eq!(run.status, "PENDING");

    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 10)
        .await
        .unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].snapshot.execution_status, "PENDING_EXECUTING");

    let (started, snapshot) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &dequeued[0].snapshot.id, Some("worker_1".into()), None)
        .await
        .unwrap();
    assert_eq!(started.attempt_number, 1);

    let decision = ctx
        .engine
        .attempts()
        .complete_run_attempt(
            &run.id,
            &snapshot.id,
            AttemptCompletion::Success {
                output: Some("\"sent\"".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(decision, AttemptDecision::RunFinished);

    let stored = ctx.run(&run.id).await;
    assert_eq!(stored.status, "COMPLETED");
    assert_eq!(stored.output.as_deref(), Some("\"sent\""));
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_idempotency_key_unique_in_database() {
    let ctx = TestContext::new().await;
    let mut req = trigger_request("run_a", dev_environment("env_a"));
    req.idempotency_key = Some("payment-99".to_string());
    let first = unwrap_triggered(ctx.engine.trigger(req.clone()).await.unwrap());

    req.friendly_id = "run_b".to_string();
    match ctx.engine.trigger(req).await.unwrap() {
        TriggerResult::DuplicateIdempotencyKey { existing } => {
            assert_eq!(existing.id, first.id);
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_dequeue_claims_run_once() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(
        ctx.engine
            .trigger(trigger_request("run_contended", dev_environment("env_a")))
            .await
            .unwrap(),
    );

    let (a, b) = futures::future::join(
        ctx.engine.dequeue_from_master_queue("worker_1", "env:env_a", 10),
        ctx.engine.dequeue_from_master_queue("worker_2", "env:env_a", 10),
    )
    .await;
    let claimed: Vec<_> = a.unwrap().into_iter().chain(b.unwrap()).collect();
    assert_eq!(claimed.len(), 1, "run claimed by more than one consumer");
    assert_eq!(claimed[0].run.id, run.id);
}

#[tokio::test]
async fn test_concurrent_dequeue_honors_environment_limit() {
    let ctx = TestContext::new().await;
    let mut env = dev_environment("env_a");
    env.concurrency_limit = Some(1);
    for i in 0..2 {
        unwrap_triggered(
            ctx.engine
                .trigger(trigger_request(&format!("run_{i}"), env.clone()))
                .await
                .unwrap(),
        );
    }

    let (a, b) = futures::future::join(
        ctx.engine.dequeue_from_master_queue("worker_1", "env:env_a", 10),
        ctx.engine.dequeue_from_master_queue("worker_2", "env:env_a", 10),
    )
    .await;
    let total = a.unwrap().len() + b.unwrap().len();
    assert_eq!(total, 1, "environment concurrency limit exceeded under contention");
}

#[tokio::test]
async fn test_retriable_failure_then_success() {
    let mut config = test_config();
    config.retry_base_delay = std::time::Duration::from_millis(0);
    let ctx = TestContext::with_config(config).await;

    let mut req = trigger_request("run_flaky", dev_environment("env_a"));
    req.max_attempts = Some(3);
    // Deployed-style retry goes through the queue; a dev run retries in
    // place, which is what a locally-attached worker does.
    let run = unwrap_triggered(ctx.engine.trigger(req).await.unwrap());

    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    let (_, snapshot) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &dequeued[0].snapshot.id, None, None)
        .await
        .unwrap();

    let decision = ctx
        .engine
        .attempts()
        .complete_run_attempt(
            &run.id,
            &snapshot.id,
            AttemptCompletion::Failure {
                error: "connection reset".to_string(),
                retriable: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(decision, AttemptDecision::RetryImmediately);

    let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
    assert_eq!(latest.execution_status, "PENDING_EXECUTING");

    let (started, snapshot) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &latest.id, None, None)
        .await
        .unwrap();
    assert_eq!(started.attempt_number, 2);

    ctx.engine
        .attempts()
        .complete_run_attempt(
            &run.id,
            &snapshot.id,
            AttemptCompletion::Success { output: None },
        )
        .await
        .unwrap();
    assert_eq!(ctx.run(&run.id).await.status, "COMPLETED");
}

#[tokio::test]
async fn test_exhausted_attempts_fail() {
    let ctx = TestContext::new().await;
    let mut req = trigger_request("run_doomed", dev_environment("env_a"));
    req.max_attempts = Some(1);
    let run = unwrap_triggered(ctx.engine.trigger(req).await.unwrap());

    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    let (_, snapshot) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &dequeued[0].snapshot.id, None, None)
        .await
        .unwrap();

    let decision = ctx
        .engine
        .attempts()
        .complete_run_attempt(
            &run.id,
            &snapshot.id,
            AttemptCompletion::Failure {
                error: "invalid address".to_string(),
                retriable: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(decision, AttemptDecision::RunFinished);

    let stored = ctx.run(&run.id).await;
    assert_eq!(stored.status, "FAILED");
    assert_eq!(stored.error.as_deref(), Some("invalid address"));
}

#[tokio::test]
async fn test_cancel_queued_run() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(
        ctx.engine
            .trigger(trigger_request("run_cancel", dev_environment("env_a")))
            .await
            .unwrap(),
    );

    ctx.engine
        .attempts()
        .cancel_run(&run.id, Some("no longer needed".to_string()))
        .await
        .unwrap();

    assert_eq!(ctx.run(&run.id).await.status, "CANCELED");
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 10)
        .await
        .unwrap();
    assert!(dequeued.is_empty());
}

#[tokio::test]
async fn test_cancel_executing_run_round_trip() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(
        ctx.engine
            .trigger(trigger_request("run_cancel", dev_environment("env_a")))
            .await
            .unwrap(),
    );
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    let (_, snapshot) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &dequeued[0].snapshot.id, None, None)
        .await
        .unwrap();

    let pending = ctx
        .engine
        .attempts()
        .cancel_run(&run.id, None)
        .await
        .unwrap();
    assert_eq!(pending.execution_status, "PENDING_CANCEL");
    assert!(ctx.run(&run.id).await.completed_at.is_none());

    // The executor acknowledges by reporting its (now moot) completion
    let decision = ctx
        .engine
        .attempts()
        .complete_run_attempt(
            &run.id,
            &pending.id,
            AttemptCompletion::Success { output: None },
        )
        .await
        .unwrap();
    assert_eq!(decision, AttemptDecision::RunPendingCancel);
    assert_eq!(ctx.run(&run.id).await.status, "CANCELED");
    let _ = snapshot;
}

#[tokio::test]
async fn test_delayed_run_admitted_by_job_worker() {
    let ctx = TestContext::new().await;
    let mut req = trigger_request("run_later", dev_environment("env_a"));
    req.delay_until = Some(future(30));
    let run = unwrap_triggered(ctx.engine.trigger(req).await.unwrap());
    assert_eq!(run.status, "DELAYED");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ctx.engine.tick_jobs().await.unwrap();

    let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
    assert_eq!(latest.execution_status, "QUEUED");
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    assert_eq!(dequeued.len(), 1);
}

#[tokio::test]
async fn test_ttl_expires_queued_run_only() {
    let ctx = TestContext::new().await;
    let mut req = trigger_request("run_ttl", dev_environment("env_a"));
    req.ttl_expires_at = Some(past(10));
    let run = unwrap_triggered(ctx.engine.trigger(req).await.unwrap());

    ctx.engine.tick_jobs().await.unwrap();
    assert_eq!(ctx.run(&run.id).await.status, "EXPIRED");

    // An already-dequeued run is not expired
    let mut req = trigger_request("run_ttl2", dev_environment("env_a"));
    req.ttl_expires_at = Some(future(100));
    let run2 = unwrap_triggered(ctx.engine.trigger(req).await.unwrap());
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    assert_eq!(dequeued[0].run.id, run2.id);

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    ctx.engine.tick_jobs().await.unwrap();
    assert_ne!(ctx.run(&run2.id).await.status, "EXPIRED");
}
