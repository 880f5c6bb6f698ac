// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for heartbeat-driven stall recovery.

mod common;

use common::*;

fn versioned_request(
    friendly_id: &str,
    env_id: &str,
) -> windlass_engine::types::TriggerRequest {
    let mut req = trigger_request(friendly_id, deployed_environment(env_id));
    req.deployed_version = Some("v1".to_string());
    req
}

#[tokio::test]
async fn test_undelivered_run_is_requeued() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(ctx.engine.trigger(versioned_request("run_a", "env_a")).await.unwrap());
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    let snapshot_id = dequeued[0].snapshot.id.clone();

    // The worker never started the attempt; the heartbeat deadline fires
    ctx.engine
        .snapshots()
        .handle_heartbeat_timeout(&run.id, &snapshot_id)
        .await
        .unwrap();

    let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
    assert_eq!(latest.execution_status, "QUEUED");

    // Claimable again by another consumer
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_2", "env:env_a", 1)
        .await
        .unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].run.id, run.id);
}

#[tokio::test]
async fn test_delivery_budget_exhaustion_fails_run() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(ctx.engine.trigger(versioned_request("run_a", "env_a")).await.unwrap());

    // max_dequeues is 3 in the test config
    for round in 0..4 {
        let dequeued = ctx
            .engine
            .dequeue_from_master_queue("worker_1", "env:env_a", 1)
            .await
            .unwrap();
        if dequeued.is_empty() {
            break;
        }
        ctx.engine
            .snapshots()
            .handle_heartbeat_timeout(&run.id, &dequeued[0].snapshot.id)
            .await
            .unwrap();
        let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
        if latest.execution_status == "FINISHED" {
            assert!(round >= 2, "budget exhausted too early, round {round}");
            break;
        }
    }

    let stored = ctx.run(&run.id).await;
    assert_eq!(stored.status, "SYSTEM_FAILURE");
}

#[tokio::test]
async fn test_stalled_attempt_retries_with_remaining_attempts() {
    let ctx = TestContext::new().await;
    let mut req = versioned_request("run_a", "env_a");
    req.max_attempts = Some(2);
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

    // The executor goes silent mid-attempt
    ctx.engine
        .snapshots()
        .handle_heartbeat_timeout(&run.id, &snapshot.id)
        .await
        .unwrap();

    let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
    assert_eq!(latest.execution_status, "QUEUED");
    assert_ne!(ctx.run(&run.id).await.status, "CRASHED");
}

#[tokio::test]
async fn test_stalled_final_attempt_crashes_run() {
    let ctx = TestContext::new().await;
    let mut req = versioned_request("run_a", "env_a");
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

    ctx.engine
        .snapshots()
        .handle_heartbeat_timeout(&run.id, &snapshot.id)
        .await
        .unwrap();

    assert_eq!(ctx.run(&run.id).await.status, "CRASHED");
}

#[tokio::test]
async fn test_dev_stall_is_finalized_not_recovered() {
    let ctx = TestContext::new().await;
    let (run, snapshot_id) = {
        let run = unwrap_triggered(
            ctx.engine
                .trigger(trigger_request("run_dev", dev_environment("env_dev")))
                .await
                .unwrap(),
        );
        let dequeued = ctx
            .engine
            .dequeue_from_master_queue("worker_1", "env:env_dev", 1)
            .await
            .unwrap();
        (run, dequeued[0].snapshot.id.clone())
    };

    ctx.engine
        .snapshots()
        .handle_heartbeat_timeout(&run.id, &snapshot_id)
        .await
        .unwrap();

    assert_eq!(ctx.run(&run.id).await.status, "CANCELED");
}

#[tokio::test]
async fn test_superseded_heartbeat_timeout_is_dropped() {
    let ctx = TestContext::new().await;
    let run = unwrap_triggered(ctx.engine.trigger(versioned_request("run_a", "env_a")).await.unwrap());
    let dequeued = ctx
        .engine
        .dequeue_from_master_queue("worker_1", "env:env_a", 1)
        .await
        .unwrap();
    let old_snapshot_id = dequeued[0].snapshot.id.clone();
    let (_, current) = ctx
        .engine
        .attempts()
        .start_run_attempt(&run.id, &old_snapshot_id, None, None)
        .await
        .unwrap();

    // A timer armed for the pre-attempt snapshot fires late
    ctx.engine
        .snapshots()
        .handle_heartbeat_timeout(&run.id, &old_snapshot_id)
        .await
        .unwrap();

    let latest = ctx.engine.snapshots().latest(&run.id).await.unwrap();
    assert_eq!(latest.id, current.id);
    assert_eq!(latest.execution_status, "EXECUTING");
}
