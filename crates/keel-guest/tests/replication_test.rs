// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest-side replication: shared snapshot capture and replica attach.

mod common;

use std::time::Duration;

use common::GuestContext;
use keel_core::guest_api::{GuestApi, Overrides, PrepareRequest, SnapshotInfo};
use keel_core::status::ServiceStatus;
use keel_guest::mock::MOCK_REPLICATION_STRATEGY;
use keel_guest::replication::ReplicaState;

fn snapshot_info(replica_number: u32) -> SnapshotInfo {
    SnapshotInfo {
        id: "snap-1".to_string(),
        master_id: "master".to_string(),
        replica_number,
        replication_strategy: MOCK_REPLICATION_STRATEGY.to_string(),
    }
}

async fn running_master() -> GuestContext {
    let ctx = GuestContext::new("master");
    ctx.agent
        .prepare(PrepareRequest {
            memory_mb: 1024,
            ..Default::default()
        })
        .await
        .unwrap();
    ctx
}

#[tokio::test]
async fn test_second_replica_reuses_first_capture() {
    let master = running_master().await;
    master
        .datastore
        .set_capture_delay(Duration::from_millis(100));

    let first = master.agent.get_replication_snapshot(snapshot_info(1), None);
    let second = master.agent.get_replication_snapshot(snapshot_info(2), None);
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(master.datastore.capture_count(), 1);
    assert_eq!(first.log_position, second.log_position);
    assert_eq!(first.dataset.snapshot_id, "snap-1");
    assert_eq!(first.dataset, second.dataset);
    assert_eq!(first.replication_strategy, MOCK_REPLICATION_STRATEGY);
    assert_eq!(
        master.agent.replication().state(),
        ReplicaState::SnapshotTaken
    );
}

#[tokio::test]
async fn test_waiting_replica_registered_before_capture() {
    let master = running_master().await;
    master
        .datastore
        .set_capture_delay(Duration::from_millis(50));

    let waiter = {
        let agent = master.agent.clone();
        tokio::spawn(async move { agent.get_replication_snapshot(snapshot_info(2), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let first = master
        .agent
        .get_replication_snapshot(snapshot_info(1), None)
        .await
        .unwrap();
    let second = waiter.await.unwrap().unwrap();

    assert_eq!(master.datastore.capture_count(), 1);
    assert_eq!(first.log_position, second.log_position);
}

#[tokio::test]
async fn test_failed_capture_fails_every_waiter() {
    let master = running_master().await;
    master.datastore.fail_step("snapshot_for_replication");

    let waiter = {
        let agent = master.agent.clone();
        tokio::spawn(async move { agent.get_replication_snapshot(snapshot_info(2), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let first = master
        .agent
        .get_replication_snapshot(snapshot_info(1), None)
        .await
        .unwrap_err();
    let second = waiter.await.unwrap().unwrap_err();

    assert_eq!(first.code, "SNAPSHOT_FAILED");
    assert_eq!(second.code, "SNAPSHOT_FAILED");
    assert_eq!(master.datastore.capture_count(), 0);
}

#[tokio::test]
async fn test_replica_prepared_from_master_snapshot() {
    let master = running_master().await;
    let snapshot = master
        .agent
        .get_replication_snapshot(snapshot_info(1), Some(Overrides::new()))
        .await
        .unwrap();

    let replica = GuestContext::new("replica-1");
    replica
        .agent
        .prepare(PrepareRequest {
            memory_mb: 1024,
            snapshot: Some(snapshot),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        replica.agent.replication().state(),
        ReplicaState::Streaming
    );
    assert!(replica.steps().contains(&"enable_as_slave".to_string()));
    assert_eq!(
        replica.agent.status().status(),
        Some(ServiceStatus::Running)
    );

    replica.agent.detach_replica(false).await.unwrap();
    assert_eq!(replica.agent.replication().state(), ReplicaState::Detached);
}

#[tokio::test]
async fn test_attach_failure_forces_failed() {
    let master = running_master().await;
    let snapshot = master
        .agent
        .get_replication_snapshot(snapshot_info(1), None)
        .await
        .unwrap();

    let replica = running_master().await;
    replica.datastore.fail_step("enable_as_slave");
    assert_eq!(
        replica.agent.status().status(),
        Some(ServiceStatus::Running)
    );

    let err = replica
        .agent
        .attach_replication_slave(snapshot, None)
        .await
        .unwrap_err();

    assert_eq!(err.code, "DATASTORE_ERROR");
    assert_eq!(replica.agent.replication().state(), ReplicaState::Failed);
    assert_eq!(replica.agent.status().status(), Some(ServiceStatus::Failed));
    assert_eq!(replica.sink.statuses().last(), Some(&ServiceStatus::Failed));
}

#[tokio::test]
async fn test_switchover_roles() {
    let master = running_master().await;
    let replica = running_master().await;

    master.agent.enable_as_master(Overrides::new()).await.unwrap();
    let context = master.agent.get_replica_context().await.unwrap();
    replica.agent.attach_replica(context, None).await.unwrap();
    assert_eq!(
        replica.agent.replication().state(),
        ReplicaState::Streaming
    );

    replica.agent.detach_replica(true).await.unwrap();
    replica
        .agent
        .enable_as_master(Overrides::new())
        .await
        .unwrap();
    master.agent.demote_replication_master().await.unwrap();

    assert_eq!(replica.agent.replication().state(), ReplicaState::Promoted);
    assert_eq!(master.agent.replication().state(), ReplicaState::None);
    assert!(master.steps().contains(&"demote_master".to_string()));
}
