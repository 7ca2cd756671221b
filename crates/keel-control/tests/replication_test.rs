// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replica attach against in-process guest agents.

mod common;

use common::ControlContext;
use keel_core::persistence::Persistence;
use keel_core::status::{InstanceTask, ServiceStatus};
use keel_guest::replication::ReplicaState;

#[tokio::test]
async fn test_attach_replicas_share_one_capture() {
    let ctx = ControlContext::new();
    let master = ctx.running_instance("master").await;
    let r1 = ctx.running_instance("replica-1").await;
    let r2 = ctx.running_instance("replica-2").await;

    let casts = ctx
        .replication
        .attach_replicas(
            "master",
            &["replica-1".to_string(), "replica-2".to_string()],
        )
        .await
        .unwrap();
    for (replica_id, cast) in casts {
        cast.await
            .unwrap()
            .unwrap_or_else(|e| panic!("attach of {} failed: {}", replica_id, e));
    }

    assert_eq!(master.datastore.capture_count(), 1);
    assert_eq!(master.agent.replication().state(), ReplicaState::SnapshotTaken);
    for replica in [&r1, &r2] {
        assert_eq!(replica.agent.replication().state(), ReplicaState::Streaming);
        assert!(replica.datastore.calls().contains(&"enable_as_slave".to_string()));
    }
    for id in ["replica-1", "replica-2"] {
        let record = ctx.persistence.get_instance(id).await.unwrap().unwrap();
        assert_eq!(record.replica_of.as_deref(), Some("master"));
    }
    let replicas = ctx.persistence.list_replicas("master").await.unwrap();
    assert_eq!(replicas.len(), 2);
}

#[tokio::test]
async fn test_attach_failure_reports_failed() {
    let ctx = ControlContext::new();
    ctx.running_instance("master").await;
    let replica = ctx.running_instance("replica-1").await;
    replica.datastore.fail_step("enable_as_slave");

    let casts = ctx
        .replication
        .attach_replicas("master", &["replica-1".to_string()])
        .await
        .unwrap();
    for (_, cast) in casts {
        let err = cast.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "GUEST_ERROR");
    }

    assert_eq!(replica.agent.replication().state(), ReplicaState::Failed);
    assert_eq!(ctx.service_status("replica-1").await, ServiceStatus::Failed);
    assert_eq!(ctx.task("replica-1").await, InstanceTask::None);
    assert_eq!(ctx.task("master").await, InstanceTask::None);

    // The next status tick must not hide the failure
    replica.agent.status().update().await.unwrap();
    assert_eq!(ctx.service_status("replica-1").await, ServiceStatus::Failed);
}

#[tokio::test]
async fn test_detach_clears_replica_of() {
    let ctx = ControlContext::new();
    ctx.running_instance("master").await;
    let replica = ctx.running_instance("replica-1").await;
    let casts = ctx
        .replication
        .attach_replicas("master", &["replica-1".to_string()])
        .await
        .unwrap();
    for (_, cast) in casts {
        cast.await.unwrap().unwrap();
    }

    ctx.replication.detach_replica("replica-1").await.unwrap();

    let record = ctx.persistence.get_instance("replica-1").await.unwrap().unwrap();
    assert_eq!(record.replica_of, None);
    assert_eq!(record.task, InstanceTask::None);
    assert_eq!(replica.agent.replication().state(), ReplicaState::Detached);
}
