// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Prepare orchestration driven through the GuestApi contract.

mod common;

use common::GuestContext;
use keel_core::guest_api::{
    BackupInfo, ClusterConfig, DatabaseSpec, GuestApi, PrepareRequest, UserSpec,
};
use keel_core::status::ServiceStatus;
use keel_guest::mock::MockDatastore;

fn request() -> PrepareRequest {
    PrepareRequest {
        packages: vec!["mock-server".to_string()],
        databases: vec![DatabaseSpec {
            name: "orders".to_string(),
            character_set: None,
            collate: None,
        }],
        users: vec![UserSpec {
            name: "app".to_string(),
            password: "secret".to_string(),
            host: None,
            databases: vec!["orders".to_string()],
        }],
        memory_mb: 2048,
        device_path: Some("/dev/vdb".to_string()),
        config_contents: Some("[mysqld]\n".to_string()),
        root_password: Some("root".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_prepare_success_reports_running() {
    let ctx = GuestContext::new("db-1");

    ctx.agent.prepare(request()).await.unwrap();

    let status = ctx.agent.status();
    assert!(status.is_installed());
    assert_eq!(status.status(), Some(ServiceStatus::Running));
    assert_eq!(ctx.sink.statuses().first(), Some(&ServiceStatus::Building));
    assert_eq!(ctx.sink.statuses().last(), Some(&ServiceStatus::Running));
    assert_eq!(
        ctx.steps(),
        vec![
            "install_packages",
            "mount_volume",
            "write_config",
            "start",
            "secure",
            "create_databases",
            "create_users",
            "post_prepare",
        ]
    );
}

#[tokio::test]
async fn test_prepare_failure_mid_sequence_ends_failed() {
    let ctx = GuestContext::new("db-1");
    ctx.datastore.fail_step("restore");

    let err = ctx
        .agent
        .prepare(PrepareRequest {
            backup_info: Some(BackupInfo {
                id: "backup-1".to_string(),
                location: "swift://backups/backup-1".to_string(),
                checksum: None,
            }),
            ..request()
        })
        .await
        .unwrap_err();

    assert_eq!(err.code, "DATASTORE_ERROR");
    let status = ctx.agent.status();
    assert!(!status.is_installed());
    assert_eq!(status.status(), Some(ServiceStatus::Failed));
    let steps = ctx.steps();
    assert!(!steps.contains(&"start".to_string()));
    assert!(!steps.contains(&"create_databases".to_string()));
    assert!(!steps.contains(&"post_prepare".to_string()));
}

#[tokio::test]
async fn test_restore_skips_hardening() {
    let ctx = GuestContext::new("db-1");

    ctx.agent
        .prepare(PrepareRequest {
            backup_info: Some(BackupInfo {
                id: "backup-1".to_string(),
                location: "swift://backups/backup-1".to_string(),
                checksum: Some("abc".to_string()),
            }),
            ..request()
        })
        .await
        .unwrap();

    let steps = ctx.steps();
    assert!(steps.contains(&"restore".to_string()));
    assert!(!steps.contains(&"secure".to_string()));
}

#[tokio::test]
async fn test_cluster_member_waits_for_cluster_complete() {
    let ctx = GuestContext::new("db-1");

    ctx.agent
        .prepare(PrepareRequest {
            cluster_config: Some(ClusterConfig {
                cluster_id: "cluster-1".to_string(),
                instance_type: "member".to_string(),
            }),
            ..request()
        })
        .await
        .unwrap();

    let status = ctx.agent.status();
    assert!(!status.is_installed());
    assert_eq!(status.status(), Some(ServiceStatus::InstanceReady));
    assert!(!ctx.steps().contains(&"create_databases".to_string()));
    assert!(ctx.steps().contains(&"post_prepare".to_string()));

    ctx.agent.cluster_complete().await.unwrap();
    assert!(status.is_installed());
    assert_eq!(status.status(), Some(ServiceStatus::Running));
}

#[tokio::test]
async fn test_user_creation_failure_keeps_status() {
    let ctx = GuestContext::new("db-1");
    ctx.datastore.fail_step("create_users");

    let err = ctx.agent.prepare(request()).await.unwrap_err();

    assert_eq!(err.code, "DATASTORE_ERROR");
    let status = ctx.agent.status();
    assert!(status.is_installed());
    assert_eq!(status.status(), Some(ServiceStatus::Running));
    assert!(!ctx.steps().contains(&"post_prepare".to_string()));
}

#[tokio::test]
async fn test_missing_capability_is_unsupported() {
    let ctx = GuestContext::with_datastore("db-1", MockDatastore::engine_only());

    let err = ctx.agent.prepare(request()).await.unwrap_err();

    assert_eq!(err.code, "UNSUPPORTED");
    assert!(err.message.contains("install_packages"));
    assert_eq!(ctx.agent.status().status(), Some(ServiceStatus::Failed));
}

#[tokio::test]
async fn test_engine_only_datastore_prepares_minimal_request() {
    let ctx = GuestContext::with_datastore("db-1", MockDatastore::engine_only());

    ctx.agent
        .prepare(PrepareRequest {
            memory_mb: 512,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(ctx.agent.status().status(), Some(ServiceStatus::Running));
    assert_eq!(ctx.steps(), vec!["start", "post_prepare"]);
}

#[tokio::test]
async fn test_engine_that_never_starts_fails_prepare() {
    let ctx = GuestContext::new("db-1");
    ctx.datastore.fail_step("start");

    let err = ctx.agent.prepare(request()).await.unwrap_err();

    assert_eq!(err.code, "ENGINE_START_FAILED");
    assert!(!ctx.agent.status().is_installed());
    assert_eq!(ctx.agent.status().status(), Some(ServiceStatus::Failed));
}
