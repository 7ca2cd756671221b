// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Heartbeat expiry as seen through the orchestrator and the monitor.

mod common;

use std::time::Duration;

use common::{ControlContext, test_config};
use keel_control::config::Config;
use keel_control::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use keel_core::guest_api::{HeartbeatPayload, HeartbeatSink};
use keel_core::persistence::Persistence;
use keel_core::status::ServiceStatus;

#[tokio::test]
async fn test_silent_guest_marked_unknown() {
    let ctx = ControlContext::with_config(Config {
        agent_heartbeat_expiry: Duration::from_secs(60),
        ..test_config()
    });
    ctx.running_instance("db-1").await;
    ctx.running_instance("db-2").await;

    // db-1 last reported ten minutes ago
    ctx.persistence
        .init_service_status("db-1", ServiceStatus::New)
        .await
        .unwrap();
    ctx.conductor
        .heartbeat(
            "db-1",
            HeartbeatPayload {
                service_status: ServiceStatus::Running.description().to_string(),
            },
            chrono::Utc::now() - chrono::Duration::minutes(10),
        )
        .await
        .unwrap();

    let view = ctx.orchestrator.show_instance("db-1").await.unwrap();
    assert!(view.heartbeat_expired);
    assert_eq!(view.status, "ACTIVE");

    let monitor = HeartbeatMonitor::new(
        ctx.persistence.clone(),
        HeartbeatMonitorConfig::from(ctx.config.as_ref()),
    );
    assert_eq!(monitor.check_once().await.unwrap(), 1);

    assert_eq!(ctx.service_status("db-1").await, ServiceStatus::Unknown);
    assert_eq!(ctx.service_status("db-2").await, ServiceStatus::Running);
    let view = ctx.orchestrator.show_instance("db-1").await.unwrap();
    assert_eq!(view.status, "ERROR");
}

#[tokio::test]
async fn test_fresh_heartbeat_after_unknown_recovers() {
    let ctx = ControlContext::new();
    ctx.running_instance("db-1").await;
    ctx.persistence
        .set_service_status("db-1", ServiceStatus::Unknown)
        .await
        .unwrap();

    ctx.conductor
        .heartbeat(
            "db-1",
            HeartbeatPayload {
                service_status: ServiceStatus::Running.description().to_string(),
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(ctx.service_status("db-1").await, ServiceStatus::Running);
}
