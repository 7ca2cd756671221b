// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for keel-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use keel_core::persistence::{MemoryPersistence, NewInstance, Persistence, SqlitePersistence};

/// Both backends, labelled for assertion messages. The temp dir must outlive
/// the SQLite backend.
pub async fn backends() -> (Vec<(&'static str, Arc<dyn Persistence>)>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let sqlite = SqlitePersistence::from_path(dir.path().join("data/keel.db"))
        .await
        .expect("Failed to open SQLite store");

    let backends: Vec<(&'static str, Arc<dyn Persistence>)> = vec![
        ("memory", Arc::new(MemoryPersistence::new())),
        ("sqlite", Arc::new(sqlite)),
    ];
    (backends, dir)
}

pub fn instance(instance_id: &str) -> NewInstance {
    NewInstance {
        instance_id: instance_id.to_string(),
        tenant_id: "tenant-a".to_string(),
        name: format!("{}-name", instance_id),
        flavor_id: "m1.small".to_string(),
        volume_size: Some(2),
        datastore_version_id: "pg-16".to_string(),
        ..Default::default()
    }
}
