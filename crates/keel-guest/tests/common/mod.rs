// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-guest integration tests.
//!
//! Provides GuestContext wiring a GuestAgent to a mock datastore and a
//! recording heartbeat sink.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_guest::GuestAgent;
use keel_guest::config::GuestConfig;
use keel_guest::mock::{MockDatastore, RecordingHeartbeatSink};

/// A guest agent under test with its collaborators.
pub struct GuestContext {
    pub agent: Arc<GuestAgent>,
    pub datastore: Arc<MockDatastore>,
    pub sink: Arc<RecordingHeartbeatSink>,
    pub guest_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl GuestContext {
    pub fn new(guest_id: &str) -> Self {
        Self::with_datastore(guest_id, MockDatastore::new())
    }

    pub fn with_datastore(guest_id: &str, datastore: MockDatastore) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let guest_dir = temp_dir.path().to_path_buf();
        let config = GuestConfig {
            guest_id: guest_id.to_string(),
            guest_dir: guest_dir.clone(),
            datastore_manager: "mock".to_string(),
            report_interval: Duration::from_secs(30),
            state_change_wait: Duration::from_millis(200),
            state_change_poll_interval: Duration::from_millis(5),
            mount_point: guest_dir.join("data"),
        };

        let datastore = Arc::new(datastore);
        let sink = Arc::new(RecordingHeartbeatSink::new());
        let agent = Arc::new(GuestAgent::new(
            config,
            datastore.clone(),
            sink.clone(),
            None,
        ));

        Self {
            agent,
            datastore,
            sink,
            guest_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Datastore steps invoked so far, in order.
    pub fn steps(&self) -> Vec<String> {
        self.datastore.calls()
    }
}
