// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic status reporting.
//!
//! Each tick calls [`GuestStatusMachine::update`], which probes the engine and
//! sends a heartbeat. Ticks are skipped while prepare has not completed, while
//! a restart is in progress, or while a previous update is still running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::status::GuestStatusMachine;

/// Background worker reporting the engine status at a fixed interval.
pub struct StatusReporter {
    status: Arc<GuestStatusMachine>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl StatusReporter {
    pub fn new(status: Arc<GuestStatusMachine>, interval: Duration) -> Self {
        Self {
            status,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            instance_id = %self.status.instance_id(),
            interval_secs = self.interval.as_secs(),
            "Status reporter started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status reporter received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.status.update().await {
                        error!(instance_id = %self.status.instance_id(), error = %e, "Failed to report status");
                    }
                }
            }
        }

        info!("Status reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingHeartbeatSink, ScriptedProbe};
    use crate::status::PREPARE_END_FILENAME;
    use keel_core::status::ServiceStatus;

    #[tokio::test(start_paused = true)]
    async fn test_reports_each_interval_until_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(PREPARE_END_FILENAME), b"").unwrap();
        let sink = Arc::new(RecordingHeartbeatSink::new());
        let status = Arc::new(GuestStatusMachine::new(
            "db-1",
            dir.path(),
            Arc::new(ScriptedProbe::always(ServiceStatus::Running)),
            sink.clone(),
        ));

        let reporter = Arc::new(StatusReporter::new(status, Duration::from_secs(30)));
        let shutdown = reporter.shutdown_handle();
        let task = tokio::spawn({
            let reporter = reporter.clone();
            async move { reporter.run().await }
        });

        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown.notify_one();
        task.await.unwrap();

        assert_eq!(sink.statuses(), vec![ServiceStatus::Running; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_before_prepare_completes() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingHeartbeatSink::new());
        let status = Arc::new(GuestStatusMachine::new(
            "db-1",
            dir.path(),
            Arc::new(ScriptedProbe::always(ServiceStatus::Running)),
            sink.clone(),
        ));

        let reporter = Arc::new(StatusReporter::new(status, Duration::from_secs(30)));
        let shutdown = reporter.shutdown_handle();
        let task = tokio::spawn({
            let reporter = reporter.clone();
            async move { reporter.run().await }
        });

        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown.notify_one();
        task.await.unwrap();

        assert!(sink.statuses().is_empty());
    }
}
