// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting guests that stopped reporting.
//!
//! A guest whose last heartbeat is older than the expiry is no longer
//! trusted: its service status is overwritten with UNKNOWN. Instances with a
//! task in progress are left alone, since the owning operation decides their
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::persistence::{Persistence, ServiceStatusRecord};
use keel_core::status::{InstanceTask, ServiceStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ControlError, Result};

/// Whether the guest behind `record` has been silent for longer than `expiry`.
///
/// A guest that never sent a heartbeat is judged by when its row was written.
pub fn heartbeat_expired(
    record: &ServiceStatusRecord,
    expiry: Duration,
    now: DateTime<Utc>,
) -> bool {
    let last_seen = record.heartbeat_at.unwrap_or(record.updated_at);
    now.signed_duration_since(last_seen)
        .to_std()
        .is_ok_and(|age| age > expiry)
}

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// How often to check for stale guests.
    pub poll_interval: Duration,
    /// Heartbeat age after which a guest is considered gone.
    pub heartbeat_expiry: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            heartbeat_expiry: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for HeartbeatMonitorConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.heartbeat_check_interval,
            heartbeat_expiry: config.agent_heartbeat_expiry,
        }
    }
}

/// Background worker that marks stale guests UNKNOWN.
pub struct HeartbeatMonitor {
    persistence: Arc<dyn Persistence>,
    config: HeartbeatMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HeartbeatMonitor {
    pub fn new(persistence: Arc<dyn Persistence>, config: HeartbeatMonitorConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            heartbeat_expiry_secs = self.config.heartbeat_expiry.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Heartbeat monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check_once().await {
                        error!(error = %e, "Failed to check stale guests");
                    }
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// Run one check. Returns how many guests were marked UNKNOWN.
    pub async fn check_once(&self) -> Result<usize> {
        let expiry = chrono::Duration::from_std(self.config.heartbeat_expiry).map_err(|e| {
            ControlError::BadRequest(format!("invalid heartbeat expiry: {}", e))
        })?;
        let cutoff = Utc::now() - expiry;

        let stale = self.persistence.list_stale_service_statuses(cutoff).await?;
        if stale.is_empty() {
            debug!("No stale guests found");
            return Ok(0);
        }

        let mut marked = 0;
        for record in stale {
            match self.mark_unknown(&record).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        instance_id = %record.instance_id,
                        error = %e,
                        "Failed to mark stale guest UNKNOWN"
                    );
                }
            }
        }

        if marked > 0 {
            info!(marked, "Marked stale guests UNKNOWN");
        }
        Ok(marked)
    }

    async fn mark_unknown(&self, record: &ServiceStatusRecord) -> Result<bool> {
        if !record.status.expects_heartbeats() {
            return Ok(false);
        }
        let Some(instance) = self.persistence.get_instance(&record.instance_id).await? else {
            return Ok(false);
        };
        if instance.task != InstanceTask::None {
            debug!(
                instance_id = %record.instance_id,
                task = %instance.task,
                "Skipping stale guest with a task in progress"
            );
            return Ok(false);
        }

        warn!(
            instance_id = %record.instance_id,
            status = %record.status,
            last_heartbeat = ?record.heartbeat_at,
            "Guest heartbeat expired"
        );
        self.persistence
            .set_service_status(&record.instance_id, ServiceStatus::Unknown)
            .await?;
        Ok(true)
    }
}
