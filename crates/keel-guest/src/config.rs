// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest agent configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Guest agent configuration.
#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// Instance id this guest reports heartbeats for.
    pub guest_id: String,
    /// Directory holding the prepare marker files.
    pub guest_dir: PathBuf,
    /// Datastore manager name (e.g. `mysql`, `postgresql`).
    pub datastore_manager: String,
    /// Interval between periodic status reports.
    pub report_interval: Duration,
    /// Upper bound for waits on engine state changes.
    pub state_change_wait: Duration,
    /// Interval between probes while waiting for a state change.
    pub state_change_poll_interval: Duration,
    /// Where the data volume is mounted.
    pub mount_point: PathBuf,
}

impl GuestConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KEEL_GUEST_ID`: instance id of this guest
    ///
    /// Optional (with defaults):
    /// - `KEEL_GUEST_DIR`: prepare marker directory (default: `.`)
    /// - `KEEL_DATASTORE_MANAGER`: datastore manager (default: `mysql`)
    /// - `KEEL_REPORT_INTERVAL_SECS`: status report interval (default: 30)
    /// - `KEEL_STATE_CHANGE_WAIT_SECS`: engine state change wait (default: 600)
    /// - `KEEL_STATE_CHANGE_POLL_INTERVAL_SECS`: probe interval (default: 3)
    /// - `KEEL_MOUNT_POINT`: data volume mount point (default: `/var/lib/database`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let guest_id =
            std::env::var("KEEL_GUEST_ID").map_err(|_| ConfigError::Missing("KEEL_GUEST_ID"))?;
        if guest_id.trim().is_empty() {
            return Err(ConfigError::Invalid("KEEL_GUEST_ID", "must not be empty"));
        }

        let guest_dir =
            PathBuf::from(std::env::var("KEEL_GUEST_DIR").unwrap_or_else(|_| ".".to_string()));

        let datastore_manager =
            std::env::var("KEEL_DATASTORE_MANAGER").unwrap_or_else(|_| "mysql".to_string());

        let report_interval = secs_from_env("KEEL_REPORT_INTERVAL_SECS", 30)?;
        let state_change_wait = secs_from_env("KEEL_STATE_CHANGE_WAIT_SECS", 600)?;
        let state_change_poll_interval = secs_from_env("KEEL_STATE_CHANGE_POLL_INTERVAL_SECS", 3)?;
        if state_change_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "KEEL_STATE_CHANGE_POLL_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        let mount_point = PathBuf::from(
            std::env::var("KEEL_MOUNT_POINT").unwrap_or_else(|_| "/var/lib/database".to_string()),
        );

        Ok(Self {
            guest_id,
            guest_dir,
            datastore_manager,
            report_interval,
            state_change_wait,
            state_change_poll_interval,
            mount_point,
        })
    }
}

fn secs_from_env(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
