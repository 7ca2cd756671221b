// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for keel-control.

use std::time::Duration;

/// Control plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the status store
    pub database_url: String,
    /// Timeout for cheap guest calls (ping, reads)
    pub agent_call_low_timeout: Duration,
    /// Timeout for guest calls that touch the engine (restart, stop, start)
    pub agent_call_high_timeout: Duration,
    /// Timeout for replication snapshot calls
    pub agent_replication_snapshot_timeout: Duration,
    /// Upper bound for waits on service status changes
    pub state_change_wait: Duration,
    /// Interval between status store polls while waiting
    pub state_change_poll_interval: Duration,
    /// How long a new instance may take to become usable
    pub usage_timeout: Duration,
    /// Heartbeat age after which a guest is considered gone
    pub agent_heartbeat_expiry: Duration,
    /// How often the heartbeat monitor checks for stale guests
    pub heartbeat_check_interval: Duration,
    /// Largest accepted volume size in GB
    pub max_accepted_volume_size: i64,
    /// Whether instances get data volumes
    pub volume_support: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            agent_call_low_timeout: Duration::from_secs(15),
            agent_call_high_timeout: Duration::from_secs(600),
            agent_replication_snapshot_timeout: Duration::from_secs(36_000),
            state_change_wait: Duration::from_secs(600),
            state_change_poll_interval: Duration::from_secs(3),
            usage_timeout: Duration::from_secs(900),
            agent_heartbeat_expiry: Duration::from_secs(60),
            heartbeat_check_interval: Duration::from_secs(30),
            max_accepted_volume_size: 10,
            volume_support: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `KEEL_DATABASE_URL`: status store URL (e.g. `sqlite:/var/lib/keel/keel.db?mode=rwc`)
    ///
    /// Optional (with defaults):
    /// - `KEEL_AGENT_CALL_LOW_TIMEOUT_SECS`: 15
    /// - `KEEL_AGENT_CALL_HIGH_TIMEOUT_SECS`: 600
    /// - `KEEL_AGENT_REPLICATION_SNAPSHOT_TIMEOUT_SECS`: 36000
    /// - `KEEL_STATE_CHANGE_WAIT_SECS`: 600
    /// - `KEEL_STATE_CHANGE_POLL_INTERVAL_SECS`: 3
    /// - `KEEL_USAGE_TIMEOUT_SECS`: 900
    /// - `KEEL_AGENT_HEARTBEAT_EXPIRY_SECS`: 60
    /// - `KEEL_HEARTBEAT_CHECK_INTERVAL_SECS`: 30
    /// - `KEEL_MAX_ACCEPTED_VOLUME_SIZE`: 10 (GB)
    /// - `KEEL_VOLUME_SUPPORT`: true
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("KEEL_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("KEEL_DATABASE_URL"))?;

        let defaults = Self::default();

        let state_change_poll_interval = secs_from_env(
            "KEEL_STATE_CHANGE_POLL_INTERVAL_SECS",
            defaults.state_change_poll_interval,
        )?;
        if state_change_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "KEEL_STATE_CHANGE_POLL_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        let heartbeat_check_interval = secs_from_env(
            "KEEL_HEARTBEAT_CHECK_INTERVAL_SECS",
            defaults.heartbeat_check_interval,
        )?;
        if heartbeat_check_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "KEEL_HEARTBEAT_CHECK_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        let max_accepted_volume_size = match std::env::var("KEEL_MAX_ACCEPTED_VOLUME_SIZE") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::InvalidValue("KEEL_MAX_ACCEPTED_VOLUME_SIZE", "must be an integer")
            })?,
            Err(_) => defaults.max_accepted_volume_size,
        };

        let volume_support = std::env::var("KEEL_VOLUME_SUPPORT")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.volume_support);

        Ok(Self {
            database_url,
            agent_call_low_timeout: secs_from_env(
                "KEEL_AGENT_CALL_LOW_TIMEOUT_SECS",
                defaults.agent_call_low_timeout,
            )?,
            agent_call_high_timeout: secs_from_env(
                "KEEL_AGENT_CALL_HIGH_TIMEOUT_SECS",
                defaults.agent_call_high_timeout,
            )?,
            agent_replication_snapshot_timeout: secs_from_env(
                "KEEL_AGENT_REPLICATION_SNAPSHOT_TIMEOUT_SECS",
                defaults.agent_replication_snapshot_timeout,
            )?,
            state_change_wait: secs_from_env(
                "KEEL_STATE_CHANGE_WAIT_SECS",
                defaults.state_change_wait,
            )?,
            state_change_poll_interval,
            usage_timeout: secs_from_env("KEEL_USAGE_TIMEOUT_SECS", defaults.usage_timeout)?,
            agent_heartbeat_expiry: secs_from_env(
                "KEEL_AGENT_HEARTBEAT_EXPIRY_SECS",
                defaults.agent_heartbeat_expiry,
            )?,
            heartbeat_check_interval,
            max_accepted_volume_size,
            volume_support,
        })
    }
}

fn secs_from_env(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, &'static str),
}
