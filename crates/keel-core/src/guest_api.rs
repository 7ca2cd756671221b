// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC contract between the control plane and the guest agent.
//!
//! The message bus is out of scope; the control plane drives a [`GuestApi`]
//! implementation and bounds every call with a timeout of its own. Errors cross
//! the boundary as [`RemoteError`] so both sides can keep their own error enums.
//!
//! The guest reports back through a [`HeartbeatSink`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Configuration overrides keyed by engine parameter name.
pub type Overrides = BTreeMap<String, serde_json::Value>;

/// Error returned across the guest RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Stable machine-readable code (e.g. `ENGINE_START_FAILED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Build a remote error from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Heartbeat payload sent by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Wire description of the service status (e.g. `"running"`).
    pub service_status: String,
}

/// Receiver of guest heartbeats.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Record a heartbeat. Heartbeats older than the last accepted one are
    /// dropped and still return `Ok`.
    async fn heartbeat(
        &self,
        instance_id: &str,
        payload: HeartbeatPayload,
        sent_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
}

/// A database to create during prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    /// Database name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collate: Option<String>,
}

/// A user to create during prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Databases the user is granted access to.
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Location of a backup to restore during prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Cluster membership details handed to a cluster member at prepare time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    /// Datastore-specific role of this member (e.g. `"member"`, `"query_router"`).
    pub instance_type: String,
}

/// Everything the guest needs to bootstrap its engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// OS packages to install before anything else.
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub databases: Vec<DatabaseSpec>,
    #[serde(default)]
    pub users: Vec<UserSpec>,
    /// Memory available to the engine.
    pub memory_mb: u64,
    /// Block device to mount for data, if volumes are used.
    #[serde(default)]
    pub device_path: Option<String>,
    /// Overrides the guest's configured mount point.
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub backup_info: Option<BackupInfo>,
    /// Rendered engine configuration file.
    #[serde(default)]
    pub config_contents: Option<String>,
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default)]
    pub overrides: Option<Overrides>,
    /// Present for cluster members; defers databases, users and
    /// RUNNING until the cluster completes.
    #[serde(default)]
    pub cluster_config: Option<ClusterConfig>,
    /// Present for replicas; attach to the master after start.
    #[serde(default)]
    pub snapshot: Option<ReplicationSnapshot>,
}

/// Request for a datastore version upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub datastore_version: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Identifies a replication snapshot request sent to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot id shared by every replica created in the same batch.
    pub id: String,
    pub master_id: String,
    /// 1-based position of the replica in the batch. Only replica 1
    /// triggers the actual capture.
    pub replica_number: u32,
    pub replication_strategy: String,
}

/// Dataset metadata inside a replication snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub datastore_manager: String,
    /// Size of the captured data in GB.
    pub dataset_size: f64,
    /// Master volume size in GB, when volumes are used.
    pub volume_size: Option<u64>,
    pub snapshot_id: String,
}

/// Network address of a replication master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRef {
    pub host: String,
    pub port: u16,
}

/// Snapshot produced by a master for one replica. Consumed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSnapshot {
    pub dataset: DatasetInfo,
    pub replication_strategy: String,
    pub master: MasterRef,
    /// Engine-specific position to start streaming from.
    pub log_position: serde_json::Value,
}

/// Connection details a replica needs to follow a master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaContext {
    pub master: MasterRef,
    pub replication_strategy: String,
    #[serde(default)]
    pub replication_user: Option<String>,
}

/// Kind of guest log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    /// Always-on system log.
    Sys,
    /// User-toggleable log.
    User,
}

/// Publication state of a guest log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogStatus {
    /// Log is turned off.
    Disabled = 1,
    /// Log was enabled and is being written.
    Enabled = 2,
    /// Log file does not exist or cannot be read.
    Unavailable = 3,
    /// Log has content that was never published.
    Ready = 4,
    /// All content has been published.
    Published = 5,
    /// Some content has been published.
    Partial = 6,
    /// Toggle takes effect after the engine restarts.
    RestartRequired = 7,
}

/// Description of one guest log, as returned by `guest_log_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLogInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub status: LogStatus,
    /// Bytes already published.
    pub published: u64,
    /// Bytes waiting to be published.
    pub pending: u64,
}

/// Action requested on one guest log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLogAction {
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub discard: bool,
}

/// Operations the control plane invokes on a guest agent.
///
/// Implementations are expected to be cheap to call concurrently; the guest
/// itself serializes work that must not overlap.
#[async_trait]
pub trait GuestApi: Send + Sync {
    /// Liveness probe.
    async fn rpc_ping(&self) -> Result<(), RemoteError>;

    /// First-boot provisioning.
    async fn prepare(&self, request: PrepareRequest) -> Result<(), RemoteError>;

    /// Restart the engine inside a restart bracket.
    async fn restart(&self) -> Result<(), RemoteError>;

    /// Stop the engine.
    async fn stop_db(&self, do_not_start_on_reboot: bool) -> Result<(), RemoteError>;

    /// Start the engine, optionally writing a new configuration first.
    async fn start_db_with_conf_changes(
        &self,
        config_contents: Option<String>,
    ) -> Result<(), RemoteError>;

    /// Persist configuration overrides. With `remove` the keys are dropped.
    async fn update_overrides(&self, overrides: Overrides, remove: bool)
    -> Result<(), RemoteError>;

    /// Apply overrides to the running engine without a restart.
    async fn apply_overrides(&self, overrides: Overrides) -> Result<(), RemoteError>;

    /// Upgrade the engine to another datastore version.
    async fn upgrade(&self, request: UpgradeRequest) -> Result<(), RemoteError>;

    /// Produce a replication snapshot for one replica (called on the master).
    async fn get_replication_snapshot(
        &self,
        snapshot_info: SnapshotInfo,
        replica_source_config: Option<Overrides>,
    ) -> Result<ReplicationSnapshot, RemoteError>;

    /// Attach this guest as a replica using a snapshot (called on the replica).
    async fn attach_replication_slave(
        &self,
        snapshot: ReplicationSnapshot,
        slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError>;

    /// Stop replicating from the master.
    async fn detach_replica(&self, for_failover: bool) -> Result<(), RemoteError>;

    /// Connection details replicas need to follow this guest.
    async fn get_replica_context(&self) -> Result<ReplicaContext, RemoteError>;

    /// Follow the master described by `context`.
    async fn attach_replica(
        &self,
        context: ReplicaContext,
        slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError>;

    /// Turn this guest into a replication master.
    async fn enable_as_master(&self, replica_source_config: Overrides)
    -> Result<(), RemoteError>;

    /// Stop acting as replication master.
    async fn demote_replication_master(&self) -> Result<(), RemoteError>;

    /// The cluster this guest belongs to finished building.
    async fn cluster_complete(&self) -> Result<(), RemoteError>;

    /// Describe the guest logs visible to the caller.
    async fn guest_log_list(&self) -> Result<Vec<GuestLogInfo>, RemoteError>;

    /// Enable, disable, publish or discard a guest log.
    async fn guest_log_action(&self, action: GuestLogAction)
    -> Result<GuestLogInfo, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_status_values_are_distinct() {
        let values = [
            LogStatus::Disabled as u8,
            LogStatus::Enabled as u8,
            LogStatus::Unavailable as u8,
            LogStatus::Ready as u8,
            LogStatus::Published as u8,
            LogStatus::Partial as u8,
            LogStatus::RestartRequired as u8,
        ];
        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), values.len());
    }

    #[test]
    fn test_prepare_request_defaults_from_json() {
        let request: PrepareRequest = serde_json::from_value(serde_json::json!({
            "memory_mb": 2048,
            "databases": [{"name": "orders"}],
        }))
        .unwrap();

        assert_eq!(request.memory_mb, 2048);
        assert_eq!(request.databases[0].name, "orders");
        assert!(request.users.is_empty());
        assert!(request.cluster_config.is_none());
        assert!(request.snapshot.is_none());
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::new("ENGINE_START_FAILED", "engine did not start");
        assert_eq!(err.to_string(), "[ENGINE_START_FAILED] engine did not start");
    }
}
