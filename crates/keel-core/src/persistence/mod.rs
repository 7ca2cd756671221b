// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for keel-core.
//!
//! The status store keeps three kinds of rows: the last-known service status
//! of each guest, instance records carrying the per-instance task marker, and
//! cluster records carrying the cluster task marker.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::status::{ClusterTask, InstanceTask, ServiceStatus};

/// Last-known engine status of a guest.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStatusRecord {
    /// Instance the status belongs to.
    pub instance_id: String,
    /// Current service status.
    pub status: ServiceStatus,
    /// `sent_at` of the newest accepted heartbeat. Never moves backwards.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the status was last written, by a heartbeat or an override.
    pub updated_at: DateTime<Utc>,
}

/// Database instance record.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub instance_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Display name.
    pub name: String,
    /// Cluster membership, if any.
    pub cluster_id: Option<String>,
    /// Compute flavor.
    pub flavor_id: String,
    /// Volume size in GB, when volumes are used.
    pub volume_size: Option<i64>,
    /// Datastore version the engine runs.
    pub datastore_version_id: String,
    /// Current task marker.
    pub task: InstanceTask,
    /// Replication source when this instance is a replica.
    pub replica_of: Option<String>,
    /// Soft-delete flag.
    pub deleted: bool,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When the instance was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields needed to register a new instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewInstance {
    pub instance_id: String,
    pub tenant_id: String,
    pub name: String,
    pub cluster_id: Option<String>,
    pub flavor_id: String,
    pub volume_size: Option<i64>,
    pub datastore_version_id: String,
    pub replica_of: Option<String>,
}

/// Cluster record.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRecord {
    /// Unique identifier for the cluster.
    pub cluster_id: String,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Datastore version all members run.
    pub datastore_version_id: String,
    /// Current cluster task.
    pub task: ClusterTask,
    /// Soft-delete flag.
    pub deleted: bool,
    /// When the cluster was deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// When the cluster was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a new cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCluster {
    pub cluster_id: String,
    pub name: String,
    pub tenant_id: String,
    pub datastore_version_id: String,
}

/// Persistence interface used by the conductor and the control plane.
///
/// Lookups of soft-deleted instances and clusters return `None`. Updates of
/// a missing row fail with the matching `*NotFound` error.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Service status
    // ------------------------------------------------------------------

    /// Create or replace the service status row, clearing the heartbeat time.
    async fn init_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError>;

    async fn get_service_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceStatusRecord>, CoreError>;

    /// Apply a heartbeat. Returns `false` when `sent_at` is older than the
    /// stored heartbeat time and the heartbeat was dropped.
    async fn record_heartbeat(
        &self,
        instance_id: &str,
        status: ServiceStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Overwrite the status without touching the heartbeat time.
    async fn set_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError>;

    /// Status rows whose last heartbeat is older than `cutoff`.
    async fn list_stale_service_statuses(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ServiceStatusRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Insert an instance with task BUILDING.
    async fn register_instance(&self, instance: &NewInstance) -> Result<(), CoreError>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    async fn update_instance_task(
        &self,
        instance_id: &str,
        task: InstanceTask,
    ) -> Result<(), CoreError>;

    /// Set the task to `to` only if the current task is one of `from`.
    /// Returns the task found when the claim was refused.
    async fn claim_instance_task(
        &self,
        instance_id: &str,
        from: &[InstanceTask],
        to: InstanceTask,
    ) -> Result<Result<(), InstanceTask>, CoreError>;

    async fn update_instance_flavor(
        &self,
        instance_id: &str,
        flavor_id: &str,
    ) -> Result<(), CoreError>;

    async fn update_instance_datastore_version(
        &self,
        instance_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError>;

    async fn set_instance_replica_of(
        &self,
        instance_id: &str,
        replica_of: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Live replicas following `master_id`, oldest first.
    async fn list_replicas(&self, master_id: &str) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Live members of a cluster, oldest first.
    async fn list_cluster_instances(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    async fn mark_instance_deleted(&self, instance_id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------

    /// Insert a cluster with task BUILDING_INITIAL.
    async fn create_cluster(&self, cluster: &NewCluster) -> Result<(), CoreError>;

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, CoreError>;

    async fn update_cluster_task(
        &self,
        cluster_id: &str,
        task: ClusterTask,
    ) -> Result<(), CoreError>;

    /// Set the cluster task to `to` only if the current task is one of `from`.
    async fn claim_cluster_task(
        &self,
        cluster_id: &str,
        from: &[ClusterTask],
        to: ClusterTask,
    ) -> Result<Result<(), ClusterTask>, CoreError>;

    async fn update_cluster_datastore_version(
        &self,
        cluster_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError>;

    async fn mark_cluster_deleted(&self, cluster_id: &str) -> Result<(), CoreError>;

    /// Live clusters, optionally restricted to one tenant.
    async fn list_clusters(&self, tenant_id: Option<&str>)
    -> Result<Vec<ClusterRecord>, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
