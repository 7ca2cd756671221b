// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datastore capabilities.
//!
//! A datastore manager is a struct implementing [`Datastore`]. Engine control
//! is mandatory; every other capability is optional and exposed through an
//! accessor that returns `None` by default. Callers turn a missing required
//! capability into [`GuestError::Unsupported`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::guest_api::{
    BackupInfo, DatabaseSpec, Overrides, PrepareRequest, ReplicaContext, ReplicationSnapshot,
    SnapshotInfo, UpgradeRequest, UserSpec,
};
use keel_core::status::ServiceStatus;

use crate::error::GuestError;
use crate::guest_log::GuestLogDef;
use crate::host::{self, VolumeStats};
use crate::status::StatusProbe;

/// Start, stop and probe the database engine.
#[async_trait]
pub trait EngineControl: Send + Sync {
    async fn start(&self) -> Result<(), GuestError>;

    /// Stop the engine. With `do_not_start_on_reboot` the engine must stay
    /// down after a host reboot.
    async fn stop(&self, do_not_start_on_reboot: bool) -> Result<(), GuestError>;

    /// Read the actual engine status.
    async fn status(&self) -> ServiceStatus;
}

/// Package installation and volume handling.
#[async_trait]
pub trait Installable: Send + Sync {
    async fn install_packages(&self, packages: &[String]) -> Result<(), GuestError>;
    async fn mount_volume(&self, device_path: &str, mount_point: &Path) -> Result<(), GuestError>;
    async fn upgrade(&self, request: &UpgradeRequest) -> Result<(), GuestError>;
}

/// Engine configuration management.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Write the engine configuration. Either argument may be absent.
    async fn write_config(
        &self,
        contents: Option<&str>,
        overrides: Option<&Overrides>,
    ) -> Result<(), GuestError>;

    /// Persist overrides. Returns whether a restart is needed for them to
    /// take effect.
    async fn update_overrides(&self, overrides: &Overrides, remove: bool)
    -> Result<bool, GuestError>;

    /// Apply overrides to the running engine.
    async fn apply_overrides(&self, overrides: &Overrides) -> Result<(), GuestError>;
}

#[async_trait]
pub trait Restorable: Send + Sync {
    async fn restore(&self, backup: &BackupInfo, mount_point: &Path) -> Result<(), GuestError>;
}

/// First-boot security hardening (root password, anonymous users, ...).
#[async_trait]
pub trait Hardenable: Send + Sync {
    async fn secure(&self, root_password: Option<&str>) -> Result<(), GuestError>;
}

#[async_trait]
pub trait UserManageable: Send + Sync {
    async fn create_databases(&self, databases: &[DatabaseSpec]) -> Result<(), GuestError>;
    async fn create_users(&self, users: &[UserSpec]) -> Result<(), GuestError>;
}

/// Metadata of a captured replication snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSnapshot {
    pub snapshot_id: String,
    /// Captured data in GB.
    pub dataset_size: f64,
    pub log_position: serde_json::Value,
}

/// Engine-specific replication.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    /// Strategy name compared between master and replica
    /// (e.g. `MysqlGTIDReplication`).
    fn name(&self) -> &str;

    async fn snapshot_for_replication(
        &self,
        info: &SnapshotInfo,
    ) -> Result<CapturedSnapshot, GuestError>;

    async fn enable_as_master(&self, config: &Overrides) -> Result<(), GuestError>;

    async fn enable_as_slave(
        &self,
        snapshot: &ReplicationSnapshot,
        config: Option<&Overrides>,
    ) -> Result<(), GuestError>;

    async fn detach_slave(&self, for_failover: bool) -> Result<(), GuestError>;

    async fn demote_master(&self) -> Result<(), GuestError>;

    async fn replica_context(&self) -> Result<ReplicaContext, GuestError>;

    async fn attach_replica(
        &self,
        context: &ReplicaContext,
        config: Option<&Overrides>,
    ) -> Result<(), GuestError>;
}

/// A datastore manager.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Manager name (e.g. `mysql`).
    fn manager(&self) -> &str;

    fn engine(&self) -> &dyn EngineControl;

    fn installer(&self) -> Option<&dyn Installable> {
        None
    }

    fn configurator(&self) -> Option<&dyn Configurable> {
        None
    }

    fn restorer(&self) -> Option<&dyn Restorable> {
        None
    }

    fn hardener(&self) -> Option<&dyn Hardenable> {
        None
    }

    fn user_manager(&self) -> Option<&dyn UserManageable> {
        None
    }

    fn replication(&self) -> Option<&dyn ReplicationStrategy> {
        None
    }

    /// Datastore-specific work after databases and users were created.
    async fn post_prepare(&self, _request: &PrepareRequest) -> Result<(), GuestError> {
        Ok(())
    }

    /// Size and usage of the data volume.
    async fn volume_stats(&self, mount_point: &Path) -> Result<VolumeStats, GuestError> {
        host::filesystem_stats(mount_point)
    }

    /// Logs this datastore exposes.
    fn guest_log_defs(&self) -> Vec<GuestLogDef> {
        Vec::new()
    }
}

/// Probes the engine of a datastore.
pub struct DatastoreProbe(pub Arc<dyn Datastore>);

#[async_trait]
impl StatusProbe for DatastoreProbe {
    async fn probe(&self) -> ServiceStatus {
        self.0.engine().status().await
    }
}
