// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The guest agent behind the [`GuestApi`] contract.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::guest_api::{
    GuestApi, GuestLogAction, GuestLogInfo, HeartbeatSink, Overrides, PrepareRequest,
    RemoteError, ReplicaContext, ReplicationSnapshot, SnapshotInfo, UpgradeRequest,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::app::ServiceController;
use crate::config::GuestConfig;
use crate::datastore::{Datastore, DatastoreProbe};
use crate::guest_log::{GuestLogRegistry, LogPublisher};
use crate::prepare::PrepareOrchestrator;
use crate::replication::ReplicationManager;
use crate::reporter::StatusReporter;
use crate::status::GuestStatusMachine;

/// A guest agent wired to one datastore.
///
/// Engine lifecycle calls (prepare, restart, stop, start, upgrade) are
/// serialized. Replication calls are not, so several replicas can wait on the
/// same snapshot concurrently.
pub struct GuestAgent {
    config: GuestConfig,
    status: Arc<GuestStatusMachine>,
    controller: Arc<ServiceController>,
    prepare: PrepareOrchestrator,
    replication: Arc<ReplicationManager>,
    logs: GuestLogRegistry,
    lifecycle: Mutex<()>,
}

impl GuestAgent {
    pub fn new(
        config: GuestConfig,
        datastore: Arc<dyn Datastore>,
        sink: Arc<dyn HeartbeatSink>,
        publisher: Option<Arc<dyn LogPublisher>>,
    ) -> Self {
        let status = Arc::new(
            GuestStatusMachine::new(
                config.guest_id.clone(),
                &config.guest_dir,
                Arc::new(DatastoreProbe(datastore.clone())),
                sink,
            )
            .with_probe_interval(config.state_change_poll_interval),
        );
        let controller = Arc::new(ServiceController::new(
            datastore.clone(),
            status.clone(),
            config.state_change_wait,
        ));
        let replication = Arc::new(ReplicationManager::new(
            datastore.clone(),
            status.clone(),
            config.mount_point.clone(),
        ));
        let prepare = PrepareOrchestrator::new(
            controller.clone(),
            replication.clone(),
            config.mount_point.clone(),
        );
        let logs = GuestLogRegistry::new(datastore, status.clone(), publisher);

        Self {
            config,
            status,
            controller,
            prepare,
            replication,
            logs,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn status(&self) -> &Arc<GuestStatusMachine> {
        &self.status
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    /// Build the periodic status reporter for this guest.
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter::new(self.status.clone(), self.config.report_interval)
    }
}

#[async_trait]
impl GuestApi for GuestAgent {
    async fn rpc_ping(&self) -> Result<(), RemoteError> {
        debug!(instance_id = %self.config.guest_id, "Responding to ping");
        Ok(())
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<(), RemoteError> {
        let _lifecycle = self.lifecycle.lock().await;
        info!(instance_id = %self.config.guest_id, "Starting prepare");
        Ok(self.prepare.prepare(&request).await?)
    }

    async fn restart(&self) -> Result<(), RemoteError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.controller.restart().await?;
        self.logs.clear_restart_required();
        Ok(())
    }

    async fn stop_db(&self, do_not_start_on_reboot: bool) -> Result<(), RemoteError> {
        let _lifecycle = self.lifecycle.lock().await;
        Ok(self.controller.stop_db(true, do_not_start_on_reboot).await?)
    }

    async fn start_db_with_conf_changes(
        &self,
        config_contents: Option<String>,
    ) -> Result<(), RemoteError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.controller
            .start_db_with_conf_changes(config_contents.as_deref())
            .await?;
        self.logs.clear_restart_required();
        Ok(())
    }

    async fn update_overrides(
        &self,
        overrides: Overrides,
        remove: bool,
    ) -> Result<(), RemoteError> {
        Ok(self.controller.update_overrides(&overrides, remove).await?)
    }

    async fn apply_overrides(&self, overrides: Overrides) -> Result<(), RemoteError> {
        Ok(self.controller.apply_overrides(&overrides).await?)
    }

    async fn upgrade(&self, request: UpgradeRequest) -> Result<(), RemoteError> {
        let _lifecycle = self.lifecycle.lock().await;
        Ok(self.controller.upgrade(&request).await?)
    }

    async fn get_replication_snapshot(
        &self,
        snapshot_info: SnapshotInfo,
        replica_source_config: Option<Overrides>,
    ) -> Result<ReplicationSnapshot, RemoteError> {
        Ok(self
            .replication
            .get_replication_snapshot(&snapshot_info, replica_source_config.as_ref())
            .await?)
    }

    async fn attach_replication_slave(
        &self,
        snapshot: ReplicationSnapshot,
        slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError> {
        Ok(self
            .replication
            .attach_replication_slave(&snapshot, slave_config.as_ref())
            .await?)
    }

    async fn detach_replica(&self, for_failover: bool) -> Result<(), RemoteError> {
        Ok(self.replication.detach_replica(for_failover).await?)
    }

    async fn get_replica_context(&self) -> Result<ReplicaContext, RemoteError> {
        Ok(self.replication.get_replica_context().await?)
    }

    async fn attach_replica(
        &self,
        context: ReplicaContext,
        slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError> {
        Ok(self
            .replication
            .attach_replica(&context, slave_config.as_ref())
            .await?)
    }

    async fn enable_as_master(&self, replica_source_config: Overrides) -> Result<(), RemoteError> {
        Ok(self
            .replication
            .enable_as_master(&replica_source_config)
            .await?)
    }

    async fn demote_replication_master(&self) -> Result<(), RemoteError> {
        Ok(self.replication.demote_replication_master().await?)
    }

    async fn cluster_complete(&self) -> Result<(), RemoteError> {
        info!(instance_id = %self.config.guest_id, "Cluster build complete");
        Ok(self.status.end_install(false, false).await?)
    }

    async fn guest_log_list(&self) -> Result<Vec<GuestLogInfo>, RemoteError> {
        Ok(self.logs.list())
    }

    async fn guest_log_action(&self, action: GuestLogAction) -> Result<GuestLogInfo, RemoteError> {
        Ok(self.logs.action(action).await?)
    }
}
