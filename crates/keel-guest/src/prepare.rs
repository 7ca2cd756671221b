// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! First-boot provisioning.
//!
//! ```text
//! begin_install
//!   ├─ install packages
//!   ├─ mount volume            (device_path)
//!   ├─ write configuration     (config_contents / overrides)
//!   ├─ restore backup          (backup_info)
//!   ├─ start engine, wait for RUNNING
//!   ├─ secure engine           (not restoring, datastore supports it)
//!   └─ attach as replica       (snapshot)
//! end_install                  (always)
//! create databases, users      (not a cluster member)
//! post_prepare
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use keel_core::guest_api::PrepareRequest;
use tracing::{error, info, instrument};

use crate::app::ServiceController;
use crate::datastore::Datastore;
use crate::error::GuestError;
use crate::replication::ReplicationManager;
use crate::status::GuestStatusMachine;

/// Runs the prepare sequence of one guest.
pub struct PrepareOrchestrator {
    controller: Arc<ServiceController>,
    replication: Arc<ReplicationManager>,
    mount_point: PathBuf,
}

impl PrepareOrchestrator {
    pub fn new(
        controller: Arc<ServiceController>,
        replication: Arc<ReplicationManager>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            replication,
            mount_point: mount_point.into(),
        }
    }

    fn datastore(&self) -> &dyn Datastore {
        self.controller.datastore().as_ref()
    }

    fn status(&self) -> &GuestStatusMachine {
        self.controller.status()
    }

    /// Run the full prepare sequence.
    ///
    /// The status ends FAILED when any step before `end_install` fails, and
    /// that error is returned. Database, user and post-prepare failures are
    /// returned without touching the status.
    #[instrument(skip_all, fields(instance_id = %self.status().instance_id()))]
    pub async fn prepare(&self, request: &PrepareRequest) -> Result<(), GuestError> {
        self.status().begin_install().await?;

        let prepare_result = self.do_prepare(request).await;
        if let Err(e) = &prepare_result {
            error!(error = %e, "An error occurred preparing datastore");
        }

        let post_processing = request.cluster_config.is_some();
        self.status()
            .end_install(prepare_result.is_err(), post_processing)
            .await?;
        prepare_result?;
        info!("Completed setup of datastore");

        if request.cluster_config.is_none() {
            self.create_databases_and_users(request)
                .await
                .inspect_err(|e| error!(error = %e, "Error creating databases and users"))?;
        }

        self.datastore()
            .post_prepare(request)
            .await
            .inspect_err(|e| error!(error = %e, "Error running post-prepare task"))?;

        Ok(())
    }

    async fn do_prepare(&self, request: &PrepareRequest) -> Result<(), GuestError> {
        let datastore = self.datastore();
        let manager = datastore.manager();

        if !request.packages.is_empty() {
            info!(count = request.packages.len(), "Installing packages");
            datastore
                .installer()
                .ok_or_else(|| GuestError::unsupported("install_packages", manager))?
                .install_packages(&request.packages)
                .await?;
        }

        let mount_point = request
            .mount_point
            .as_ref()
            .map_or_else(|| self.mount_point.clone(), PathBuf::from);

        if let Some(device_path) = &request.device_path {
            info!(device = %device_path, mount_point = ?mount_point, "Mounting volume");
            datastore
                .installer()
                .ok_or_else(|| GuestError::unsupported("mount_volume", manager))?
                .mount_volume(device_path, &mount_point)
                .await?;
        }

        if request.config_contents.is_some() || request.overrides.is_some() {
            info!("Writing initial configuration");
            datastore
                .configurator()
                .ok_or_else(|| GuestError::unsupported("write_config", manager))?
                .write_config(request.config_contents.as_deref(), request.overrides.as_ref())
                .await?;
        }

        if let Some(backup) = &request.backup_info {
            info!(backup_id = %backup.id, "Restoring backup");
            datastore
                .restorer()
                .ok_or_else(|| GuestError::unsupported("restore", manager))?
                .restore(backup, &mount_point)
                .await?;
        }

        self.controller.start_db(false).await?;

        if request.backup_info.is_none()
            && let Some(hardener) = datastore.hardener()
        {
            info!("Securing datastore");
            hardener.secure(request.root_password.as_deref()).await?;
        }

        if let Some(snapshot) = &request.snapshot {
            info!(snapshot_id = %snapshot.dataset.snapshot_id, "Attaching as replica");
            self.replication
                .attach_replication_slave(snapshot, request.overrides.as_ref())
                .await?;
        }

        Ok(())
    }

    async fn create_databases_and_users(&self, request: &PrepareRequest) -> Result<(), GuestError> {
        if request.databases.is_empty() && request.users.is_empty() {
            return Ok(());
        }
        let users = self
            .datastore()
            .user_manager()
            .ok_or_else(|| GuestError::unsupported("create_users", self.datastore().manager()))?;

        if !request.databases.is_empty() {
            users.create_databases(&request.databases).await?;
        }
        if !request.users.is_empty() {
            users.create_users(&request.users).await?;
        }
        Ok(())
    }
}
