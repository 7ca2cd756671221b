// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine start/stop/restart brackets.

use std::sync::Arc;
use std::time::Duration;

use keel_core::guest_api::{Overrides, UpgradeRequest};
use keel_core::status::ServiceStatus;
use tracing::{error, info, warn};

use crate::datastore::Datastore;
use crate::error::GuestError;
use crate::status::GuestStatusMachine;

/// Drives the engine and keeps the status machine in step with it.
pub struct ServiceController {
    datastore: Arc<dyn Datastore>,
    status: Arc<GuestStatusMachine>,
    state_change_wait: Duration,
}

impl ServiceController {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        status: Arc<GuestStatusMachine>,
        state_change_wait: Duration,
    ) -> Self {
        Self {
            datastore,
            status,
            state_change_wait,
        }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn status(&self) -> &Arc<GuestStatusMachine> {
        &self.status
    }

    /// Start the engine and wait for it to report RUNNING.
    ///
    /// On failure the status is forced to FAILED.
    pub async fn start_db(&self, update_db: bool) -> Result<(), GuestError> {
        info!(instance_id = %self.status.instance_id(), "Starting database");

        if let Err(e) = self.datastore.engine().start().await {
            error!(instance_id = %self.status.instance_id(), error = %e, "Engine start command failed");
            self.status.set_status(ServiceStatus::Failed, true).await?;
            return Err(GuestError::EngineStartFailed(e.to_string()));
        }

        let started = self
            .status
            .wait_for_real_status_to_change_to(
                ServiceStatus::Running,
                self.state_change_wait,
                update_db,
            )
            .await?;
        if !started {
            error!(instance_id = %self.status.instance_id(), "Database did not reach RUNNING");
            self.status.set_status(ServiceStatus::Failed, true).await?;
            return Err(GuestError::EngineStartFailed(format!(
                "engine did not reach RUNNING within {}s",
                self.state_change_wait.as_secs()
            )));
        }

        Ok(())
    }

    /// Stop the engine and wait for it to report SHUTDOWN.
    ///
    /// On failure the status is left unchanged.
    pub async fn stop_db(
        &self,
        update_db: bool,
        do_not_start_on_reboot: bool,
    ) -> Result<(), GuestError> {
        info!(instance_id = %self.status.instance_id(), "Stopping database");

        self.datastore
            .engine()
            .stop(do_not_start_on_reboot)
            .await
            .map_err(|e| GuestError::EngineStopFailed(e.to_string()))?;

        let stopped = self
            .status
            .wait_for_real_status_to_change_to(
                ServiceStatus::Shutdown,
                self.state_change_wait,
                update_db,
            )
            .await?;
        if !stopped {
            return Err(GuestError::EngineStopFailed(format!(
                "engine did not reach SHUTDOWN within {}s",
                self.state_change_wait.as_secs()
            )));
        }

        Ok(())
    }

    /// Stop and start the engine inside a restart bracket.
    pub async fn restart(&self) -> Result<(), GuestError> {
        self.status.begin_restart();

        let result = async {
            self.stop_db(false, false).await?;
            self.start_db(false).await
        }
        .await;

        if let Err(e) = &result {
            warn!(instance_id = %self.status.instance_id(), error = %e, "Restart failed");
        }
        self.status.end_restart().await?;
        result
    }

    /// Start a stopped engine, writing new configuration first when given.
    pub async fn start_db_with_conf_changes(
        &self,
        config_contents: Option<&str>,
    ) -> Result<(), GuestError> {
        if self.status.probe().await == ServiceStatus::Running {
            return Err(GuestError::InvalidState(
                "cannot apply configuration changes while the database is running".to_string(),
            ));
        }

        if let Some(contents) = config_contents {
            let configurator = self.datastore.configurator().ok_or_else(|| {
                GuestError::unsupported("write_config", self.datastore.manager())
            })?;
            info!(instance_id = %self.status.instance_id(), "Writing new configuration");
            configurator.write_config(Some(contents), None).await?;
        }

        self.start_db(true).await
    }

    /// Persist overrides; flags RESTART_REQUIRED when they only apply on restart.
    pub async fn update_overrides(
        &self,
        overrides: &Overrides,
        remove: bool,
    ) -> Result<(), GuestError> {
        let configurator = self
            .datastore
            .configurator()
            .ok_or_else(|| GuestError::unsupported("update_overrides", self.datastore.manager()))?;

        let restart_required = configurator.update_overrides(overrides, remove).await?;
        if restart_required {
            info!(instance_id = %self.status.instance_id(), "Overrides take effect after restart");
            self.status
                .set_status(ServiceStatus::RestartRequired, false)
                .await?;
        }
        Ok(())
    }

    pub async fn apply_overrides(&self, overrides: &Overrides) -> Result<(), GuestError> {
        self.datastore
            .configurator()
            .ok_or_else(|| GuestError::unsupported("apply_overrides", self.datastore.manager()))?
            .apply_overrides(overrides)
            .await
    }

    /// Stop the engine, upgrade it and start it again.
    pub async fn upgrade(&self, request: &UpgradeRequest) -> Result<(), GuestError> {
        let installer = self
            .datastore
            .installer()
            .ok_or_else(|| GuestError::unsupported("upgrade", self.datastore.manager()))?;

        info!(
            instance_id = %self.status.instance_id(),
            datastore_version = %request.datastore_version,
            "Upgrading database"
        );
        self.stop_db(true, false).await?;
        installer.upgrade(request).await?;
        self.start_db(true).await
    }
}
