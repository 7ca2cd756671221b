// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance task orchestration.
//!
//! Every mutating operation validates first and claims the instance task
//! marker atomically; a rejected request changes nothing and queues nothing.
//! Long-running operations continue on a spawned task that always resets the
//! marker to `NONE` when it finishes, whatever the outcome.
//!
//! | Operation | Allowed task | Allowed service status | Task while running |
//! |-----------|--------------|------------------------|--------------------|
//! | `restart` | `NONE` | settled | `REBOOTING` |
//! | `resize_flavor` | `NONE` | `RUNNING` | `RESIZING` |
//! | `upgrade` | `NONE` | `RUNNING`, `SHUTDOWN` | `UPGRADING` |
//! | `update_overrides`, `apply_overrides` | `NONE` | `RUNNING`, `RESTART_REQUIRED` | - |
//! | `delete_instance` | `NONE`, `BUILDING_ERROR` | any | `DELETING` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::guest_api::{Overrides, PrepareRequest, UpgradeRequest};
use keel_core::persistence::{InstanceRecord, NewInstance, Persistence};
use keel_core::status::{InstanceTask, ServiceStatus, instance_api_status};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::guest_client::{CastHandle, GuestClient, GuestConnector, GuestTimeouts};
use crate::heartbeat_monitor::heartbeat_expired;
use crate::task_api::TaskManagerApi;

/// Handle of a background operation.
pub type TaskHandle = JoinHandle<Result<()>>;

/// Request to provision a standalone instance or a cluster member.
#[derive(Debug, Clone, Default)]
pub struct CreateInstanceRequest {
    /// Generated when absent.
    pub instance_id: Option<String>,
    pub tenant_id: String,
    pub name: String,
    pub flavor_id: String,
    pub volume_size: Option<i64>,
    pub datastore_version_id: String,
    pub prepare: PrepareRequest,
}

/// What `show_instance` returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub name: String,
    pub task: InstanceTask,
    pub service_status: ServiceStatus,
    /// API-facing state combining task and service status.
    pub status: &'static str,
    pub flavor_id: String,
    pub datastore_version_id: String,
    pub cluster_id: Option<String>,
    pub replica_of: Option<String>,
    pub heartbeat_age_secs: Option<i64>,
    pub heartbeat_expired: bool,
}

/// Validate a requested volume size against the volume settings.
pub fn validate_volume_size(config: &Config, volume_size: Option<i64>) -> Result<()> {
    match (config.volume_support, volume_size) {
        (true, None) => Err(ControlError::BadRequest(
            "volume size must be specified".to_string(),
        )),
        (true, Some(size)) if size <= 0 => Err(ControlError::BadRequest(format!(
            "volume size {} must be a positive integer",
            size
        ))),
        (true, Some(size)) if size > config.max_accepted_volume_size => {
            Err(ControlError::BadRequest(format!(
                "volume size {} GB exceeds the maximum of {} GB",
                size, config.max_accepted_volume_size
            )))
        }
        (false, Some(_)) => Err(ControlError::BadRequest(
            "volume support is disabled, a volume size cannot be specified".to_string(),
        )),
        _ => Ok(()),
    }
}

fn is_settled(status: ServiceStatus) -> bool {
    matches!(
        status,
        ServiceStatus::Running
            | ServiceStatus::Shutdown
            | ServiceStatus::Blocked
            | ServiceStatus::Crashed
            | ServiceStatus::RestartRequired
    )
}

/// Validated, timeout-bounded operations on single instances.
#[derive(Clone)]
pub struct TaskOrchestrator {
    persistence: Arc<dyn Persistence>,
    guests: Arc<dyn GuestConnector>,
    task_manager: Arc<dyn TaskManagerApi>,
    config: Arc<Config>,
}

impl TaskOrchestrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        guests: Arc<dyn GuestConnector>,
        task_manager: Arc<dyn TaskManagerApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            persistence,
            guests,
            task_manager,
            config,
        }
    }

    fn client(&self, instance_id: &str) -> Result<GuestClient> {
        GuestClient::connect(
            self.guests.as_ref(),
            instance_id,
            GuestTimeouts::from_config(&self.config),
        )
    }

    async fn instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.persistence
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| ControlError::instance_not_found(instance_id))
    }

    async fn service_status(&self, instance_id: &str) -> Result<ServiceStatus> {
        Ok(self
            .persistence
            .get_service_status(instance_id)
            .await?
            .map_or(ServiceStatus::New, |record| record.status))
    }

    async fn require_status(
        &self,
        instance_id: &str,
        allowed: impl Fn(ServiceStatus) -> bool,
    ) -> Result<ServiceStatus> {
        let status = self.service_status(instance_id).await?;
        if !allowed(status) {
            return Err(ControlError::Unprocessable(format!(
                "Instance {} is not currently available for an action to be performed (status was {}).",
                instance_id, status
            )));
        }
        Ok(status)
    }

    async fn claim(
        &self,
        instance_id: &str,
        from: &[InstanceTask],
        to: InstanceTask,
    ) -> Result<()> {
        self.persistence
            .claim_instance_task(instance_id, from, to)
            .await?
            .map_err(|current| {
                ControlError::Unprocessable(format!(
                    "Instance {} cannot perform this action while its task is '{}'.",
                    instance_id, current
                ))
            })
    }

    fn require_task_none(instance: &InstanceRecord) -> Result<()> {
        if instance.task != InstanceTask::None {
            return Err(ControlError::Unprocessable(format!(
                "Instance {} cannot perform this action while its task is '{}'.",
                instance.instance_id, instance.task
            )));
        }
        Ok(())
    }

    /// Poll the status store until `accept` matches or `max_wait` elapses.
    async fn wait_for_service_status(
        &self,
        instance_id: &str,
        accept: impl Fn(ServiceStatus) -> bool,
        max_wait: Duration,
    ) -> Result<Option<ServiceStatus>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let status = self.service_status(instance_id).await?;
            if accept(status) {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.state_change_poll_interval).await;
        }
    }

    async fn wait_for_running(&self, instance_id: &str, method: &'static str) -> Result<()> {
        let timeout = self.config.state_change_wait;
        match self
            .wait_for_service_status(instance_id, |s| s == ServiceStatus::Running, timeout)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(ControlError::GuestTimeout { method, timeout }),
        }
    }

    /// Run `body` in the background and reset the task marker afterwards.
    fn spawn_task<F>(&self, instance_id: String, operation: &'static str, body: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            let result = body.await;
            match &result {
                Ok(()) => info!(instance_id = %instance_id, operation, "Instance task completed"),
                Err(e) => error!(instance_id = %instance_id, operation, error = %e, "Instance task failed"),
            }
            if let Err(e) = persistence
                .update_instance_task(&instance_id, InstanceTask::None)
                .await
            {
                error!(instance_id = %instance_id, error = %e, "Failed to reset instance task");
            }
            result
        })
    }

    /// Wait for a cast to finish, bounded by `timeout`.
    async fn join_cast(handle: CastHandle, method: &'static str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ControlError::Guest {
                method,
                code: "CAST_ABORTED".to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ControlError::GuestTimeout { method, timeout }),
        }
    }

    /// Register an instance, cast `prepare` and watch it come up.
    ///
    /// The watcher resets the task to `NONE` once the guest reports RUNNING
    /// (INSTANCE_READY for cluster members) or FAILED, and marks it
    /// `BUILDING_ERROR` when the usage timeout expires first.
    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> Result<(String, TaskHandle)> {
        if request.name.trim().is_empty() {
            return Err(ControlError::BadRequest("instance name is required".to_string()));
        }
        if request.flavor_id.is_empty() {
            return Err(ControlError::BadRequest("flavor is required".to_string()));
        }
        validate_volume_size(&self.config, request.volume_size)?;

        let instance_id = request
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let client = self.client(&instance_id)?;
        let cluster_id = request
            .prepare
            .cluster_config
            .as_ref()
            .map(|c| c.cluster_id.clone());
        let is_cluster_member = cluster_id.is_some();

        self.persistence
            .register_instance(&NewInstance {
                instance_id: instance_id.clone(),
                tenant_id: request.tenant_id,
                name: request.name,
                cluster_id,
                flavor_id: request.flavor_id,
                volume_size: request.volume_size,
                datastore_version_id: request.datastore_version_id,
                replica_of: None,
            })
            .await?;
        self.persistence
            .init_service_status(&instance_id, ServiceStatus::New)
            .await?;
        info!(instance_id = %instance_id, "Instance registered, preparing guest");

        let _prepare = client.prepare(request.prepare);

        let this = self.clone();
        let id = instance_id.clone();
        let handle = tokio::spawn(async move {
            let settled = this
                .wait_for_service_status(
                    &id,
                    |s| {
                        s == ServiceStatus::Running
                            || s == ServiceStatus::Failed
                            || (is_cluster_member && s == ServiceStatus::InstanceReady)
                    },
                    this.config.usage_timeout,
                )
                .await?;

            match settled {
                Some(status) => {
                    info!(instance_id = %id, status = %status, "Instance build finished");
                    this.persistence
                        .update_instance_task(&id, InstanceTask::None)
                        .await?;
                }
                None => {
                    error!(
                        instance_id = %id,
                        timeout_secs = this.config.usage_timeout.as_secs(),
                        "Instance did not become usable in time"
                    );
                    this.persistence
                        .update_instance_task(&id, InstanceTask::BuildingError)
                        .await?;
                }
            }
            Ok(())
        });

        Ok((instance_id, handle))
    }

    /// Restart the engine of a settled instance.
    pub async fn restart(&self, instance_id: &str) -> Result<TaskHandle> {
        let instance = self.instance(instance_id).await?;
        Self::require_task_none(&instance)?;
        self.require_status(instance_id, is_settled).await?;
        let client = self.client(instance_id)?;
        self.claim(instance_id, &[InstanceTask::None], InstanceTask::Rebooting)
            .await?;
        info!(instance_id = %instance_id, "Restarting instance");

        let this = self.clone();
        let id = instance_id.to_string();
        Ok(self.spawn_task(instance_id.to_string(), "restart", async move {
            client.restart().await?;
            this.wait_for_running(&id, "restart").await
        }))
    }

    /// Resize a running instance to another flavor.
    pub async fn resize_flavor(&self, instance_id: &str, flavor_id: &str) -> Result<TaskHandle> {
        let instance = self.instance(instance_id).await?;
        if instance.flavor_id == flavor_id {
            return Err(ControlError::BadRequest(format!(
                "instance {} already uses flavor '{}'",
                instance_id, flavor_id
            )));
        }
        Self::require_task_none(&instance)?;
        self.require_status(instance_id, |s| s == ServiceStatus::Running)
            .await?;
        let client = self.client(instance_id)?;
        self.claim(instance_id, &[InstanceTask::None], InstanceTask::Resizing)
            .await?;
        info!(instance_id = %instance_id, flavor_id = %flavor_id, "Resizing instance");

        let this = self.clone();
        let id = instance_id.to_string();
        let flavor_id = flavor_id.to_string();
        Ok(self.spawn_task(instance_id.to_string(), "resize_flavor", async move {
            client.stop_db(false).await?;
            if let Err(e) = this.task_manager.resize_flavor(&id, &flavor_id).await {
                warn!(instance_id = %id, error = %e, "Resize failed, starting the engine on the old flavor");
                if let Err(start) = client.start_db_with_conf_changes(None).await {
                    error!(instance_id = %id, error = %start, "Failed to restart engine after failed resize");
                }
                return Err(e);
            }
            client.start_db_with_conf_changes(None).await?;
            this.wait_for_running(&id, "resize_flavor").await?;
            this.persistence
                .update_instance_flavor(&id, &flavor_id)
                .await?;
            Ok(())
        }))
    }

    /// Upgrade an instance to another datastore version.
    pub async fn upgrade(
        &self,
        instance_id: &str,
        datastore_version_id: &str,
    ) -> Result<TaskHandle> {
        let instance = self.instance(instance_id).await?;
        Self::require_task_none(&instance)?;
        self.require_status(instance_id, |s| {
            matches!(s, ServiceStatus::Running | ServiceStatus::Shutdown)
        })
        .await?;
        let client = self.client(instance_id)?;
        self.claim(instance_id, &[InstanceTask::None], InstanceTask::Upgrading)
            .await?;
        info!(instance_id = %instance_id, datastore_version_id = %datastore_version_id, "Upgrading instance");

        let this = self.clone();
        let id = instance_id.to_string();
        let version = datastore_version_id.to_string();
        Ok(self.spawn_task(instance_id.to_string(), "upgrade", async move {
            let cast = client.upgrade(UpgradeRequest {
                datastore_version: version.clone(),
                packages: Vec::new(),
            });
            Self::join_cast(cast, "upgrade", this.config.usage_timeout).await?;
            this.wait_for_running(&id, "upgrade").await?;
            this.persistence
                .update_instance_datastore_version(&id, &version)
                .await?;
            Ok(())
        }))
    }

    async fn validate_configuration_change(&self, instance_id: &str) -> Result<GuestClient> {
        let instance = self.instance(instance_id).await?;
        Self::require_task_none(&instance)?;
        self.require_status(instance_id, |s| {
            matches!(s, ServiceStatus::Running | ServiceStatus::RestartRequired)
        })
        .await?;
        self.client(instance_id)
    }

    pub async fn update_overrides(
        &self,
        instance_id: &str,
        overrides: Overrides,
        remove: bool,
    ) -> Result<()> {
        let client = self.validate_configuration_change(instance_id).await?;
        client.update_overrides(overrides, remove).await
    }

    pub async fn apply_overrides(&self, instance_id: &str, overrides: Overrides) -> Result<()> {
        let client = self.validate_configuration_change(instance_id).await?;
        client.apply_overrides(overrides).await
    }

    /// Request teardown. On rejection by the orchestration layer the task is
    /// reset to `NONE`.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.instance(instance_id).await?;
        self.claim(
            instance_id,
            &[InstanceTask::None, InstanceTask::BuildingError],
            InstanceTask::Deleting,
        )
        .await?;
        info!(instance_id = %instance_id, "Deleting instance");

        if let Err(e) = self.task_manager.delete_instance(instance_id).await {
            error!(instance_id = %instance_id, error = %e, "Instance delete request failed");
            self.persistence
                .update_instance_task(instance_id, InstanceTask::None)
                .await?;
            return Err(e);
        }
        Ok(())
    }

    /// Mark the record deleted once teardown finished.
    pub async fn complete_instance_delete(&self, instance_id: &str) -> Result<()> {
        self.instance(instance_id).await?;
        self.persistence.mark_instance_deleted(instance_id).await?;
        info!(instance_id = %instance_id, "Instance deleted");
        Ok(())
    }

    /// Operator override: clear the task marker.
    pub async fn reset_task(&self, instance_id: &str) -> Result<()> {
        self.instance(instance_id).await?;
        self.persistence
            .update_instance_task(instance_id, InstanceTask::None)
            .await?;
        Ok(())
    }

    /// Operator override for instances stuck building or in error: task to
    /// `NONE`, service status to UNKNOWN.
    pub async fn reset_status(&self, instance_id: &str) -> Result<()> {
        let instance = self.instance(instance_id).await?;
        let status = self.service_status(instance_id).await?;
        let resettable = matches!(
            instance.task,
            InstanceTask::Building | InstanceTask::BuildingError
        ) || status.is_building()
            || status.is_error();
        if !resettable {
            return Err(ControlError::Unprocessable(format!(
                "Instance {} status can only be reset while building or in error (status was {}).",
                instance_id, status
            )));
        }

        info!(instance_id = %instance_id, "Resetting task and status");
        self.persistence
            .update_instance_task(instance_id, InstanceTask::None)
            .await?;
        self.persistence
            .set_service_status(instance_id, ServiceStatus::Unknown)
            .await?;
        Ok(())
    }

    pub async fn show_instance(&self, instance_id: &str) -> Result<InstanceView> {
        let instance = self.instance(instance_id).await?;
        let record = self.persistence.get_service_status(instance_id).await?;
        let now = Utc::now();

        let (service_status, heartbeat_age_secs, heartbeat_expired) = match record {
            Some(record) => (
                record.status,
                record
                    .heartbeat_at
                    .map(|at| now.signed_duration_since(at).num_seconds()),
                heartbeat_expired(&record, self.config.agent_heartbeat_expiry, now),
            ),
            None => (ServiceStatus::New, None, false),
        };

        Ok(InstanceView {
            status: instance_api_status(instance.task, service_status),
            instance_id: instance.instance_id,
            name: instance.name,
            task: instance.task,
            service_status,
            flavor_id: instance.flavor_id,
            datastore_version_id: instance.datastore_version_id,
            cluster_id: instance.cluster_id,
            replica_of: instance.replica_of,
            heartbeat_age_secs,
            heartbeat_expired,
        })
    }

    pub async fn ping(&self, instance_id: &str) -> Result<()> {
        self.instance(instance_id).await?;
        self.client(instance_id)?.ping().await
    }
}
