// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster task machine.
//!
//! Every cluster carries one task marker. An operation is accepted only when
//! the marker is in the operation's whitelist; a rejected request changes
//! nothing. Accepted operations claim the marker atomically and hand the
//! long-running work to the orchestration layer, which clears the marker with
//! [`ClusterTaskMachine::complete_task`] when it is done.
//!
//! | Operation | Allowed tasks | Task afterwards |
//! |-----------|---------------|-----------------|
//! | `grow` | `NONE` | `GROWING_CLUSTER` |
//! | `shrink` | `NONE` | `SHRINKING_CLUSTER` |
//! | `upgrade` | `NONE` | `UPGRADING_CLUSTER` |
//! | `delete` | `NONE`, `DELETING` | `DELETING` |
//! | `reset_status` | `BUILDING_INITIAL` | `NONE` |

use std::sync::Arc;

use keel_core::persistence::{ClusterRecord, InstanceRecord, NewCluster, NewInstance, Persistence};
use keel_core::status::{ClusterTask, InstanceTask, ServiceStatus};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::task_api::TaskManagerApi;
use crate::task_orchestrator::validate_volume_size;

/// Volume part of a member spec.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VolumeSpec {
    pub size: i64,
}

/// One member in a create or grow request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterInstanceSpec {
    #[serde(rename = "flavorRef")]
    pub flavor_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub volume: Option<VolumeSpec>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default, rename = "type")]
    pub instance_type: Option<String>,
}

impl ClusterInstanceSpec {
    fn volume_size(&self) -> Option<i64> {
        self.volume.as_ref().map(|v| v.size)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateClusterRequest {
    /// Generated when absent.
    pub cluster_id: Option<String>,
    pub name: String,
    pub tenant_id: String,
    pub datastore_version_id: String,
    pub instances: Vec<ClusterInstanceSpec>,
}

#[derive(Deserialize)]
struct ShrinkTarget {
    id: String,
}

#[derive(Deserialize)]
struct UpgradeParams {
    datastore_version: String,
}

fn parse_params<T: DeserializeOwned>(action: &str, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| ControlError::BadRequest(format!("invalid '{}' parameters: {}", action, e)))
}

/// All specs must share one flavor and one volume size.
fn validate_homogeneous(config: &Config, specs: &[ClusterInstanceSpec]) -> Result<()> {
    let Some(first) = specs.first() else {
        return Err(ControlError::BadRequest(
            "at least one instance is required".to_string(),
        ));
    };
    if specs.iter().any(|s| s.flavor_id != first.flavor_id) {
        return Err(ControlError::BadRequest(
            "all cluster instances must use the same flavor".to_string(),
        ));
    }
    if specs.iter().any(|s| s.volume_size() != first.volume_size()) {
        return Err(ControlError::BadRequest(
            "all cluster instances must use the same volume size".to_string(),
        ));
    }
    validate_volume_size(config, first.volume_size())
}

/// Validated cluster operations guarded by the cluster task marker.
pub struct ClusterTaskMachine {
    persistence: Arc<dyn Persistence>,
    task_manager: Arc<dyn TaskManagerApi>,
    config: Arc<Config>,
}

impl ClusterTaskMachine {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        task_manager: Arc<dyn TaskManagerApi>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            persistence,
            task_manager,
            config,
        }
    }

    async fn cluster(&self, cluster_id: &str) -> Result<ClusterRecord> {
        self.persistence
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| ControlError::cluster_not_found(cluster_id))
    }

    fn unavailable(task: ClusterTask) -> ControlError {
        ControlError::Unprocessable(format!(
            "This action cannot be performed on the cluster while the current cluster task is '{}'.",
            task
        ))
    }

    /// Reject unless the cluster task is one of `valid`.
    pub async fn validate_cluster_available(
        &self,
        cluster_id: &str,
        valid: &[ClusterTask],
    ) -> Result<ClusterRecord> {
        let cluster = self.cluster(cluster_id).await?;
        if !valid.contains(&cluster.task) {
            return Err(Self::unavailable(cluster.task));
        }
        Ok(cluster)
    }

    async fn claim(&self, cluster_id: &str, from: &[ClusterTask], to: ClusterTask) -> Result<()> {
        self.persistence
            .claim_cluster_task(cluster_id, from, to)
            .await?
            .map_err(Self::unavailable)
    }

    async fn rollback(&self, cluster_id: &str, operation: &str, err: &ControlError) {
        error!(cluster_id = %cluster_id, operation, error = %err, "Cluster operation rejected, rolling back task");
        if let Err(e) = self
            .persistence
            .update_cluster_task(cluster_id, ClusterTask::None)
            .await
        {
            error!(cluster_id = %cluster_id, error = %e, "Failed to roll back cluster task");
        }
    }

    async fn register_members(
        &self,
        cluster: &ClusterRecord,
        specs: &[ClusterInstanceSpec],
        first_index: usize,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(specs.len());
        for (offset, spec) in specs.iter().enumerate() {
            let instance_id = uuid::Uuid::new_v4().to_string();
            let name = spec
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-member-{}", cluster.name, first_index + offset + 1));
            self.persistence
                .register_instance(&NewInstance {
                    instance_id: instance_id.clone(),
                    tenant_id: cluster.tenant_id.clone(),
                    name,
                    cluster_id: Some(cluster.cluster_id.clone()),
                    flavor_id: spec.flavor_id.clone(),
                    volume_size: spec.volume_size(),
                    datastore_version_id: cluster.datastore_version_id.clone(),
                    replica_of: None,
                })
                .await?;
            self.persistence
                .init_service_status(&instance_id, ServiceStatus::New)
                .await?;
            ids.push(instance_id);
        }
        Ok(ids)
    }

    async fn members(&self, cluster_id: &str) -> Result<Vec<InstanceRecord>> {
        Ok(self.persistence.list_cluster_instances(cluster_id).await?)
    }

    /// Record a cluster at `BUILDING_INITIAL` with its members and ask the
    /// orchestration layer to build it. Returns the cluster id.
    pub async fn create(&self, request: CreateClusterRequest) -> Result<String> {
        if request.name.trim().is_empty() {
            return Err(ControlError::BadRequest("cluster name is required".to_string()));
        }
        validate_homogeneous(&self.config, &request.instances)?;

        let cluster_id = request
            .cluster_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.persistence
            .create_cluster(&NewCluster {
                cluster_id: cluster_id.clone(),
                name: request.name,
                tenant_id: request.tenant_id,
                datastore_version_id: request.datastore_version_id,
            })
            .await?;
        let cluster = self.cluster(&cluster_id).await?;
        let members = self.register_members(&cluster, &request.instances, 0).await?;
        info!(cluster_id = %cluster_id, members = members.len(), "Cluster recorded");

        self.task_manager.create_cluster(&cluster_id).await?;
        Ok(cluster_id)
    }

    /// Add members. Returns the ids of the new members.
    pub async fn grow(
        &self,
        cluster_id: &str,
        instances: &[ClusterInstanceSpec],
    ) -> Result<Vec<String>> {
        let cluster = self
            .validate_cluster_available(cluster_id, &[ClusterTask::None])
            .await?;
        validate_homogeneous(&self.config, instances)?;
        if let Some(existing) = self.members(cluster_id).await?.first() {
            let spec = &instances[0];
            if spec.flavor_id != existing.flavor_id || spec.volume_size() != existing.volume_size {
                return Err(ControlError::BadRequest(format!(
                    "new instances must match the cluster's flavor '{}' and volume size {:?}",
                    existing.flavor_id, existing.volume_size
                )));
            }
        }

        self.claim(cluster_id, &[ClusterTask::None], ClusterTask::GrowingCluster)
            .await?;
        let existing = self.members(cluster_id).await?.len();
        let new_ids = match self.register_members(&cluster, instances, existing).await {
            Ok(ids) => ids,
            Err(e) => {
                self.rollback(cluster_id, "grow", &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.task_manager.grow_cluster(cluster_id, &new_ids).await {
            self.rollback(cluster_id, "grow", &e).await;
            for id in &new_ids {
                if let Err(cleanup) = self.persistence.mark_instance_deleted(id).await {
                    warn!(instance_id = %id, error = %cleanup, "Failed to discard member of rejected grow");
                }
            }
            return Err(e);
        }

        info!(cluster_id = %cluster_id, added = new_ids.len(), "Cluster grow requested");
        Ok(new_ids)
    }

    /// Remove members.
    pub async fn shrink(&self, cluster_id: &str, instance_ids: &[String]) -> Result<()> {
        self.validate_cluster_available(cluster_id, &[ClusterTask::None])
            .await?;
        if instance_ids.is_empty() {
            return Err(ControlError::BadRequest(
                "at least one instance must be removed".to_string(),
            ));
        }
        let members = self.members(cluster_id).await?;
        if let Some(unknown) = instance_ids
            .iter()
            .find(|id| !members.iter().any(|m| &m.instance_id == *id))
        {
            return Err(ControlError::BadRequest(format!(
                "instance '{}' is not a member of cluster '{}'",
                unknown, cluster_id
            )));
        }
        if members
            .iter()
            .all(|m| instance_ids.contains(&m.instance_id))
        {
            return Err(ControlError::BadRequest(
                "a cluster cannot be shrunk to zero members".to_string(),
            ));
        }

        self.claim(cluster_id, &[ClusterTask::None], ClusterTask::ShrinkingCluster)
            .await?;
        if let Err(e) = self.task_manager.shrink_cluster(cluster_id, instance_ids).await {
            self.rollback(cluster_id, "shrink", &e).await;
            return Err(e);
        }

        info!(cluster_id = %cluster_id, removed = instance_ids.len(), "Cluster shrink requested");
        Ok(())
    }

    pub async fn upgrade(&self, cluster_id: &str, datastore_version_id: &str) -> Result<()> {
        self.validate_cluster_available(cluster_id, &[ClusterTask::None])
            .await?;
        self.claim(cluster_id, &[ClusterTask::None], ClusterTask::UpgradingCluster)
            .await?;
        if let Err(e) = self
            .task_manager
            .upgrade_cluster(cluster_id, datastore_version_id)
            .await
        {
            self.rollback(cluster_id, "upgrade", &e).await;
            return Err(e);
        }
        self.persistence
            .update_cluster_datastore_version(cluster_id, datastore_version_id)
            .await?;

        info!(cluster_id = %cluster_id, datastore_version_id = %datastore_version_id, "Cluster upgrade requested");
        Ok(())
    }

    /// Tear the cluster down.
    ///
    /// Members are deleted one by one; a member that cannot be deleted is
    /// logged and skipped. The orchestration layer is always asked to delete
    /// the cluster afterwards.
    pub async fn delete(&self, cluster_id: &str) -> Result<()> {
        self.cluster(cluster_id).await?;
        self.claim(
            cluster_id,
            &[ClusterTask::None, ClusterTask::Deleting],
            ClusterTask::Deleting,
        )
        .await?;
        info!(cluster_id = %cluster_id, "Deleting cluster");

        for member in self.members(cluster_id).await? {
            let id = &member.instance_id;
            let result = match self
                .persistence
                .update_instance_task(id, InstanceTask::Deleting)
                .await
            {
                Ok(()) => self.task_manager.delete_instance(id).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                warn!(cluster_id = %cluster_id, instance_id = %id, error = %e, "Failed to delete cluster member, continuing");
            }
        }

        self.task_manager.delete_cluster(cluster_id).await
    }

    /// Operator override for clusters stuck building. Members that are
    /// building or in error are reset; healthy members are left alone.
    pub async fn reset_status(&self, cluster_id: &str) -> Result<()> {
        self.validate_cluster_available(cluster_id, &[ClusterTask::BuildingInitial])
            .await?;
        self.persistence
            .update_cluster_task(cluster_id, ClusterTask::None)
            .await?;

        for member in self.members(cluster_id).await? {
            let status = self
                .persistence
                .get_service_status(&member.instance_id)
                .await?
                .map_or(ServiceStatus::New, |r| r.status);
            let stuck = matches!(
                member.task,
                InstanceTask::Building | InstanceTask::BuildingError
            ) || status.is_building()
                || status.is_error();
            if !stuck {
                continue;
            }
            info!(cluster_id = %cluster_id, instance_id = %member.instance_id, "Resetting cluster member");
            self.persistence
                .update_instance_task(&member.instance_id, InstanceTask::None)
                .await?;
            self.persistence
                .set_service_status(&member.instance_id, ServiceStatus::Unknown)
                .await?;
        }
        Ok(())
    }

    pub async fn reset_task(&self, cluster_id: &str) -> Result<()> {
        self.cluster(cluster_id).await?;
        self.persistence
            .update_cluster_task(cluster_id, ClusterTask::None)
            .await?;
        Ok(())
    }

    /// Called by the orchestration layer when a cluster operation finished.
    pub async fn complete_task(&self, cluster_id: &str) -> Result<()> {
        self.reset_task(cluster_id).await
    }

    pub async fn is_deleting(&self, cluster_id: &str) -> Result<bool> {
        let cluster = self.cluster(cluster_id).await?;
        Ok(matches!(
            cluster.task,
            ClusterTask::Deleting | ClusterTask::ShrinkingCluster
        ))
    }

    /// Dispatch a named cluster action with JSON parameters.
    pub async fn action(&self, cluster_id: &str, name: &str, params: &Value) -> Result<()> {
        match name {
            "grow" => {
                let instances: Vec<ClusterInstanceSpec> = parse_params(name, params)?;
                self.grow(cluster_id, &instances).await.map(|_| ())
            }
            "shrink" => {
                let targets: Vec<ShrinkTarget> = parse_params(name, params)?;
                let ids: Vec<String> = targets.into_iter().map(|t| t.id).collect();
                self.shrink(cluster_id, &ids).await
            }
            "reset-status" => self.reset_status(cluster_id).await,
            "upgrade" => {
                let upgrade: UpgradeParams = parse_params(name, params)?;
                self.upgrade(cluster_id, &upgrade.datastore_version).await
            }
            other => Err(ControlError::BadRequest(format!(
                "unknown cluster action '{}'",
                other
            ))),
        }
    }
}
