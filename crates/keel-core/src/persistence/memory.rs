// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend for tests and embedding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::status::{ClusterTask, InstanceTask, ServiceStatus};

use super::{
    ClusterRecord, InstanceRecord, NewCluster, NewInstance, Persistence, ServiceStatusRecord,
};

#[derive(Default)]
struct Tables {
    statuses: HashMap<String, ServiceStatusRecord>,
    instances: HashMap<String, InstanceRecord>,
    clusters: HashMap<String, ClusterRecord>,
}

impl Tables {
    fn live_instance_mut(&mut self, instance_id: &str) -> Result<&mut InstanceRecord, CoreError> {
        self.instances
            .get_mut(instance_id)
            .filter(|r| !r.deleted)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    fn live_cluster_mut(&mut self, cluster_id: &str) -> Result<&mut ClusterRecord, CoreError> {
        self.clusters
            .get_mut(cluster_id)
            .filter(|r| !r.deleted)
            .ok_or_else(|| CoreError::ClusterNotFound {
                cluster_id: cluster_id.to_string(),
            })
    }

    fn live_instances_where(&self, pred: impl Fn(&InstanceRecord) -> bool) -> Vec<InstanceRecord> {
        let mut found: Vec<InstanceRecord> = self
            .instances
            .values()
            .filter(|r| !r.deleted && pred(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        found
    }
}

/// Persistence backed by process memory. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn init_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        tables.statuses.insert(
            instance_id.to_string(),
            ServiceStatusRecord {
                instance_id: instance_id.to_string(),
                status,
                heartbeat_at: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_service_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceStatusRecord>, CoreError> {
        Ok(self.tables.lock().await.statuses.get(instance_id).cloned())
    }

    async fn record_heartbeat(
        &self,
        instance_id: &str,
        status: ServiceStatus,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tables = self.tables.lock().await;
        let record =
            tables
                .statuses
                .get_mut(instance_id)
                .ok_or_else(|| CoreError::ServiceStatusNotFound {
                    instance_id: instance_id.to_string(),
                })?;

        if let Some(last) = record.heartbeat_at
            && sent_at < last
        {
            debug!(instance_id = %instance_id, sent_at = %sent_at, last = %last, "Dropping out-of-order heartbeat");
            return Ok(false);
        }

        record.status = status;
        record.heartbeat_at = Some(sent_at);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record =
            tables
                .statuses
                .get_mut(instance_id)
                .ok_or_else(|| CoreError::ServiceStatusNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_stale_service_statuses(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ServiceStatusRecord>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .statuses
            .values()
            .filter(|r| r.heartbeat_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn register_instance(&self, instance: &NewInstance) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        if tables.instances.contains_key(&instance.instance_id) {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: instance.instance_id.clone(),
            });
        }
        let now = Utc::now();
        tables.instances.insert(
            instance.instance_id.clone(),
            InstanceRecord {
                instance_id: instance.instance_id.clone(),
                tenant_id: instance.tenant_id.clone(),
                name: instance.name.clone(),
                cluster_id: instance.cluster_id.clone(),
                flavor_id: instance.flavor_id.clone(),
                volume_size: instance.volume_size,
                datastore_version_id: instance.datastore_version_id.clone(),
                task: InstanceTask::Building,
                replica_of: instance.replica_of.clone(),
                deleted: false,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
        );
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .instances
            .get(instance_id)
            .filter(|r| !r.deleted)
            .cloned())
    }

    async fn update_instance_task(
        &self,
        instance_id: &str,
        task: InstanceTask,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        record.task = task;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_instance_task(
        &self,
        instance_id: &str,
        from: &[InstanceTask],
        to: InstanceTask,
    ) -> Result<Result<(), InstanceTask>, CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        if !from.contains(&record.task) {
            return Ok(Err(record.task));
        }
        record.task = to;
        record.updated_at = Utc::now();
        Ok(Ok(()))
    }

    async fn update_instance_flavor(
        &self,
        instance_id: &str,
        flavor_id: &str,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        record.flavor_id = flavor_id.to_string();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_instance_datastore_version(
        &self,
        instance_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        record.datastore_version_id = datastore_version_id.to_string();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_instance_replica_of(
        &self,
        instance_id: &str,
        replica_of: Option<&str>,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        record.replica_of = replica_of.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_replicas(&self, master_id: &str) -> Result<Vec<InstanceRecord>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.live_instances_where(|r| r.replica_of.as_deref() == Some(master_id)))
    }

    async fn list_cluster_instances(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.live_instances_where(|r| r.cluster_id.as_deref() == Some(cluster_id)))
    }

    async fn mark_instance_deleted(&self, instance_id: &str) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_instance_mut(instance_id)?;
        let now = Utc::now();
        record.deleted = true;
        record.deleted_at = Some(now);
        record.updated_at = now;
        record.task = InstanceTask::None;
        Ok(())
    }

    async fn create_cluster(&self, cluster: &NewCluster) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        if tables.clusters.contains_key(&cluster.cluster_id) {
            return Err(CoreError::ClusterAlreadyExists {
                cluster_id: cluster.cluster_id.clone(),
            });
        }
        let now = Utc::now();
        tables.clusters.insert(
            cluster.cluster_id.clone(),
            ClusterRecord {
                cluster_id: cluster.cluster_id.clone(),
                name: cluster.name.clone(),
                tenant_id: cluster.tenant_id.clone(),
                datastore_version_id: cluster.datastore_version_id.clone(),
                task: ClusterTask::BuildingInitial,
                deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<ClusterRecord>, CoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clusters
            .get(cluster_id)
            .filter(|r| !r.deleted)
            .cloned())
    }

    async fn update_cluster_task(
        &self,
        cluster_id: &str,
        task: ClusterTask,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_cluster_mut(cluster_id)?;
        record.task = task;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_cluster_task(
        &self,
        cluster_id: &str,
        from: &[ClusterTask],
        to: ClusterTask,
    ) -> Result<Result<(), ClusterTask>, CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_cluster_mut(cluster_id)?;
        if !from.contains(&record.task) {
            return Ok(Err(record.task));
        }
        record.task = to;
        record.updated_at = Utc::now();
        Ok(Ok(()))
    }

    async fn update_cluster_datastore_version(
        &self,
        cluster_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_cluster_mut(cluster_id)?;
        record.datastore_version_id = datastore_version_id.to_string();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_cluster_deleted(&self, cluster_id: &str) -> Result<(), CoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.live_cluster_mut(cluster_id)?;
        let now = Utc::now();
        record.deleted = true;
        record.deleted_at = Some(now);
        record.updated_at = now;
        record.task = ClusterTask::None;
        Ok(())
    }

    async fn list_clusters(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<ClusterRecord>, CoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<ClusterRecord> = tables
            .clusters
            .values()
            .filter(|c| !c.deleted && tenant_id.is_none_or(|t| c.tenant_id == t))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });
        Ok(found)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
