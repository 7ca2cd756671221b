// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration layer contract.
//!
//! Compute and volume provisioning, teardown and the long-running parts of
//! cluster operations happen behind this trait. Requests are accepted or
//! rejected; completion is reported back by resetting the task markers.

use async_trait::async_trait;

use crate::error::ControlError;

#[allow(missing_docs)]
#[async_trait]
pub trait TaskManagerApi: Send + Sync {
    async fn create_cluster(&self, cluster_id: &str) -> Result<(), ControlError>;

    async fn grow_cluster(
        &self,
        cluster_id: &str,
        new_instance_ids: &[String],
    ) -> Result<(), ControlError>;

    async fn shrink_cluster(
        &self,
        cluster_id: &str,
        instance_ids: &[String],
    ) -> Result<(), ControlError>;

    async fn upgrade_cluster(
        &self,
        cluster_id: &str,
        datastore_version_id: &str,
    ) -> Result<(), ControlError>;

    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), ControlError>;

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ControlError>;

    /// Resize the compute resources of a stopped instance.
    async fn resize_flavor(&self, instance_id: &str, flavor_id: &str) -> Result<(), ControlError>;
}
