// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock collaborators for testing.
//!
//! [`MockTaskManager`] accepts every orchestration request unless told to
//! fail it. [`MockGuest`] answers guest calls after an optional delay without
//! touching any engine.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::guest_api::{
    DatasetInfo, GuestApi, GuestLogAction, GuestLogInfo, MasterRef, Overrides, PrepareRequest,
    RemoteError, ReplicaContext, ReplicationSnapshot, SnapshotInfo, UpgradeRequest,
};

use crate::error::ControlError;
use crate::task_api::TaskManagerApi;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestration layer that records requests.
///
/// Calls are recorded as `method:target`. A failure registered for either
/// `method` or `method:target` makes the matching call fail.
#[derive(Default)]
pub struct MockTaskManager {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
}

impl MockTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls matching `key` (`method` or `method:target`).
    pub fn fail_call(&self, key: &str) {
        lock(&self.failures).insert(key.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, method: &str, target: &str) -> Result<(), ControlError> {
        let key = format!("{}:{}", method, target);
        lock(&self.calls).push(key.clone());
        let failures = lock(&self.failures);
        if failures.contains(method) || failures.contains(&key) {
            return Err(ControlError::TaskManager(format!("mock {} failure", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskManagerApi for MockTaskManager {
    async fn create_cluster(&self, cluster_id: &str) -> Result<(), ControlError> {
        self.record("create_cluster", cluster_id)
    }

    async fn grow_cluster(
        &self,
        cluster_id: &str,
        _new_instance_ids: &[String],
    ) -> Result<(), ControlError> {
        self.record("grow_cluster", cluster_id)
    }

    async fn shrink_cluster(
        &self,
        cluster_id: &str,
        _instance_ids: &[String],
    ) -> Result<(), ControlError> {
        self.record("shrink_cluster", cluster_id)
    }

    async fn upgrade_cluster(
        &self,
        cluster_id: &str,
        _datastore_version_id: &str,
    ) -> Result<(), ControlError> {
        self.record("upgrade_cluster", cluster_id)
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), ControlError> {
        self.record("delete_cluster", cluster_id)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), ControlError> {
        self.record("delete_instance", instance_id)
    }

    async fn resize_flavor(&self, instance_id: &str, _flavor_id: &str) -> Result<(), ControlError> {
        self.record("resize_flavor", instance_id)
    }
}

/// Guest endpoint with canned answers.
#[derive(Default)]
pub struct MockGuest {
    delay: Mutex<Duration>,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockGuest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn fail_method(&self, method: &str) {
        lock(&self.failures).insert(method.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    async fn answer(&self, method: &str) -> Result<(), RemoteError> {
        lock(&self.calls).push(method.to_string());
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failures).contains(method) {
            return Err(RemoteError::new(
                "DATASTORE_ERROR",
                format!("mock {} failure", method),
            ));
        }
        Ok(())
    }

    fn context() -> ReplicaContext {
        ReplicaContext {
            master: MasterRef {
                host: "10.0.0.1".to_string(),
                port: 3306,
            },
            replication_strategy: "MockReplication".to_string(),
            replication_user: None,
        }
    }
}

#[async_trait]
impl GuestApi for MockGuest {
    async fn rpc_ping(&self) -> Result<(), RemoteError> {
        self.answer("rpc_ping").await
    }

    async fn prepare(&self, _request: PrepareRequest) -> Result<(), RemoteError> {
        self.answer("prepare").await
    }

    async fn restart(&self) -> Result<(), RemoteError> {
        self.answer("restart").await
    }

    async fn stop_db(&self, _do_not_start_on_reboot: bool) -> Result<(), RemoteError> {
        self.answer("stop_db").await
    }

    async fn start_db_with_conf_changes(
        &self,
        _config_contents: Option<String>,
    ) -> Result<(), RemoteError> {
        self.answer("start_db_with_conf_changes").await
    }

    async fn update_overrides(
        &self,
        _overrides: Overrides,
        _remove: bool,
    ) -> Result<(), RemoteError> {
        self.answer("update_overrides").await
    }

    async fn apply_overrides(&self, _overrides: Overrides) -> Result<(), RemoteError> {
        self.answer("apply_overrides").await
    }

    async fn upgrade(&self, _request: UpgradeRequest) -> Result<(), RemoteError> {
        self.answer("upgrade").await
    }

    async fn get_replication_snapshot(
        &self,
        snapshot_info: SnapshotInfo,
        _replica_source_config: Option<Overrides>,
    ) -> Result<ReplicationSnapshot, RemoteError> {
        self.answer("get_replication_snapshot").await?;
        let context = Self::context();
        Ok(ReplicationSnapshot {
            dataset: DatasetInfo {
                datastore_manager: "mock".to_string(),
                dataset_size: 1.0,
                volume_size: Some(10),
                snapshot_id: snapshot_info.id,
            },
            replication_strategy: context.replication_strategy,
            master: context.master,
            log_position: serde_json::Value::Null,
        })
    }

    async fn attach_replication_slave(
        &self,
        _snapshot: ReplicationSnapshot,
        _slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError> {
        self.answer("attach_replication_slave").await
    }

    async fn detach_replica(&self, _for_failover: bool) -> Result<(), RemoteError> {
        self.answer("detach_replica").await
    }

    async fn get_replica_context(&self) -> Result<ReplicaContext, RemoteError> {
        self.answer("get_replica_context").await?;
        Ok(Self::context())
    }

    async fn attach_replica(
        &self,
        _context: ReplicaContext,
        _slave_config: Option<Overrides>,
    ) -> Result<(), RemoteError> {
        self.answer("attach_replica").await
    }

    async fn enable_as_master(&self, _replica_source_config: Overrides) -> Result<(), RemoteError> {
        self.answer("enable_as_master").await
    }

    async fn demote_replication_master(&self) -> Result<(), RemoteError> {
        self.answer("demote_replication_master").await
    }

    async fn cluster_complete(&self) -> Result<(), RemoteError> {
        self.answer("cluster_complete").await
    }

    async fn guest_log_list(&self) -> Result<Vec<GuestLogInfo>, RemoteError> {
        self.answer("guest_log_list").await?;
        Ok(Vec::new())
    }

    async fn guest_log_action(&self, action: GuestLogAction) -> Result<GuestLogInfo, RemoteError> {
        self.answer("guest_log_action").await?;
        Err(RemoteError::new(
            "NOT_FOUND",
            format!("not found: log '{}'", action.name),
        ))
    }
}
