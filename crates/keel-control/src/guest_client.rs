// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timeout-bounded client for guest agents.
//!
//! Every synchronous call is bounded by one of three timeout classes. A call
//! that does not answer in time fails with [`ControlError::GuestTimeout`]; it
//! is never retried. Casts are fire-and-forget: they run on a spawned task and
//! only log failures.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use keel_core::guest_api::{
    GuestApi, Overrides, PrepareRequest, RemoteError, ReplicaContext, ReplicationSnapshot,
    SnapshotInfo, UpgradeRequest,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{ControlError, Result};

/// Timeout class of a guest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Cheap calls: ping, reads.
    Low,
    /// Calls that touch the engine.
    High,
    /// Replication snapshots.
    Snapshot,
}

/// Durations of the timeout classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestTimeouts {
    pub low: Duration,
    pub high: Duration,
    pub snapshot: Duration,
}

impl GuestTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            low: config.agent_call_low_timeout,
            high: config.agent_call_high_timeout,
            snapshot: config.agent_replication_snapshot_timeout,
        }
    }

    pub fn get(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Low => self.low,
            TimeoutClass::High => self.high,
            TimeoutClass::Snapshot => self.snapshot,
        }
    }
}

/// Resolves the guest endpoint of an instance.
pub trait GuestConnector: Send + Sync {
    fn connect(&self, instance_id: &str) -> Option<Arc<dyn GuestApi>>;
}

/// Connector backed by an in-process map of endpoints.
#[derive(Default)]
pub struct StaticGuestConnector {
    guests: RwLock<HashMap<String, Arc<dyn GuestApi>>>,
}

impl StaticGuestConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: impl Into<String>, guest: Arc<dyn GuestApi>) {
        self.guests
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(instance_id.into(), guest);
    }

    pub fn unregister(&self, instance_id: &str) {
        self.guests
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(instance_id);
    }
}

impl GuestConnector for StaticGuestConnector {
    fn connect(&self, instance_id: &str) -> Option<Arc<dyn GuestApi>> {
        self.guests
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }
}

/// Handle of a cast running in the background.
pub type CastHandle = JoinHandle<Result<()>>;

/// Client for one guest agent.
#[derive(Clone)]
pub struct GuestClient {
    instance_id: String,
    api: Arc<dyn GuestApi>,
    timeouts: GuestTimeouts,
}

impl GuestClient {
    pub fn new(
        instance_id: impl Into<String>,
        api: Arc<dyn GuestApi>,
        timeouts: GuestTimeouts,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            api,
            timeouts,
        }
    }

    /// Resolve the guest of `instance_id` through `connector`.
    pub fn connect(
        connector: &dyn GuestConnector,
        instance_id: &str,
        timeouts: GuestTimeouts,
    ) -> Result<Self> {
        let api = connector.connect(instance_id).ok_or_else(|| {
            ControlError::NotFound(format!("guest endpoint for instance '{}'", instance_id))
        })?;
        Ok(Self::new(instance_id, api, timeouts))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn call<T, F>(&self, method: &'static str, class: TimeoutClass, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let timeout = self.timeouts.get(class);
        debug!(instance_id = %self.instance_id, method, timeout_secs = timeout.as_secs(), "Calling guest");

        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(instance_id = %self.instance_id, method, error = %e, "Guest call failed");
                Err(ControlError::guest(method, e))
            }
            Err(_) => {
                error!(instance_id = %self.instance_id, method, timeout_secs = timeout.as_secs(), "Guest call timed out");
                Err(ControlError::GuestTimeout { method, timeout })
            }
        }
    }

    fn cast<F, Fut>(&self, method: &'static str, f: F) -> CastHandle
    where
        F: FnOnce(Arc<dyn GuestApi>) -> Fut,
        Fut: Future<Output = std::result::Result<(), RemoteError>> + Send + 'static,
    {
        let instance_id = self.instance_id.clone();
        let fut = f(self.api.clone());
        debug!(instance_id = %instance_id, method, "Casting to guest");
        tokio::spawn(async move {
            fut.await.map_err(|e| {
                warn!(instance_id = %instance_id, method, error = %e, "Guest cast failed");
                ControlError::guest(method, e)
            })
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.call("rpc_ping", TimeoutClass::Low, self.api.rpc_ping())
            .await
    }

    pub fn prepare(&self, request: PrepareRequest) -> CastHandle {
        self.cast("prepare", move |api| async move { api.prepare(request).await })
    }

    pub async fn restart(&self) -> Result<()> {
        self.call("restart", TimeoutClass::High, self.api.restart())
            .await
    }

    pub async fn stop_db(&self, do_not_start_on_reboot: bool) -> Result<()> {
        self.call(
            "stop_db",
            TimeoutClass::High,
            self.api.stop_db(do_not_start_on_reboot),
        )
        .await
    }

    pub async fn start_db_with_conf_changes(&self, config_contents: Option<String>) -> Result<()> {
        self.call(
            "start_db_with_conf_changes",
            TimeoutClass::High,
            self.api.start_db_with_conf_changes(config_contents),
        )
        .await
    }

    pub async fn update_overrides(&self, overrides: Overrides, remove: bool) -> Result<()> {
        self.call(
            "update_overrides",
            TimeoutClass::High,
            self.api.update_overrides(overrides, remove),
        )
        .await
    }

    pub async fn apply_overrides(&self, overrides: Overrides) -> Result<()> {
        self.call(
            "apply_overrides",
            TimeoutClass::High,
            self.api.apply_overrides(overrides),
        )
        .await
    }

    pub fn upgrade(&self, request: UpgradeRequest) -> CastHandle {
        self.cast("upgrade", move |api| async move { api.upgrade(request).await })
    }

    pub async fn get_replication_snapshot(
        &self,
        snapshot_info: SnapshotInfo,
        replica_source_config: Option<Overrides>,
    ) -> Result<ReplicationSnapshot> {
        self.call(
            "get_replication_snapshot",
            TimeoutClass::Snapshot,
            self.api
                .get_replication_snapshot(snapshot_info, replica_source_config),
        )
        .await
    }

    pub fn attach_replication_slave(
        &self,
        snapshot: ReplicationSnapshot,
        slave_config: Option<Overrides>,
    ) -> CastHandle {
        self.cast("attach_replication_slave", move |api| async move {
            api.attach_replication_slave(snapshot, slave_config).await
        })
    }

    pub async fn detach_replica(&self, for_failover: bool) -> Result<()> {
        self.call(
            "detach_replica",
            TimeoutClass::High,
            self.api.detach_replica(for_failover),
        )
        .await
    }

    pub async fn get_replica_context(&self) -> Result<ReplicaContext> {
        self.call(
            "get_replica_context",
            TimeoutClass::High,
            self.api.get_replica_context(),
        )
        .await
    }

    pub async fn attach_replica(
        &self,
        context: ReplicaContext,
        slave_config: Option<Overrides>,
    ) -> Result<()> {
        self.call(
            "attach_replica",
            TimeoutClass::High,
            self.api.attach_replica(context, slave_config),
        )
        .await
    }

    pub async fn enable_as_master(&self, replica_source_config: Overrides) -> Result<()> {
        self.call(
            "enable_as_master",
            TimeoutClass::High,
            self.api.enable_as_master(replica_source_config),
        )
        .await
    }

    pub async fn demote_replication_master(&self) -> Result<()> {
        self.call(
            "demote_replication_master",
            TimeoutClass::High,
            self.api.demote_replication_master(),
        )
        .await
    }

    pub fn cluster_complete(&self) -> CastHandle {
        self.cast("cluster_complete", |api| async move {
            api.cluster_complete().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGuest;

    fn timeouts() -> GuestTimeouts {
        GuestTimeouts {
            low: Duration::from_secs(15),
            high: Duration::from_secs(600),
            snapshot: Duration::from_secs(36_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_guest_times_out() {
        let guest = Arc::new(MockGuest::new());
        guest.set_delay(Duration::from_secs(20));
        let client = GuestClient::new("db-1", guest, timeouts());

        let err = client.ping().await.unwrap_err();

        match err {
            ControlError::GuestTimeout { method, timeout } => {
                assert_eq!(method, "rpc_ping");
                assert_eq!(timeout, Duration::from_secs(15));
            }
            other => panic!("expected GuestTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_class_allows_slow_restart() {
        let guest = Arc::new(MockGuest::new());
        guest.set_delay(Duration::from_secs(20));
        let client = GuestClient::new("db-1", guest.clone(), timeouts());

        client.restart().await.unwrap();
        assert_eq!(guest.calls(), vec!["restart"]);
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let guest = Arc::new(MockGuest::new());
        guest.fail_method("stop_db");
        let client = GuestClient::new("db-1", guest, timeouts());

        let err = client.stop_db(false).await.unwrap_err();
        assert_eq!(err.error_code(), "GUEST_ERROR");
    }

    #[tokio::test]
    async fn test_cast_reports_failure_through_handle() {
        let guest = Arc::new(MockGuest::new());
        guest.fail_method("cluster_complete");
        let client = GuestClient::new("db-1", guest, timeouts());

        let result = client.cluster_complete().await.unwrap();
        assert!(matches!(result, Err(ControlError::Guest { method: "cluster_complete", .. })));
    }

    #[test]
    fn test_unknown_guest_is_not_found() {
        let connector = StaticGuestConnector::new();
        let err = GuestClient::connect(&connector, "db-404", timeouts())
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
