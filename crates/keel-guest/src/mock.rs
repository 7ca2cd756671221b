// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock collaborators for testing.
//!
//! [`MockDatastore`] simulates an engine with every capability, records the
//! steps it was asked to run and fails the ones marked with
//! [`MockDatastore::fail_step`]. No processes or files are touched.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::error::CoreError;
use keel_core::guest_api::{
    BackupInfo, DatabaseSpec, HeartbeatPayload, HeartbeatSink, MasterRef, Overrides,
    PrepareRequest, ReplicaContext, ReplicationSnapshot, SnapshotInfo, UpgradeRequest, UserSpec,
};
use keel_core::status::ServiceStatus;

use crate::datastore::{
    CapturedSnapshot, Configurable, Datastore, EngineControl, Hardenable, Installable,
    ReplicationStrategy, Restorable, UserManageable,
};
use crate::error::GuestError;
use crate::guest_log::{GuestLogDef, LogPublisher};
use crate::host::VolumeStats;
use crate::status::StatusProbe;

/// Replication strategy name reported by [`MockDatastore`].
pub const MOCK_REPLICATION_STRATEGY: &str = "MockReplication";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Probe returning a scripted sequence of statuses.
///
/// Once the script runs out the last status repeats.
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ServiceStatus>>,
    last: Mutex<ServiceStatus>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn always(status: ServiceStatus) -> Self {
        Self::sequence(vec![status])
    }

    pub fn sequence(statuses: Vec<ServiceStatus>) -> Self {
        let last = statuses.last().copied().unwrap_or(ServiceStatus::Unknown);
        Self {
            script: Mutex::new(statuses.into()),
            last: Mutex::new(last),
            probes: AtomicUsize::new(0),
        }
    }

    /// Replace the script with a single repeating status.
    pub fn set(&self, status: ServiceStatus) {
        lock(&self.script).clear();
        *lock(&self.last) = status;
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusProbe for ScriptedProbe {
    async fn probe(&self) -> ServiceStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match lock(&self.script).pop_front() {
            Some(status) => {
                *lock(&self.last) = status;
                status
            }
            None => *lock(&self.last),
        }
    }
}

/// A heartbeat accepted by [`RecordingHeartbeatSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedHeartbeat {
    pub instance_id: String,
    pub status: ServiceStatus,
    pub sent_at: DateTime<Utc>,
}

/// Heartbeat sink that records every report.
#[derive(Default)]
pub struct RecordingHeartbeatSink {
    reports: Mutex<Vec<RecordedHeartbeat>>,
    failing: AtomicBool,
}

impl RecordingHeartbeatSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reports fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<RecordedHeartbeat> {
        lock(&self.reports).clone()
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        lock(&self.reports).iter().map(|r| r.status).collect()
    }
}

#[async_trait]
impl HeartbeatSink for RecordingHeartbeatSink {
    async fn heartbeat(
        &self,
        instance_id: &str,
        payload: HeartbeatPayload,
        sent_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::DatabaseError {
                operation: "heartbeat".to_string(),
                details: "mock sink failure".to_string(),
            });
        }
        let status = ServiceStatus::from_description(&payload.service_status)?;
        lock(&self.reports).push(RecordedHeartbeat {
            instance_id: instance_id.to_string(),
            status,
            sent_at,
        });
        Ok(())
    }
}

/// Log publisher that records published ranges.
#[derive(Default)]
pub struct RecordingLogPublisher {
    published: Mutex<Vec<(String, u64, u64)>>,
    discarded: Mutex<Vec<String>>,
}

impl RecordingLogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published `(log, from, to)` ranges.
    pub fn published(&self) -> Vec<(String, u64, u64)> {
        lock(&self.published).clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        lock(&self.discarded).clone()
    }
}

#[async_trait]
impl LogPublisher for RecordingLogPublisher {
    async fn publish(&self, log: &str, _file: &Path, from: u64, to: u64) -> Result<(), GuestError> {
        lock(&self.published).push((log.to_string(), from, to));
        Ok(())
    }

    async fn discard(&self, log: &str) -> Result<(), GuestError> {
        lock(&self.discarded).push(log.to_string());
        Ok(())
    }
}

/// Simulated datastore.
pub struct MockDatastore {
    full_capabilities: bool,
    running: AtomicBool,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    captures: AtomicUsize,
    capture_delay: Mutex<Duration>,
    overrides_require_restart: AtomicBool,
    volume_stats: Mutex<VolumeStats>,
    master: MasterRef,
    log_defs: Vec<GuestLogDef>,
}

impl Default for MockDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatastore {
    /// Create a stopped mock engine with every capability.
    pub fn new() -> Self {
        Self {
            full_capabilities: true,
            running: AtomicBool::new(false),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
            capture_delay: Mutex::new(Duration::ZERO),
            overrides_require_restart: AtomicBool::new(false),
            volume_stats: Mutex::new(VolumeStats {
                total_gb: 10.0,
                used_gb: 1.0,
            }),
            master: MasterRef {
                host: "10.0.0.1".to_string(),
                port: 3306,
            },
            log_defs: Vec::new(),
        }
    }

    /// Create a mock engine offering only start, stop and probe.
    pub fn engine_only() -> Self {
        Self {
            full_capabilities: false,
            ..Self::new()
        }
    }

    /// Address reported in replica contexts.
    pub fn with_master(mut self, host: &str, port: u16) -> Self {
        self.master = MasterRef {
            host: host.to_string(),
            port,
        };
        self
    }

    pub fn with_log_defs(mut self, defs: Vec<GuestLogDef>) -> Self {
        self.log_defs = defs;
        self
    }

    /// Make the named step fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_step(&self, step: &str) {
        lock(&self.failures).insert(step.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Steps invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of snapshot captures performed.
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn set_capture_delay(&self, delay: Duration) {
        *lock(&self.capture_delay) = delay;
    }

    pub fn set_overrides_require_restart(&self, required: bool) {
        self.overrides_require_restart
            .store(required, Ordering::SeqCst);
    }

    pub fn set_volume_stats(&self, stats: VolumeStats) {
        *lock(&self.volume_stats) = stats;
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn step(&self, name: &str) -> Result<(), GuestError> {
        lock(&self.calls).push(name.to_string());
        if lock(&self.failures).contains(name) {
            return Err(GuestError::Datastore(format!("mock {} failure", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineControl for MockDatastore {
    async fn start(&self) -> Result<(), GuestError> {
        self.step("start")?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _do_not_start_on_reboot: bool) -> Result<(), GuestError> {
        self.step("stop")?;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> ServiceStatus {
        if self.running.load(Ordering::SeqCst) {
            ServiceStatus::Running
        } else {
            ServiceStatus::Shutdown
        }
    }
}

#[async_trait]
impl Installable for MockDatastore {
    async fn install_packages(&self, _packages: &[String]) -> Result<(), GuestError> {
        self.step("install_packages")
    }

    async fn mount_volume(
        &self,
        _device_path: &str,
        _mount_point: &Path,
    ) -> Result<(), GuestError> {
        self.step("mount_volume")
    }

    async fn upgrade(&self, _request: &UpgradeRequest) -> Result<(), GuestError> {
        self.step("upgrade")
    }
}

#[async_trait]
impl Configurable for MockDatastore {
    async fn write_config(
        &self,
        _contents: Option<&str>,
        _overrides: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        self.step("write_config")
    }

    async fn update_overrides(
        &self,
        _overrides: &Overrides,
        _remove: bool,
    ) -> Result<bool, GuestError> {
        self.step("update_overrides")?;
        Ok(self.overrides_require_restart.load(Ordering::SeqCst))
    }

    async fn apply_overrides(&self, _overrides: &Overrides) -> Result<(), GuestError> {
        self.step("apply_overrides")
    }
}

#[async_trait]
impl Restorable for MockDatastore {
    async fn restore(&self, _backup: &BackupInfo, _mount_point: &Path) -> Result<(), GuestError> {
        self.step("restore")
    }
}

#[async_trait]
impl Hardenable for MockDatastore {
    async fn secure(&self, _root_password: Option<&str>) -> Result<(), GuestError> {
        self.step("secure")
    }
}

#[async_trait]
impl UserManageable for MockDatastore {
    async fn create_databases(&self, _databases: &[DatabaseSpec]) -> Result<(), GuestError> {
        self.step("create_databases")
    }

    async fn create_users(&self, _users: &[UserSpec]) -> Result<(), GuestError> {
        self.step("create_users")
    }
}

#[async_trait]
impl ReplicationStrategy for MockDatastore {
    fn name(&self) -> &str {
        MOCK_REPLICATION_STRATEGY
    }

    async fn snapshot_for_replication(
        &self,
        info: &SnapshotInfo,
    ) -> Result<CapturedSnapshot, GuestError> {
        self.step("snapshot_for_replication")?;
        let delay = *lock(&self.capture_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let capture = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CapturedSnapshot {
            snapshot_id: info.id.clone(),
            dataset_size: lock(&self.volume_stats).used_gb,
            log_position: serde_json::json!({ "capture": capture }),
        })
    }

    async fn enable_as_master(&self, _config: &Overrides) -> Result<(), GuestError> {
        self.step("enable_as_master")
    }

    async fn enable_as_slave(
        &self,
        _snapshot: &ReplicationSnapshot,
        _config: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        self.step("enable_as_slave")
    }

    async fn detach_slave(&self, _for_failover: bool) -> Result<(), GuestError> {
        self.step("detach_slave")
    }

    async fn demote_master(&self) -> Result<(), GuestError> {
        self.step("demote_master")
    }

    async fn replica_context(&self) -> Result<ReplicaContext, GuestError> {
        self.step("replica_context")?;
        Ok(ReplicaContext {
            master: self.master.clone(),
            replication_strategy: MOCK_REPLICATION_STRATEGY.to_string(),
            replication_user: Some("replicator".to_string()),
        })
    }

    async fn attach_replica(
        &self,
        _context: &ReplicaContext,
        _config: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        self.step("attach_replica")
    }
}

#[async_trait]
impl Datastore for MockDatastore {
    fn manager(&self) -> &str {
        "mock"
    }

    fn engine(&self) -> &dyn EngineControl {
        self
    }

    fn installer(&self) -> Option<&dyn Installable> {
        self.full_capabilities.then_some(self as &dyn Installable)
    }

    fn configurator(&self) -> Option<&dyn Configurable> {
        self.full_capabilities.then_some(self as &dyn Configurable)
    }

    fn restorer(&self) -> Option<&dyn Restorable> {
        self.full_capabilities.then_some(self as &dyn Restorable)
    }

    fn hardener(&self) -> Option<&dyn Hardenable> {
        self.full_capabilities.then_some(self as &dyn Hardenable)
    }

    fn user_manager(&self) -> Option<&dyn UserManageable> {
        self.full_capabilities.then_some(self as &dyn UserManageable)
    }

    fn replication(&self) -> Option<&dyn ReplicationStrategy> {
        self.full_capabilities
            .then_some(self as &dyn ReplicationStrategy)
    }

    async fn post_prepare(&self, _request: &PrepareRequest) -> Result<(), GuestError> {
        self.step("post_prepare")
    }

    async fn volume_stats(&self, _mount_point: &Path) -> Result<VolumeStats, GuestError> {
        Ok(*lock(&self.volume_stats))
    }

    fn guest_log_defs(&self) -> Vec<GuestLogDef> {
        self.log_defs.clone()
    }
}
