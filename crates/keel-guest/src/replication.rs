// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest-side replication.
//!
//! A master produces one [`ReplicationSnapshot`] per replica. All replicas
//! created in the same batch share a snapshot id; only `replica_number == 1`
//! triggers the capture, the others wait for it and reuse its metadata.
//!
//! ```text
//! master:  NONE ──► SNAPSHOT_TAKEN ──► PROMOTED (enable_as_master)
//! replica: NONE ──► ATTACHING ──► STREAMING ──► DETACHED | PROMOTED
//!                        └──────────┴──► FAILED
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use keel_core::guest_api::{
    DatasetInfo, Overrides, ReplicaContext, ReplicationSnapshot, SnapshotInfo,
};
use keel_core::status::ServiceStatus;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::datastore::{CapturedSnapshot, Datastore, ReplicationStrategy};
use crate::error::GuestError;
use crate::status::GuestStatusMachine;

/// Default bound on how long a replica waits for the first capture.
pub const DEFAULT_SNAPSHOT_WAIT: Duration = Duration::from_secs(36_000);

/// How many snapshot ids are remembered for capture sharing and consumption.
pub const TRACKED_SNAPSHOTS: usize = 32;

/// Replication role and progress of this guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    None,
    SnapshotTaken,
    Attaching,
    Streaming,
    Detached,
    Promoted,
    Failed,
}

type CaptureSlot = watch::Sender<Option<Result<CapturedSnapshot, String>>>;

/// Per-snapshot-id entries, oldest evicted first once `capacity` is reached.
struct RecentSnapshots<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V> RecentSnapshots<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, id: &str) -> Option<&V> {
        self.entries.get(id)
    }

    /// Returns false when `id` is already present.
    fn insert(&mut self, id: &str, value: V) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.entries.insert(id.to_string(), value);
        true
    }
}

/// Replication operations of one guest.
pub struct ReplicationManager {
    datastore: Arc<dyn Datastore>,
    status: Arc<GuestStatusMachine>,
    mount_point: PathBuf,
    snapshot_wait: Duration,
    captures: Mutex<RecentSnapshots<Arc<CaptureSlot>>>,
    consumed: Mutex<RecentSnapshots<()>>,
    state: Mutex<ReplicaState>,
}

impl ReplicationManager {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        status: Arc<GuestStatusMachine>,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            datastore,
            status,
            mount_point: mount_point.into(),
            snapshot_wait: DEFAULT_SNAPSHOT_WAIT,
            captures: Mutex::new(RecentSnapshots::new(TRACKED_SNAPSHOTS)),
            consumed: Mutex::new(RecentSnapshots::new(TRACKED_SNAPSHOTS)),
            state: Mutex::new(ReplicaState::None),
        }
    }

    pub fn with_snapshot_wait(mut self, wait: Duration) -> Self {
        self.snapshot_wait = wait;
        self
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ReplicaState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(instance_id = %self.status.instance_id(), from = ?*current, to = ?state, "Replica state change");
        *current = state;
    }

    fn strategy(&self, operation: &'static str) -> Result<&dyn ReplicationStrategy, GuestError> {
        self.datastore
            .replication()
            .ok_or_else(|| GuestError::unsupported(operation, self.datastore.manager()))
    }

    fn ensure_not_restarting(&self, operation: &str) -> Result<(), GuestError> {
        if self.status.is_restarting() {
            return Err(GuestError::InvalidState(format!(
                "cannot {} while the database is restarting",
                operation
            )));
        }
        Ok(())
    }

    /// Produce a snapshot for one replica (called on the master).
    pub async fn get_replication_snapshot(
        &self,
        info: &SnapshotInfo,
        replica_source_config: Option<&Overrides>,
    ) -> Result<ReplicationSnapshot, GuestError> {
        self.ensure_not_restarting("take a replication snapshot")?;
        let engine_status = self.status.probe().await;
        if engine_status != ServiceStatus::Running {
            return Err(GuestError::InvalidState(format!(
                "replication snapshot requires a running database, status is {}",
                engine_status
            )));
        }

        let strategy = self.strategy("get_replication_snapshot")?;
        info!(
            instance_id = %self.status.instance_id(),
            snapshot_id = %info.id,
            replica_number = info.replica_number,
            "Getting replication snapshot"
        );

        let empty = Overrides::new();
        strategy
            .enable_as_master(replica_source_config.unwrap_or(&empty))
            .await?;

        let captured = self.captured_snapshot(strategy, info).await?;
        let stats = self.datastore.volume_stats(&self.mount_point).await?;
        let context = strategy.replica_context().await?;

        self.set_state(ReplicaState::SnapshotTaken);
        Ok(ReplicationSnapshot {
            dataset: DatasetInfo {
                datastore_manager: self.datastore.manager().to_string(),
                dataset_size: captured.dataset_size,
                volume_size: Some(stats.total_gb.round() as u64),
                snapshot_id: captured.snapshot_id,
            },
            replication_strategy: strategy.name().to_string(),
            master: context.master,
            log_position: captured.log_position,
        })
    }

    /// Capture once per snapshot id; replica 1 captures, the rest wait.
    async fn captured_snapshot(
        &self,
        strategy: &dyn ReplicationStrategy,
        info: &SnapshotInfo,
    ) -> Result<CapturedSnapshot, GuestError> {
        let (slot, capture) = {
            let mut captures = self.captures.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = match captures.get(&info.id) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(watch::channel(None).0);
                    captures.insert(&info.id, slot.clone());
                    slot
                }
            };
            let capture = info.replica_number == 1
                && !matches!(*slot.borrow(), Some(Ok(_)));
            (slot, capture)
        };

        if capture {
            let result = strategy.snapshot_for_replication(info).await;
            let shared = result.as_ref().cloned().map_err(ToString::to_string);
            slot.send_replace(Some(shared));
            return result.map_err(|e| {
                error!(snapshot_id = %info.id, error = %e, "Replication snapshot capture failed");
                GuestError::SnapshotFailed {
                    snapshot_id: info.id.clone(),
                    message: e.to_string(),
                }
            });
        }

        debug!(snapshot_id = %info.id, replica_number = info.replica_number, "Waiting for snapshot capture");
        let mut rx = slot.subscribe();
        let outcome = tokio::time::timeout(self.snapshot_wait, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| GuestError::SnapshotFailed {
                snapshot_id: info.id.clone(),
                message: format!(
                    "no capture within {}s",
                    self.snapshot_wait.as_secs()
                ),
            })?
            .map_err(|_| GuestError::SnapshotFailed {
                snapshot_id: info.id.clone(),
                message: "capture was abandoned".to_string(),
            })?
            .clone();

        match outcome {
            Some(Ok(captured)) => Ok(captured),
            Some(Err(message)) => Err(GuestError::SnapshotFailed {
                snapshot_id: info.id.clone(),
                message,
            }),
            None => Err(GuestError::SnapshotFailed {
                snapshot_id: info.id.clone(),
                message: "capture was abandoned".to_string(),
            }),
        }
    }

    /// Attach this guest as a replica (called on the replica).
    ///
    /// A snapshot that was already consumed is refused without touching the
    /// replica. Any other failure forces the service status to FAILED.
    pub async fn attach_replication_slave(
        &self,
        snapshot: &ReplicationSnapshot,
        slave_config: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        self.ensure_not_restarting("attach a replica")?;
        let snapshot_id = &snapshot.dataset.snapshot_id;
        if !self
            .consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot_id, ())
        {
            warn!(instance_id = %self.status.instance_id(), snapshot_id = %snapshot_id, "Snapshot already consumed");
            return Err(GuestError::SnapshotAlreadyConsumed(snapshot_id.clone()));
        }
        let result = self.attach_with_snapshot(snapshot, slave_config).await;
        self.fail_on_error(result).await
    }

    async fn attach_with_snapshot(
        &self,
        snapshot: &ReplicationSnapshot,
        slave_config: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        let strategy = self.strategy("attach_replication_slave")?;
        if strategy.name() != snapshot.replication_strategy {
            return Err(GuestError::IncompatibleReplicationStrategy {
                local: strategy.name().to_string(),
                offered: snapshot.replication_strategy.clone(),
            });
        }

        let stats = self.datastore.volume_stats(&self.mount_point).await?;
        if stats.total_gb < snapshot.dataset.dataset_size {
            return Err(GuestError::InsufficientSpaceForReplica {
                dataset_size: snapshot.dataset.dataset_size,
                volume_size: stats.total_gb,
            });
        }

        info!(
            instance_id = %self.status.instance_id(),
            snapshot_id = %snapshot.dataset.snapshot_id,
            master = %snapshot.master.host,
            "Attaching replica"
        );
        self.set_state(ReplicaState::Attaching);
        strategy.enable_as_slave(snapshot, slave_config).await?;
        self.set_state(ReplicaState::Streaming);
        Ok(())
    }

    async fn fail_on_error(&self, result: Result<(), GuestError>) -> Result<(), GuestError> {
        if let Err(e) = &result {
            error!(instance_id = %self.status.instance_id(), error = %e, "Replica attach failed");
            self.set_state(ReplicaState::Failed);
            if let Err(report) = self.status.set_status(ServiceStatus::Failed, true).await {
                warn!(instance_id = %self.status.instance_id(), error = %report, "Failed to report FAILED after attach error");
            }
        }
        result
    }

    /// Stop replicating. No-op when this guest is not a replica.
    ///
    /// A replica whose attach failed may be half configured and is detached
    /// as well.
    pub async fn detach_replica(&self, for_failover: bool) -> Result<(), GuestError> {
        self.ensure_not_restarting("detach a replica")?;
        if !matches!(
            self.state(),
            ReplicaState::Attaching | ReplicaState::Streaming | ReplicaState::Failed
        ) {
            debug!(instance_id = %self.status.instance_id(), "Not a replica, nothing to detach");
            return Ok(());
        }

        self.strategy("detach_replica")?
            .detach_slave(for_failover)
            .await?;
        self.set_state(ReplicaState::Detached);
        info!(instance_id = %self.status.instance_id(), for_failover, "Detached replica");
        Ok(())
    }

    /// Stop acting as master. No-op when this guest is not a master.
    pub async fn demote_replication_master(&self) -> Result<(), GuestError> {
        self.ensure_not_restarting("demote a master")?;
        if !matches!(
            self.state(),
            ReplicaState::SnapshotTaken | ReplicaState::Promoted
        ) {
            debug!(instance_id = %self.status.instance_id(), "Not a master, nothing to demote");
            return Ok(());
        }

        self.strategy("demote_replication_master")?
            .demote_master()
            .await?;
        self.set_state(ReplicaState::None);
        info!(instance_id = %self.status.instance_id(), "Demoted replication master");
        Ok(())
    }

    pub async fn enable_as_master(&self, config: &Overrides) -> Result<(), GuestError> {
        self.ensure_not_restarting("enable as master")?;
        self.strategy("enable_as_master")?
            .enable_as_master(config)
            .await?;
        self.set_state(ReplicaState::Promoted);
        info!(instance_id = %self.status.instance_id(), "Enabled as replication master");
        Ok(())
    }

    pub async fn get_replica_context(&self) -> Result<ReplicaContext, GuestError> {
        self.strategy("get_replica_context")?.replica_context().await
    }

    /// Follow the master described by `context`. Failures force FAILED.
    pub async fn attach_replica(
        &self,
        context: &ReplicaContext,
        slave_config: Option<&Overrides>,
    ) -> Result<(), GuestError> {
        self.ensure_not_restarting("attach a replica")?;
        let result = async {
            let strategy = self.strategy("attach_replica")?;
            if strategy.name() != context.replication_strategy {
                return Err(GuestError::IncompatibleReplicationStrategy {
                    local: strategy.name().to_string(),
                    offered: context.replication_strategy.clone(),
                });
            }
            self.set_state(ReplicaState::Attaching);
            strategy.attach_replica(context, slave_config).await?;
            self.set_state(ReplicaState::Streaming);
            info!(
                instance_id = %self.status.instance_id(),
                master = %context.master.host,
                "Attached to new master"
            );
            Ok(())
        }
        .await;
        self.fail_on_error(result).await
    }
}
