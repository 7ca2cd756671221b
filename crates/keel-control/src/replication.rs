// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-side replication coordination.
//!
//! Attaching replicas asks the master for one snapshot per replica, all with
//! the same snapshot id so the master captures once. Switchover and failover
//! claim a task marker on every affected instance before touching any guest
//! and reset all of them when done. Guest calls are never retried.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use keel_core::guest_api::{Overrides, ReplicaContext, SnapshotInfo};
use keel_core::persistence::{InstanceRecord, Persistence};
use keel_core::status::{InstanceTask, ServiceStatus};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::guest_client::{CastHandle, GuestClient, GuestConnector, GuestTimeouts};
use crate::heartbeat_monitor::heartbeat_expired;

/// Replication topology changes across instances.
pub struct ReplicationCoordinator {
    persistence: Arc<dyn Persistence>,
    guests: Arc<dyn GuestConnector>,
    config: Arc<Config>,
}

impl ReplicationCoordinator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        guests: Arc<dyn GuestConnector>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            persistence,
            guests,
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

    fn master_of(replica: &InstanceRecord) -> Result<String> {
        replica.replica_of.clone().ok_or_else(|| {
            ControlError::BadRequest(format!(
                "instance '{}' is not a replica",
                replica.instance_id
            ))
        })
    }

    /// Claim `task` on every instance in `ids`, releasing earlier claims when
    /// one of them is refused.
    async fn claim_all(&self, ids: &[String], task: InstanceTask) -> Result<()> {
        for (i, id) in ids.iter().enumerate() {
            let claimed = self
                .persistence
                .claim_instance_task(id, &[InstanceTask::None], task)
                .await;
            let refusal = match claimed {
                Ok(Ok(())) => continue,
                Ok(Err(current)) => ControlError::Unprocessable(format!(
                    "Instance {} cannot perform this action while its task is '{}'.",
                    id, current
                )),
                Err(e) => e.into(),
            };
            self.reset_tasks(&ids[..i]).await;
            return Err(refusal);
        }
        Ok(())
    }

    async fn reset_tasks(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self
                .persistence
                .update_instance_task(id, InstanceTask::None)
                .await
            {
                error!(instance_id = %id, error = %e, "Failed to reset instance task");
            }
        }
    }

    /// Attach `replica_ids` to `master_id`.
    ///
    /// Claims ATTACHING on the master and every replica. Snapshot requests
    /// for all replicas run concurrently with replica numbers `1..=n`; the
    /// master is released once they finish. The returned casts report the
    /// outcome of each attach and release their replica when done.
    pub async fn attach_replicas(
        &self,
        master_id: &str,
        replica_ids: &[String],
    ) -> Result<Vec<(String, CastHandle)>> {
        if replica_ids.is_empty() {
            return Err(ControlError::BadRequest(
                "at least one replica is required".to_string(),
            ));
        }
        if replica_ids.iter().any(|id| id == master_id) {
            return Err(ControlError::BadRequest(
                "an instance cannot replicate from itself".to_string(),
            ));
        }

        self.instance(master_id).await?;
        let master_status = self
            .persistence
            .get_service_status(master_id)
            .await?
            .map(|r| r.status);
        if master_status != Some(ServiceStatus::Running) {
            return Err(ControlError::Unprocessable(format!(
                "Replication source {} is not running.",
                master_id
            )));
        }

        let mut replicas = Vec::with_capacity(replica_ids.len());
        for id in replica_ids {
            let replica = self.instance(id).await?;
            if let Some(source) = &replica.replica_of {
                return Err(ControlError::Unprocessable(format!(
                    "Instance {} already replicates from {}.",
                    id, source
                )));
            }
            replicas.push(self.client(id)?);
        }
        let master_client = self.client(master_id)?;

        let mut members = vec![master_id.to_string()];
        members.extend(replica_ids.iter().cloned());
        self.claim_all(&members, InstanceTask::Attaching).await?;

        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let snapshots = async {
            let strategy = master_client
                .get_replica_context()
                .await?
                .replication_strategy;
            info!(
                master_id = %master_id,
                snapshot_id = %snapshot_id,
                replicas = replica_ids.len(),
                "Requesting replication snapshots"
            );

            let requests = (1..=replica_ids.len()).map(|number| {
                let info = SnapshotInfo {
                    id: snapshot_id.clone(),
                    master_id: master_id.to_string(),
                    replica_number: number as u32,
                    replication_strategy: strategy.clone(),
                };
                master_client.get_replication_snapshot(info, None)
            });
            join_all(requests)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()
        }
        .await;

        self.reset_tasks(&members[..1]).await;
        let snapshots = match snapshots {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(master_id = %master_id, snapshot_id = %snapshot_id, error = %e, "Replication snapshot failed");
                self.reset_tasks(&members[1..]).await;
                return Err(e);
            }
        };

        let mut casts = Vec::with_capacity(replicas.len());
        for (i, (client, snapshot)) in replicas.into_iter().zip(snapshots).enumerate() {
            let replica_id = client.instance_id().to_string();
            if let Err(e) = self
                .persistence
                .set_instance_replica_of(&replica_id, Some(master_id))
                .await
            {
                self.reset_tasks(&members[i + 1..]).await;
                return Err(e.into());
            }
            let cast = client.attach_replication_slave(snapshot, None);
            casts.push((replica_id.clone(), self.release_after(replica_id, cast)));
        }
        Ok(casts)
    }

    /// Reset the replica's task once its attach cast finishes.
    fn release_after(&self, replica_id: String, cast: CastHandle) -> CastHandle {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            let result = match cast.await {
                Ok(result) => result,
                Err(e) => Err(ControlError::Guest {
                    method: "attach_replication_slave",
                    code: "CAST_ABORTED".to_string(),
                    message: e.to_string(),
                }),
            };
            if let Err(e) = &result {
                error!(replica_id = %replica_id, error = %e, "Replica attach failed");
            }
            if let Err(e) = persistence
                .update_instance_task(&replica_id, InstanceTask::None)
                .await
            {
                error!(replica_id = %replica_id, error = %e, "Failed to reset instance task");
            }
            result
        })
    }

    /// Stop a replica from following its source.
    pub async fn detach_replica(&self, replica_id: &str) -> Result<()> {
        let replica = self.instance(replica_id).await?;
        let master_id = Self::master_of(&replica)?;
        let client = self.client(replica_id)?;
        self.claim_all(&[replica_id.to_string()], InstanceTask::Detaching)
            .await?;

        let result = client.detach_replica(false).await;
        if result.is_ok() {
            info!(replica_id = %replica_id, master_id = %master_id, "Replica detached");
            if let Err(e) = self.persistence.set_instance_replica_of(replica_id, None).await {
                self.reset_tasks(&[replica_id.to_string()]).await;
                return Err(e.into());
            }
        }
        self.reset_tasks(&[replica_id.to_string()]).await;
        result
    }

    /// Switch roles between a healthy master and one of its replicas.
    pub async fn promote_to_replica_source(&self, replica_id: &str) -> Result<()> {
        let replica = self.instance(replica_id).await?;
        let master_id = Self::master_of(&replica)?;
        self.instance(&master_id).await?;
        let siblings: Vec<String> = self
            .persistence
            .list_replicas(&master_id)
            .await?
            .into_iter()
            .map(|r| r.instance_id)
            .filter(|id| id != replica_id)
            .collect();

        let new_master = self.client(replica_id)?;
        let old_master = self.client(&master_id)?;
        let sibling_clients = siblings
            .iter()
            .map(|id| self.client(id))
            .collect::<Result<Vec<_>>>()?;

        let mut members = vec![replica_id.to_string(), master_id.clone()];
        members.extend(siblings.iter().cloned());
        self.claim_all(&members, InstanceTask::Promoting).await?;
        info!(replica_id = %replica_id, master_id = %master_id, "Promoting replica to replication source");

        let result = async {
            old_master.demote_replication_master().await?;
            let context = self.enable_new_master(&new_master).await?;
            old_master.attach_replica(context.clone(), None).await?;
            self.persistence
                .set_instance_replica_of(&master_id, Some(replica_id))
                .await?;
            self.reattach_siblings(&sibling_clients, &context, replica_id)
                .await
        }
        .await;

        self.reset_tasks(&members).await;
        if let Err(e) = &result {
            error!(replica_id = %replica_id, master_id = %master_id, error = %e, "Promotion failed");
        }
        result
    }

    /// Promote a replica of a master that stopped reporting. Returns the id
    /// of the new master.
    pub async fn eject_replica_source(
        &self,
        master_id: &str,
        candidate: Option<&str>,
    ) -> Result<String> {
        self.instance(master_id).await?;
        let record = self.persistence.get_service_status(master_id).await?;
        let expired = record.is_some_and(|r| {
            heartbeat_expired(&r, self.config.agent_heartbeat_expiry, Utc::now())
        });
        if !expired {
            return Err(ControlError::Unprocessable(format!(
                "Replication source {} is still reporting and cannot be ejected.",
                master_id
            )));
        }

        let replicas: Vec<String> = self
            .persistence
            .list_replicas(master_id)
            .await?
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        let new_master_id = match candidate {
            Some(id) if replicas.iter().any(|r| r == id) => id.to_string(),
            Some(id) => {
                return Err(ControlError::BadRequest(format!(
                    "instance '{}' is not a replica of '{}'",
                    id, master_id
                )));
            }
            None => replicas.first().cloned().ok_or_else(|| {
                ControlError::BadRequest(format!("instance '{}' has no replicas", master_id))
            })?,
        };

        let new_master = self.client(&new_master_id)?;
        let siblings: Vec<String> = replicas
            .iter()
            .filter(|id| **id != new_master_id)
            .cloned()
            .collect();
        let sibling_clients = siblings
            .iter()
            .map(|id| self.client(id))
            .collect::<Result<Vec<_>>>()?;

        let mut members = vec![master_id.to_string()];
        members.extend(replicas.iter().cloned());
        self.claim_all(&members, InstanceTask::Ejecting).await?;
        warn!(master_id = %master_id, new_master_id = %new_master_id, "Ejecting replication source");

        let result = async {
            let context = self.enable_new_master(&new_master).await?;
            self.reattach_siblings(&sibling_clients, &context, &new_master_id)
                .await?;
            self.persistence
                .set_instance_replica_of(master_id, None)
                .await?;
            Ok::<(), ControlError>(())
        }
        .await;

        self.reset_tasks(&members).await;
        result.map(|()| new_master_id)
    }

    /// Detach `client` from its source and make it a master.
    async fn enable_new_master(&self, client: &GuestClient) -> Result<ReplicaContext> {
        client.detach_replica(true).await?;
        client.enable_as_master(Overrides::new()).await?;
        let context = client.get_replica_context().await?;
        self.persistence
            .set_instance_replica_of(client.instance_id(), None)
            .await?;
        Ok(context)
    }

    async fn reattach_siblings(
        &self,
        siblings: &[GuestClient],
        context: &ReplicaContext,
        new_master_id: &str,
    ) -> Result<()> {
        for sibling in siblings {
            sibling.detach_replica(true).await?;
            sibling.attach_replica(context.clone(), None).await?;
            self.persistence
                .set_instance_replica_of(sibling.instance_id(), Some(new_master_id))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_client::StaticGuestConnector;
    use crate::mock::MockGuest;
    use keel_core::persistence::{MemoryPersistence, NewInstance};

    struct Fixture {
        persistence: Arc<MemoryPersistence>,
        guests: Vec<(String, Arc<MockGuest>)>,
        coordinator: ReplicationCoordinator,
    }

    impl Fixture {
        fn guest(&self, id: &str) -> &MockGuest {
            &self
                .guests
                .iter()
                .find(|(g, _)| g == id)
                .unwrap()
                .1
        }
    }

    async fn fixture(ids: &[&str], replica_of: &[(&str, &str)]) -> Fixture {
        let persistence = Arc::new(MemoryPersistence::new());
        let connector = Arc::new(StaticGuestConnector::new());
        let mut guests = Vec::new();
        for id in ids {
            persistence
                .register_instance(&NewInstance {
                    instance_id: id.to_string(),
                    name: id.to_string(),
                    flavor_id: "small".to_string(),
                    replica_of: replica_of
                        .iter()
                        .find(|(r, _)| r == id)
                        .map(|(_, m)| m.to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
            persistence
                .update_instance_task(id, InstanceTask::None)
                .await
                .unwrap();
            persistence
                .init_service_status(id, ServiceStatus::New)
                .await
                .unwrap();
            persistence
                .record_heartbeat(id, ServiceStatus::Running, Utc::now())
                .await
                .unwrap();
            let guest = Arc::new(MockGuest::new());
            connector.register(*id, guest.clone());
            guests.push((id.to_string(), guest));
        }
        let coordinator = ReplicationCoordinator::new(
            persistence.clone(),
            connector,
            Arc::new(Config::default()),
        );
        Fixture {
            persistence,
            guests,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_attach_requests_one_snapshot_per_replica() {
        let f = fixture(&["master", "r1", "r2"], &[]).await;

        let casts = f
            .coordinator
            .attach_replicas("master", &["r1".to_string(), "r2".to_string()])
            .await
            .unwrap();
        for (_, cast) in casts {
            cast.await.unwrap().unwrap();
        }

        let snapshots = f
            .guest("master")
            .calls()
            .into_iter()
            .filter(|c| c == "get_replication_snapshot")
            .count();
        assert_eq!(snapshots, 2);
        assert_eq!(f.guest("r1").calls(), vec!["attach_replication_slave"]);
        let r2 = f.persistence.get_instance("r2").await.unwrap().unwrap();
        assert_eq!(r2.replica_of.as_deref(), Some("master"));
        for id in ["master", "r1", "r2"] {
            let record = f.persistence.get_instance(id).await.unwrap().unwrap();
            assert_eq!(record.task, InstanceTask::None);
        }
    }

    #[tokio::test]
    async fn test_attach_rejects_busy_replica() {
        let f = fixture(&["master", "r1", "r2"], &[]).await;
        f.persistence
            .update_instance_task("r2", InstanceTask::Deleting)
            .await
            .unwrap();

        let err = f
            .coordinator
            .attach_replicas("master", &["r1".to_string(), "r2".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        let master = f.persistence.get_instance("master").await.unwrap().unwrap();
        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        let r2 = f.persistence.get_instance("r2").await.unwrap().unwrap();
        assert_eq!(master.task, InstanceTask::None);
        assert_eq!(r1.task, InstanceTask::None);
        assert_eq!(r2.task, InstanceTask::Deleting);
        assert_eq!(r2.replica_of, None);
        assert!(f.guest("master").calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_rejects_replica_of_other_source() {
        let f = fixture(&["master", "other", "r1"], &[("r1", "other")]).await;

        let err = f
            .coordinator
            .attach_replicas("master", &["r1".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        assert_eq!(r1.replica_of.as_deref(), Some("other"));
        assert_eq!(r1.task, InstanceTask::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_holds_master_during_snapshot() {
        let f = fixture(&["master", "r1"], &[]).await;
        f.guest("master").set_delay(std::time::Duration::from_secs(1));

        let replicas = ["r1".to_string()];
        let observe = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let master = f.persistence.get_instance("master").await.unwrap().unwrap();
            let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
            (master.task, r1.task)
        };
        let (casts, during) = tokio::join!(
            f.coordinator.attach_replicas("master", &replicas),
            observe
        );
        assert_eq!(during, (InstanceTask::Attaching, InstanceTask::Attaching));

        let master = f.persistence.get_instance("master").await.unwrap().unwrap();
        assert_eq!(master.task, InstanceTask::None);
        for (_, cast) in casts.unwrap() {
            cast.await.unwrap().unwrap();
        }
        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        assert_eq!(r1.task, InstanceTask::None);
    }

    #[tokio::test]
    async fn test_failed_snapshot_releases_all_claims() {
        let f = fixture(&["master", "r1"], &[]).await;
        f.guest("master").fail_method("get_replication_snapshot");

        let err = f
            .coordinator
            .attach_replicas("master", &["r1".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "GUEST_ERROR");

        for id in ["master", "r1"] {
            let record = f.persistence.get_instance(id).await.unwrap().unwrap();
            assert_eq!(record.task, InstanceTask::None);
            assert_eq!(record.replica_of, None);
        }
        assert!(f.guest("r1").calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_requires_running_master() {
        let f = fixture(&["master", "r1"], &[]).await;
        f.persistence
            .set_service_status("master", ServiceStatus::Shutdown)
            .await
            .unwrap();

        let err = f
            .coordinator
            .attach_replicas("master", &["r1".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNPROCESSABLE");
        assert!(f.guest("master").calls().is_empty());
    }

    #[tokio::test]
    async fn test_detach_failure_surfaces_and_resets_task() {
        let f = fixture(&["master", "r1"], &[("r1", "master")]).await;
        f.guest("r1").fail_method("detach_replica");

        let err = f.coordinator.detach_replica("r1").await.unwrap_err();
        assert_eq!(err.error_code(), "GUEST_ERROR");

        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        assert_eq!(r1.task, InstanceTask::None);
        assert_eq!(r1.replica_of.as_deref(), Some("master"));
        // Never retried
        assert_eq!(f.guest("r1").calls(), vec!["detach_replica"]);
    }

    #[tokio::test]
    async fn test_detach_of_non_replica_is_rejected() {
        let f = fixture(&["master"], &[]).await;
        let err = f.coordinator.detach_replica("master").await.unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_promote_switches_roles() {
        let f = fixture(
            &["master", "r1", "r2"],
            &[("r1", "master"), ("r2", "master")],
        )
        .await;

        f.coordinator.promote_to_replica_source("r1").await.unwrap();

        assert_eq!(f.guest("master").calls(), vec!["demote_replication_master", "attach_replica"]);
        assert_eq!(
            f.guest("r1").calls(),
            vec!["detach_replica", "enable_as_master", "get_replica_context"]
        );
        assert_eq!(f.guest("r2").calls(), vec!["detach_replica", "attach_replica"]);

        let master = f.persistence.get_instance("master").await.unwrap().unwrap();
        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        let r2 = f.persistence.get_instance("r2").await.unwrap().unwrap();
        assert_eq!(master.replica_of.as_deref(), Some("r1"));
        assert_eq!(r1.replica_of, None);
        assert_eq!(r2.replica_of.as_deref(), Some("r1"));
        for instance in [master, r1, r2] {
            assert_eq!(instance.task, InstanceTask::None);
        }
    }

    #[tokio::test]
    async fn test_promote_rejected_when_member_busy() {
        let f = fixture(
            &["master", "r1", "r2"],
            &[("r1", "master"), ("r2", "master")],
        )
        .await;
        f.persistence
            .update_instance_task("r2", InstanceTask::Rebooting)
            .await
            .unwrap();

        let err = f.coordinator.promote_to_replica_source("r1").await.unwrap_err();
        assert_eq!(err.error_code(), "UNPROCESSABLE");

        // Earlier claims released, busy member untouched
        let r1 = f.persistence.get_instance("r1").await.unwrap().unwrap();
        let master = f.persistence.get_instance("master").await.unwrap().unwrap();
        let r2 = f.persistence.get_instance("r2").await.unwrap().unwrap();
        assert_eq!(r1.task, InstanceTask::None);
        assert_eq!(master.task, InstanceTask::None);
        assert_eq!(r2.task, InstanceTask::Rebooting);
        assert!(f.guest("master").calls().is_empty());
    }

    #[tokio::test]
    async fn test_eject_refused_while_master_reports() {
        let f = fixture(&["master", "r1"], &[("r1", "master")]).await;
        let err = f
            .coordinator
            .eject_replica_source("master", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNPROCESSABLE");
    }

    #[tokio::test]
    async fn test_eject_promotes_first_replica() {
        let f = fixture(
            &["master", "r1", "r2"],
            &[("r1", "master"), ("r2", "master")],
        )
        .await;
        // Re-seed the master with an old heartbeat
        f.persistence
            .init_service_status("master", ServiceStatus::New)
            .await
            .unwrap();
        f.persistence
            .record_heartbeat(
                "master",
                ServiceStatus::Running,
                Utc::now() - chrono::Duration::seconds(600),
            )
            .await
            .unwrap();

        let new_master = f.coordinator.eject_replica_source("master", None).await.unwrap();
        assert_eq!(new_master, "r1");

        assert!(f.guest("master").calls().is_empty());
        assert_eq!(f.guest("r2").calls(), vec!["detach_replica", "attach_replica"]);
        let r2 = f.persistence.get_instance("r2").await.unwrap().unwrap();
        let master = f.persistence.get_instance("master").await.unwrap().unwrap();
        assert_eq!(r2.replica_of.as_deref(), Some("r1"));
        assert_eq!(master.replica_of, None);
        assert_eq!(master.task, InstanceTask::None);
    }
}
