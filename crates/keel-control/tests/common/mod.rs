// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-control integration tests.
//!
//! Provides ControlContext wiring the control plane to an in-memory status
//! store, a recording orchestration layer and in-process guest agents that
//! heartbeat through a real Conductor.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_control::cluster::{
    ClusterInstanceSpec, ClusterTaskMachine, CreateClusterRequest, VolumeSpec,
};
use keel_control::config::Config;
use keel_control::guest_client::StaticGuestConnector;
use keel_control::mock::{MockGuest, MockTaskManager};
use keel_control::replication::ReplicationCoordinator;
use keel_control::task_orchestrator::{CreateInstanceRequest, TaskOrchestrator};
use keel_core::conductor::Conductor;
use keel_core::guest_api::PrepareRequest;
use keel_core::persistence::{MemoryPersistence, NewInstance, Persistence};
use keel_core::status::{InstanceTask, ServiceStatus};
use keel_guest::GuestAgent;
use keel_guest::config::GuestConfig;
use keel_guest::mock::MockDatastore;

/// Config with short waits so tests finish quickly.
pub fn test_config() -> Config {
    Config {
        agent_call_low_timeout: Duration::from_secs(1),
        agent_call_high_timeout: Duration::from_secs(2),
        agent_replication_snapshot_timeout: Duration::from_secs(5),
        state_change_wait: Duration::from_secs(2),
        state_change_poll_interval: Duration::from_millis(5),
        usage_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// A guest agent registered with the control plane.
pub struct TestGuest {
    pub agent: Arc<GuestAgent>,
    pub datastore: Arc<MockDatastore>,
}

/// The control plane under test with its collaborators.
pub struct ControlContext {
    pub persistence: Arc<MemoryPersistence>,
    pub connector: Arc<StaticGuestConnector>,
    pub task_manager: Arc<MockTaskManager>,
    pub conductor: Arc<Conductor>,
    pub config: Arc<Config>,
    pub orchestrator: TaskOrchestrator,
    pub clusters: ClusterTaskMachine,
    pub replication: ReplicationCoordinator,
    temp_dir: tempfile::TempDir,
}

impl ControlContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let persistence = Arc::new(MemoryPersistence::new());
        let connector = Arc::new(StaticGuestConnector::new());
        let task_manager = Arc::new(MockTaskManager::new());
        let conductor = Arc::new(Conductor::new(persistence.clone()));
        let config = Arc::new(config);

        let orchestrator = TaskOrchestrator::new(
            persistence.clone(),
            connector.clone(),
            task_manager.clone(),
            config.clone(),
        );
        let clusters =
            ClusterTaskMachine::new(persistence.clone(), task_manager.clone(), config.clone());
        let replication =
            ReplicationCoordinator::new(persistence.clone(), connector.clone(), config.clone());

        Self {
            persistence,
            connector,
            task_manager,
            conductor,
            config,
            orchestrator,
            clusters,
            replication,
            temp_dir,
        }
    }

    /// Start a guest agent for `instance_id` that heartbeats into the store.
    pub fn add_guest(&self, instance_id: &str, datastore: MockDatastore) -> TestGuest {
        let guest_dir = self.temp_dir.path().join(instance_id);
        std::fs::create_dir_all(&guest_dir).expect("Failed to create guest dir");
        let config = GuestConfig {
            guest_id: instance_id.to_string(),
            guest_dir: guest_dir.clone(),
            datastore_manager: "mock".to_string(),
            report_interval: Duration::from_secs(30),
            state_change_wait: Duration::from_millis(500),
            state_change_poll_interval: Duration::from_millis(5),
            mount_point: guest_dir.join("data"),
        };

        let datastore = Arc::new(datastore);
        let agent = Arc::new(GuestAgent::new(
            config,
            datastore.clone(),
            self.conductor.clone(),
            None,
        ));
        self.connector.register(instance_id, agent.clone());
        TestGuest { agent, datastore }
    }

    /// Register a canned guest endpoint for `instance_id`.
    pub fn add_mock_guest(&self, instance_id: &str) -> Arc<MockGuest> {
        let guest = Arc::new(MockGuest::new());
        self.connector.register(instance_id, guest.clone());
        guest
    }

    pub fn create_request(instance_id: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            instance_id: Some(instance_id.to_string()),
            tenant_id: "tenant-1".to_string(),
            name: instance_id.to_string(),
            flavor_id: "small".to_string(),
            volume_size: Some(2),
            datastore_version_id: "mock-1.0".to_string(),
            prepare: PrepareRequest {
                memory_mb: 1024,
                ..Default::default()
            },
        }
    }

    /// Provision `instance_id` through the orchestrator and wait until it
    /// is RUNNING with no task.
    pub async fn running_instance(&self, instance_id: &str) -> TestGuest {
        let guest = self.add_guest(instance_id, MockDatastore::new());
        let (_, watcher) = self
            .orchestrator
            .create_instance(Self::create_request(instance_id))
            .await
            .expect("create_instance rejected");
        watcher
            .await
            .expect("watcher panicked")
            .expect("watcher failed");

        assert_eq!(self.task(instance_id).await, InstanceTask::None);
        assert_eq!(self.service_status(instance_id).await, ServiceStatus::Running);
        guest
    }

    /// Insert a RUNNING instance record without provisioning a guest.
    pub async fn seed_instance(&self, instance_id: &str) {
        self.persistence
            .register_instance(&NewInstance {
                instance_id: instance_id.to_string(),
                tenant_id: "tenant-1".to_string(),
                name: instance_id.to_string(),
                flavor_id: "small".to_string(),
                volume_size: Some(2),
                datastore_version_id: "mock-1.0".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        self.persistence
            .update_instance_task(instance_id, InstanceTask::None)
            .await
            .unwrap();
        self.persistence
            .init_service_status(instance_id, ServiceStatus::New)
            .await
            .unwrap();
        self.persistence
            .set_service_status(instance_id, ServiceStatus::Running)
            .await
            .unwrap();
    }

    pub async fn task(&self, instance_id: &str) -> InstanceTask {
        self.persistence
            .get_instance(instance_id)
            .await
            .unwrap()
            .expect("instance missing")
            .task
    }

    pub async fn service_status(&self, instance_id: &str) -> ServiceStatus {
        self.persistence
            .get_service_status(instance_id)
            .await
            .unwrap()
            .expect("service status missing")
            .status
    }

    pub fn member_spec(flavor_id: &str, volume_size: i64) -> ClusterInstanceSpec {
        ClusterInstanceSpec {
            flavor_id: flavor_id.to_string(),
            volume: Some(VolumeSpec { size: volume_size }),
            ..Default::default()
        }
    }

    /// Create a cluster of `members` identical members.
    pub async fn cluster(&self, name: &str, members: usize) -> String {
        self.clusters
            .create(CreateClusterRequest {
                cluster_id: None,
                name: name.to_string(),
                tenant_id: "tenant-1".to_string(),
                datastore_version_id: "mock-1.0".to_string(),
                instances: vec![Self::member_spec("small", 2); members],
            })
            .await
            .expect("cluster create rejected")
    }

    pub async fn cluster_member_ids(&self, cluster_id: &str) -> Vec<String> {
        self.persistence
            .list_cluster_instances(cluster_id)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect()
    }
}
