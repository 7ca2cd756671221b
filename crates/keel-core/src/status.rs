// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status and task enumerations shared by the guest agent and the control plane.
//!
//! Three independent markers describe an instance or cluster:
//!
//! - [`ServiceStatus`]: what the guest says about its database engine. Only the
//!   guest (via heartbeats) and operator resets change it.
//! - [`InstanceTask`]: which long-running control-plane operation currently owns
//!   the instance record.
//! - [`ClusterTask`]: which cluster-wide operation currently owns the cluster.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Engine-level status reported by the guest agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Record created, guest has not reported yet.
    New,
    /// Prepare is running on the guest.
    Building,
    /// Guest accepted prepare but has not started building.
    BuildPending,
    /// Prepare finished but cluster/replica post-processing is still pending.
    InstanceReady,
    /// Engine is running and reachable.
    Running,
    /// Engine is stopped.
    Shutdown,
    /// Engine is running but refusing connections.
    Blocked,
    /// Engine process died unexpectedly.
    Crashed,
    /// Prepare or an engine operation failed.
    Failed,
    /// A configuration change needs a restart to take effect.
    RestartRequired,
    /// Status could not be determined.
    Unknown,
}

impl ServiceStatus {
    /// All statuses, in declaration order.
    pub const ALL: [ServiceStatus; 11] = [
        ServiceStatus::New,
        ServiceStatus::Building,
        ServiceStatus::BuildPending,
        ServiceStatus::InstanceReady,
        ServiceStatus::Running,
        ServiceStatus::Shutdown,
        ServiceStatus::Blocked,
        ServiceStatus::Crashed,
        ServiceStatus::Failed,
        ServiceStatus::RestartRequired,
        ServiceStatus::Unknown,
    ];

    /// Wire description carried in heartbeats and stored in the status table.
    pub fn description(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Building => "building",
            Self::BuildPending => "build pending",
            Self::InstanceReady => "instance ready",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
            Self::Blocked => "blocked",
            Self::Crashed => "crashed",
            Self::Failed => "failed to spawn",
            Self::RestartRequired => "restart required",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a wire description.
    pub fn from_description(description: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.description() == description)
            .ok_or_else(|| CoreError::ValidationError {
                field: "service_status".to_string(),
                message: format!("unknown service status '{}'", description),
            })
    }

    /// Status shown to API clients when no task owns the instance.
    pub fn api_status(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Building | Self::BuildPending => "BUILD",
            Self::InstanceReady | Self::Running => "ACTIVE",
            Self::Shutdown | Self::Crashed => "SHUTDOWN",
            Self::Blocked => "BLOCKED",
            Self::Failed => "FAILED",
            Self::RestartRequired => "RESTART_REQUIRED",
            Self::Unknown => "ERROR",
        }
    }

    /// True while prepare has not established a baseline status yet.
    pub fn is_building(&self) -> bool {
        matches!(self, Self::New | Self::Building | Self::BuildPending)
    }

    /// True for statuses that indicate the instance is broken.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed | Self::Unknown)
    }

    /// Statuses that a live guest keeps refreshing through heartbeats.
    pub fn expects_heartbeats(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::InstanceReady | Self::Blocked | Self::RestartRequired
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Coarse marker for the control-plane operation that owns an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceTask {
    /// No operation in progress.
    None,
    /// Initial provisioning and prepare.
    Building,
    /// Provisioning gave up waiting for the guest.
    BuildingError,
    /// Engine restart.
    Rebooting,
    /// Flavor resize.
    Resizing,
    /// Datastore version upgrade.
    Upgrading,
    /// Teardown requested.
    Deleting,
    /// Replica is being attached to a source, or a source is producing
    /// snapshots for new replicas.
    Attaching,
    /// Replica is being detached from its source.
    Detaching,
    /// Replica is being promoted to replication source.
    Promoting,
    /// Replication source is being ejected after a failure.
    Ejecting,
}

impl InstanceTask {
    /// Stable name used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Building => "BUILDING",
            Self::BuildingError => "BUILDING_ERROR",
            Self::Rebooting => "REBOOTING",
            Self::Resizing => "RESIZING",
            Self::Upgrading => "UPGRADING",
            Self::Deleting => "DELETING",
            Self::Attaching => "ATTACHING",
            Self::Detaching => "DETACHING",
            Self::Promoting => "PROMOTING",
            Self::Ejecting => "EJECTING",
        }
    }

    /// API-facing state for this task, or `None` when the service status decides.
    pub fn api_status(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Building => Some("BUILD"),
            Self::BuildingError => Some("ERROR"),
            Self::Rebooting => Some("REBOOT"),
            Self::Resizing => Some("RESIZE"),
            Self::Upgrading => Some("UPGRADE"),
            Self::Deleting => Some("SHUTDOWN"),
            Self::Attaching => Some("ATTACH"),
            Self::Detaching => Some("DETACH"),
            Self::Promoting => Some("PROMOTE"),
            Self::Ejecting => Some("EJECT"),
        }
    }
}

impl fmt::Display for InstanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceTask {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let task = match s {
            "NONE" => Self::None,
            "BUILDING" => Self::Building,
            "BUILDING_ERROR" => Self::BuildingError,
            "REBOOTING" => Self::Rebooting,
            "RESIZING" => Self::Resizing,
            "UPGRADING" => Self::Upgrading,
            "DELETING" => Self::Deleting,
            "ATTACHING" => Self::Attaching,
            "DETACHING" => Self::Detaching,
            "PROMOTING" => Self::Promoting,
            "EJECTING" => Self::Ejecting,
            other => {
                return Err(CoreError::ValidationError {
                    field: "task".to_string(),
                    message: format!("unknown instance task '{}'", other),
                });
            }
        };
        Ok(task)
    }
}

/// API-facing state combining the task marker and the service status.
pub fn instance_api_status(task: InstanceTask, service: ServiceStatus) -> &'static str {
    task.api_status().unwrap_or_else(|| service.api_status())
}

/// Marker for the cluster-wide operation that owns a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterTask {
    /// No cluster operation in progress.
    None,
    /// Cluster members are being built for the first time.
    BuildingInitial,
    /// Members are being added.
    GrowingCluster,
    /// Members are being removed.
    ShrinkingCluster,
    /// Members are being upgraded to a new datastore version.
    UpgradingCluster,
    /// Cluster is being torn down.
    Deleting,
}

impl ClusterTask {
    /// Stable name used in storage and in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::BuildingInitial => "BUILDING_INITIAL",
            Self::GrowingCluster => "GROWING_CLUSTER",
            Self::ShrinkingCluster => "SHRINKING_CLUSTER",
            Self::UpgradingCluster => "UPGRADING_CLUSTER",
            Self::Deleting => "DELETING",
        }
    }

    /// Human readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::None => "No tasks for the cluster.",
            Self::BuildingInitial => "Building the initial cluster.",
            Self::GrowingCluster => "Increasing the size of the cluster.",
            Self::ShrinkingCluster => "Decreasing the size of the cluster.",
            Self::UpgradingCluster => "Upgrading the cluster to new version.",
            Self::Deleting => "Deleting the cluster.",
        }
    }
}

impl fmt::Display for ClusterTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterTask {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let task = match s {
            "NONE" => Self::None,
            "BUILDING_INITIAL" => Self::BuildingInitial,
            "GROWING_CLUSTER" => Self::GrowingCluster,
            "SHRINKING_CLUSTER" => Self::ShrinkingCluster,
            "UPGRADING_CLUSTER" => Self::UpgradingCluster,
            "DELETING" => Self::Deleting,
            other => {
                return Err(CoreError::ValidationError {
                    field: "task".to_string(),
                    message: format!("unknown cluster task '{}'", other),
                });
            }
        };
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_status_description_round_trips() {
        for status in ServiceStatus::ALL {
            let parsed = ServiceStatus::from_description(status.description()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_service_status_unknown_description() {
        let err = ServiceStatus::from_description("sleeping").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_instance_api_status_prefers_task() {
        assert_eq!(
            instance_api_status(InstanceTask::Rebooting, ServiceStatus::Running),
            "REBOOT"
        );
        assert_eq!(
            instance_api_status(InstanceTask::None, ServiceStatus::Running),
            "ACTIVE"
        );
        assert_eq!(
            instance_api_status(InstanceTask::None, ServiceStatus::Crashed),
            "SHUTDOWN"
        );
        assert_eq!(
            instance_api_status(InstanceTask::BuildingError, ServiceStatus::New),
            "ERROR"
        );
    }

    #[test]
    fn test_building_and_error_classification() {
        assert!(ServiceStatus::BuildPending.is_building());
        assert!(!ServiceStatus::InstanceReady.is_building());
        assert!(ServiceStatus::Unknown.is_error());
        assert!(!ServiceStatus::Shutdown.is_error());
    }

    #[test]
    fn test_task_names_parse() {
        for name in ["NONE", "BUILDING_ERROR", "ATTACHING", "EJECTING"] {
            let task: InstanceTask = name.parse().unwrap();
            assert_eq!(task.as_str(), name);
        }
        for name in ["BUILDING_INITIAL", "SHRINKING_CLUSTER", "DELETING"] {
            let task: ClusterTask = name.parse().unwrap();
            assert_eq!(task.as_str(), name);
        }
        assert!("RESTARTING_CLUSTER".parse::<ClusterTask>().is_err());
    }
}
