// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Control - DBaaS control plane
//!
//! This crate validates and drives operations on database instances and
//! clusters. It never talks to an engine directly: guests are reached through
//! timeout-bounded [`GuestApi`](keel_core::guest_api::GuestApi) calls, compute
//! and volume work is delegated to a [`TaskManagerApi`](task_api::TaskManagerApi),
//! and the visible state is whatever guests last reported through heartbeats.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        keel-control (This Crate)                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────────────┐  │
//! │  │ TaskOrchestrator │  │ClusterTaskMachine│  │ ReplicationCoordinator │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └───────────┬────────────┘  │
//! │           │                     │                        │               │
//! │           │  claim task / read status                    │               │
//! │           ▼                     ▼                        ▼               │
//! │  ┌────────────────────┐  ┌──────────────┐  ┌──────────────────────────┐  │
//! │  │ HeartbeatMonitor   │  │TaskManagerApi│  │ GuestClient (low / high / │  │
//! │  │ stale → UNKNOWN    │  │(orchestration)│  │ snapshot timeouts)       │  │
//! │  └────────────────────┘  └──────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                  │                                         │
//!                  ▼                                         ▼
//!        ┌───────────────────┐                    ┌────────────────────┐
//!        │ keel-core status  │ ◄── heartbeats ─── │  keel-guest agents │
//!        │ store (SQLite)    │                    └────────────────────┘
//!        └───────────────────┘
//! ```
//!
//! # Validate, then act
//!
//! Every mutating operation checks the task marker and service status first
//! and claims the marker atomically. A rejected request fails with
//! [`ControlError::Unprocessable`] and leaves nothing behind. Background
//! operations return a join handle and always reset the marker when they end.
//!
//! # Modules
//!
//! - [`config`]: Environment-based configuration
//! - [`error`]: Error types with stable error codes
//! - [`guest_client`]: Timeout-bounded guest calls and casts
//! - [`task_api`]: Orchestration layer contract
//! - [`task_orchestrator`]: Per-instance operations
//! - [`cluster`]: Cluster task machine
//! - [`replication`]: Replica attach, detach, switchover and failover
//! - [`heartbeat_monitor`]: Marks silent guests UNKNOWN
//! - [`mock`]: Test collaborators

/// Cluster task machine and cluster actions.
pub mod cluster;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for control plane operations.
pub mod error;

/// Timeout-bounded client for guest agents.
pub mod guest_client;

/// Background worker marking stale guests UNKNOWN.
pub mod heartbeat_monitor;

/// Mock collaborators for testing.
pub mod mock;

/// Control-side replication coordination.
pub mod replication;

/// Orchestration layer contract.
pub mod task_api;

/// Per-instance task orchestration.
pub mod task_orchestrator;

pub use cluster::ClusterTaskMachine;
pub use error::{ControlError, Result};
pub use replication::ReplicationCoordinator;
pub use task_orchestrator::TaskOrchestrator;
