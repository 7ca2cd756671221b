// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Core - shared types for the keel DBaaS control plane
//!
//! This crate holds what both sides of the control-plane/guest boundary agree
//! on: service status values, task markers, the guest RPC contract, and the
//! status store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        GuestApi         ┌──────────────────────────┐
//! │        keel-control          │ ──────────────────────► │        keel-guest        │
//! │  TaskOrchestrator            │   (low/high/snapshot    │  GuestAgent              │
//! │  ClusterTaskMachine          │    timeout classes)     │  GuestStatusMachine      │
//! │  ReplicationCoordinator      │                         │  PrepareOrchestrator     │
//! └──────────────┬───────────────┘                         └────────────┬─────────────┘
//!                │ reads status / writes tasks                          │ HeartbeatSink
//!                ▼                                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────────────────────┐
//! │                            keel-core (this crate)                                    │
//! │           Persistence (SQLite / memory)  ◄──────────  Conductor                      │
//! └─────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Service Status State Machine
//!
//! ```text
//!   NEW ──► BUILD_PENDING ──► BUILDING ──┬──► RUNNING ◄──────────┐
//!                                        ├──► INSTANCE_READY ────┘ (cluster_complete)
//!                                        └──► FAILED
//!
//!   RUNNING ──► SHUTDOWN / CRASHED / BLOCKED / RESTART_REQUIRED ──► RUNNING
//!   any ──► UNKNOWN (heartbeat expired or operator reset)
//! ```
//!
//! | Status | Description |
//! |--------|-------------|
//! | `NEW` | Record created, guest has not reported yet |
//! | `BUILDING` | Prepare is running on the guest |
//! | `INSTANCE_READY` | Prepare done, waiting for cluster/replica post-processing |
//! | `RUNNING` | Engine is up |
//! | `FAILED` | Prepare or an engine start failed |
//! | `UNKNOWN` | Status could not be determined |
//!
//! Heartbeat timestamps never move backwards: a heartbeat older than the last
//! accepted one is dropped.
//!
//! # Modules
//!
//! - [`status`]: Service status, instance task and cluster task enums
//! - [`guest_api`]: Guest RPC trait, request/response shapes, heartbeat sink
//! - [`persistence`]: Status store trait with SQLite and in-memory backends
//! - [`conductor`]: Heartbeat receiver writing to the status store
//! - [`error`]: Error types with stable error codes

/// Heartbeat receiver writing service status rows.
pub mod conductor;

/// Error types with stable error codes.
pub mod error;

/// Guest RPC contract shared by the control plane and the guest agent.
pub mod guest_api;

/// Embedded database migrations.
pub mod migrations;

/// Status store abstraction and backends.
pub mod persistence;

/// Status and task enumerations.
pub mod status;

pub use conductor::Conductor;
pub use error::CoreError;
pub use status::{ClusterTask, InstanceTask, ServiceStatus};
