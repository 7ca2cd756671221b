// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Guest - the agent running next to each managed database engine
//!
//! The agent prepares the engine on first boot, brackets restarts, reports the
//! engine status to the control plane and takes part in replication.
//!
//! # Architecture
//!
//! ```text
//!            GuestApi (from keel-control)
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         GuestAgent                            │
//! │  ┌────────────────────┐ ┌───────────────────┐ ┌────────────┐ │
//! │  │ PrepareOrchestrator│ │ ReplicationManager│ │ GuestLog   │ │
//! │  └─────────┬──────────┘ └─────────┬─────────┘ │ Registry   │ │
//! │            ▼                      │           └────────────┘ │
//! │  ┌────────────────────┐           │                          │
//! │  │ ServiceController  │◄──────────┘                          │
//! │  └─────────┬──────────┘                                      │
//! │            ▼                                                 │
//! │  ┌────────────────────┐   update()  ┌───────────────┐        │
//! │  │ GuestStatusMachine │◄────────────│ StatusReporter│        │
//! │  └─────────┬──────────┘             └───────────────┘        │
//! └────────────┼─────────────────────────────────────────────────┘
//!              │ HeartbeatSink
//!              ▼
//!     keel-core Conductor ──► status store
//! ```
//!
//! # Prepare markers
//!
//! | File | Written | Meaning |
//! |------|---------|---------|
//! | `.guestagent.prepare.start` | `begin_install` | Prepare has started at least once |
//! | `.guestagent.prepare.end` | clean `end_install` | Prepare completed, periodic reports enabled |
//!
//! # Datastores
//!
//! A datastore implements [`datastore::Datastore`]: engine control is
//! required, installation, configuration, restore, hardening, user management
//! and replication are optional capabilities. Asking for a missing capability
//! yields [`GuestError::Unsupported`].

pub mod agent;
pub mod app;
pub mod config;
pub mod datastore;
pub mod error;
pub mod guest_log;
pub mod host;

/// Mock collaborators for tests and in-process wiring.
pub mod mock;

pub mod prepare;
pub mod replication;
pub mod reporter;
pub mod status;

pub use agent::GuestAgent;
pub use error::{GuestError, Result};
pub use status::GuestStatusMachine;
