// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the guest agent.

use std::path::PathBuf;

use keel_core::error::CoreError;
use keel_core::guest_api::RemoteError;

/// Result type using GuestError
pub type Result<T> = std::result::Result<T, GuestError>;

/// Errors raised inside the guest agent.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GuestError {
    /// The datastore lacks the capability a requested step needs.
    #[error("operation '{operation}' is not supported by datastore '{datastore}'")]
    Unsupported {
        operation: &'static str,
        datastore: String,
    },

    #[error("engine failed to start: {0}")]
    EngineStartFailed(String),

    #[error("engine failed to stop: {0}")]
    EngineStopFailed(String),

    /// The guest is in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("replication strategy '{offered}' does not match local strategy '{local}'")]
    IncompatibleReplicationStrategy { local: String, offered: String },

    #[error(
        "insufficient space for replica: dataset is {dataset_size} GB but the volume holds {volume_size} GB"
    )]
    InsufficientSpaceForReplica { dataset_size: f64, volume_size: f64 },

    #[error("replication snapshot '{0}' was already consumed")]
    SnapshotAlreadyConsumed(String),

    #[error("replication snapshot '{snapshot_id}' failed: {message}")]
    SnapshotFailed {
        snapshot_id: String,
        message: String,
    },

    /// Reporting status to the control plane failed.
    #[error("failed to report status: {0}")]
    Heartbeat(#[from] CoreError),

    /// Reading or writing a prepare marker file failed.
    #[error("prepare marker I/O failed at {path:?}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A datastore command failed.
    #[error("datastore error: {0}")]
    Datastore(String),
}

impl GuestError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::EngineStartFailed(_) => "ENGINE_START_FAILED",
            Self::EngineStopFailed(_) => "ENGINE_STOP_FAILED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::IncompatibleReplicationStrategy { .. } => "INCOMPATIBLE_REPLICATION_STRATEGY",
            Self::InsufficientSpaceForReplica { .. } => "INSUFFICIENT_SPACE_FOR_REPLICA",
            Self::SnapshotAlreadyConsumed(_) => "SNAPSHOT_ALREADY_CONSUMED",
            Self::SnapshotFailed { .. } => "SNAPSHOT_FAILED",
            Self::Heartbeat(_) => "HEARTBEAT_FAILED",
            Self::Marker { .. } => "MARKER_IO_FAILED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Datastore(_) => "DATASTORE_ERROR",
        }
    }

    /// Convert this error to a [`RemoteError`] for the RPC boundary.
    pub fn to_remote_error(&self) -> RemoteError {
        RemoteError::new(self.error_code(), self.to_string())
    }

    pub(crate) fn unsupported(operation: &'static str, datastore: &str) -> Self {
        Self::Unsupported {
            operation,
            datastore: datastore.to_string(),
        }
    }
}

impl From<GuestError> for RemoteError {
    fn from(err: GuestError) -> Self {
        err.to_remote_error()
    }
}
