// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-control.

use std::time::Duration;

use keel_core::error::CoreError;
use keel_core::guest_api::RemoteError;
use thiserror::Error;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The target is in a state that does not allow the request. Nothing was
    /// changed.
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// The request itself is malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A guest call did not answer within its timeout class.
    #[error("Guest call '{method}' timed out after {}s", timeout.as_secs())]
    GuestTimeout {
        method: &'static str,
        timeout: Duration,
    },

    /// A guest call returned an error.
    #[error("Guest call '{method}' failed: [{code}] {message}")]
    Guest {
        method: &'static str,
        code: String,
        message: String,
    },

    /// The orchestration layer rejected a request.
    #[error("Task manager error: {0}")]
    TaskManager(String),

    /// Status store operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl ControlError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unprocessable(_) => "UNPROCESSABLE",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::GuestTimeout { .. } => "GUEST_TIMEOUT",
            Self::Guest { .. } => "GUEST_ERROR",
            Self::TaskManager(_) => "TASK_MANAGER_ERROR",
            Self::Core(e) => e.error_code(),
        }
    }

    pub(crate) fn guest(method: &'static str, err: RemoteError) -> Self {
        Self::Guest {
            method,
            code: err.code,
            message: err.message,
        }
    }

    pub(crate) fn instance_not_found(instance_id: &str) -> Self {
        Self::NotFound(format!("instance '{}'", instance_id))
    }

    pub(crate) fn cluster_not_found(cluster_id: &str) -> Self {
        Self::NotFound(format!("cluster '{}'", cluster_id))
    }
}

/// Result type using ControlError.
pub type Result<T> = std::result::Result<T, ControlError>;
