// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-core.
//!
//! Provides a unified error type for persistence, validation, and lookup
//! failures, with stable error codes that survive the guest RPC boundary.

use std::fmt;

use crate::guest_api::RemoteError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the status store and shared domain types.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in the database.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Instance already exists (duplicate registration).
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Cluster was not found in the database.
    ClusterNotFound {
        /// The cluster ID that was not found.
        cluster_id: String,
    },

    /// Cluster already exists.
    ClusterAlreadyExists {
        /// The cluster ID that already exists.
        cluster_id: String,
    },

    /// No service status row exists for the instance.
    ServiceStatusNotFound {
        /// The instance ID.
        instance_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Convert this error to a [`RemoteError`] for the guest RPC boundary.
    pub fn to_remote_error(&self) -> RemoteError {
        RemoteError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::ClusterNotFound { .. } => "CLUSTER_NOT_FOUND",
            Self::ClusterAlreadyExists { .. } => "CLUSTER_ALREADY_EXISTS",
            Self::ServiceStatusNotFound { .. } => "SERVICE_STATUS_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound { .. }
                | Self::ClusterNotFound { .. }
                | Self::ServiceStatusNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::InstanceAlreadyExists { instance_id } => {
                write!(f, "Instance '{}' already exists", instance_id)
            }
            Self::ClusterNotFound { cluster_id } => {
                write!(f, "Cluster '{}' not found", cluster_id)
            }
            Self::ClusterAlreadyExists { cluster_id } => {
                write!(f, "Cluster '{}' already exists", cluster_id)
            }
            Self::ServiceStatusNotFound { instance_id } => {
                write!(f, "No service status recorded for instance '{}'", instance_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_to_remote_error_codes() {
        let test_cases = vec![
            (
                CoreError::InstanceNotFound {
                    instance_id: "i-1".to_string(),
                },
                "INSTANCE_NOT_FOUND",
            ),
            (
                CoreError::ClusterNotFound {
                    cluster_id: "c-1".to_string(),
                },
                "CLUSTER_NOT_FOUND",
            ),
            (
                CoreError::ServiceStatusNotFound {
                    instance_id: "i-1".to_string(),
                },
                "SERVICE_STATUS_NOT_FOUND",
            ),
            (
                CoreError::ValidationError {
                    field: "flavor_id".to_string(),
                    message: "must not be empty".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "locked".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            let remote = error.to_remote_error();
            assert_eq!(remote.code, expected_code);
            assert_eq!(remote.message, error.to_string());
        }
    }

    #[test]
    fn test_display_messages() {
        let err = CoreError::InstanceAlreadyExists {
            instance_id: "db-7".to_string(),
        };
        assert_eq!(err.to_string(), "Instance 'db-7' already exists");

        let err = CoreError::ValidationError {
            field: "volume_size".to_string(),
            message: "too large".to_string(),
        };
        assert_eq!(err.to_string(), "Validation error for 'volume_size': too large");
    }

    #[test]
    fn test_is_not_found() {
        assert!(
            CoreError::ClusterNotFound {
                cluster_id: "x".to_string()
            }
            .is_not_found()
        );
        assert!(
            !CoreError::DatabaseError {
                operation: "q".to_string(),
                details: "d".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let core: CoreError = err.into();
        assert_eq!(core.error_code(), "DATABASE_ERROR");
    }
}
