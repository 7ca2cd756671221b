// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane heartbeat receiver.
//!
//! The conductor turns guest heartbeats into service status rows. A heartbeat
//! whose `sent_at` is older than the last accepted one is dropped, so a slow
//! message can never overwrite a newer status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::guest_api::{HeartbeatPayload, HeartbeatSink};
use crate::persistence::Persistence;
use crate::status::ServiceStatus;

/// Heartbeat receiver backed by a [`Persistence`] implementation.
#[derive(Clone)]
pub struct Conductor {
    persistence: Arc<dyn Persistence>,
}

impl Conductor {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl HeartbeatSink for Conductor {
    async fn heartbeat(
        &self,
        instance_id: &str,
        payload: HeartbeatPayload,
        sent_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let status = ServiceStatus::from_description(&payload.service_status)?;

        let accepted = self
            .persistence
            .record_heartbeat(instance_id, status, sent_at)
            .await
            .inspect_err(|e| {
                warn!(instance_id = %instance_id, error = %e, "Failed to record heartbeat");
            })?;

        if accepted {
            debug!(instance_id = %instance_id, status = %status, "Heartbeat recorded");
        } else {
            warn!(
                instance_id = %instance_id,
                status = %status,
                sent_at = %sent_at,
                "Ignoring heartbeat older than the last accepted one"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use chrono::Duration;

    fn payload(status: ServiceStatus) -> HeartbeatPayload {
        HeartbeatPayload {
            service_status: status.description().to_string(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_updates_status() {
        let store = Arc::new(MemoryPersistence::new());
        store
            .init_service_status("db-1", ServiceStatus::New)
            .await
            .unwrap();
        let conductor = Conductor::new(store.clone());

        conductor
            .heartbeat("db-1", payload(ServiceStatus::Running), Utc::now())
            .await
            .unwrap();

        let record = store.get_service_status("db-1").await.unwrap().unwrap();
        assert_eq!(record.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_older_heartbeat_is_ignored() {
        let store = Arc::new(MemoryPersistence::new());
        store
            .init_service_status("db-1", ServiceStatus::New)
            .await
            .unwrap();
        let conductor = Conductor::new(store.clone());
        let now = Utc::now();

        conductor
            .heartbeat("db-1", payload(ServiceStatus::Shutdown), now)
            .await
            .unwrap();
        conductor
            .heartbeat(
                "db-1",
                payload(ServiceStatus::Running),
                now - Duration::seconds(5),
            )
            .await
            .unwrap();

        let record = store.get_service_status("db-1").await.unwrap().unwrap();
        assert_eq!(record.status, ServiceStatus::Shutdown);
        assert_eq!(record.heartbeat_at, Some(now));
    }

    #[tokio::test]
    async fn test_unknown_status_description_rejected() {
        let store = Arc::new(MemoryPersistence::new());
        store
            .init_service_status("db-1", ServiceStatus::New)
            .await
            .unwrap();
        let conductor = Conductor::new(store);

        let err = conductor
            .heartbeat(
                "db-1",
                HeartbeatPayload {
                    service_status: "dancing".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
