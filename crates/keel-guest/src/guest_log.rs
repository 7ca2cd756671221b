// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest logs: listing, toggling and publishing.
//!
//! SYS logs are always on and can only be published or discarded. USER logs
//! are toggled through engine overrides; toggling a log whose definition
//! requires a restart flips the service status to RESTART_REQUIRED and the
//! log reports `RestartRequired` until the engine restarts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keel_core::guest_api::{GuestLogAction, GuestLogInfo, LogStatus, LogType, Overrides};
use keel_core::status::ServiceStatus;
use tracing::{debug, info};

use crate::datastore::Datastore;
use crate::error::GuestError;
use crate::status::GuestStatusMachine;

/// Definition of one log a datastore exposes.
#[derive(Debug, Clone)]
pub struct GuestLogDef {
    pub name: String,
    pub log_type: LogType,
    pub file: PathBuf,
    /// Toggling only takes effect after an engine restart.
    pub requires_restart: bool,
    pub enable_overrides: Overrides,
    pub disable_overrides: Overrides,
}

/// Ships log contents to external storage.
#[async_trait]
pub trait LogPublisher: Send + Sync {
    /// Publish bytes `from..to` of `file`.
    async fn publish(&self, log: &str, file: &Path, from: u64, to: u64) -> Result<(), GuestError>;

    /// Drop everything published so far for `log`.
    async fn discard(&self, log: &str) -> Result<(), GuestError>;
}

#[derive(Debug, Default, Clone, Copy)]
struct LogState {
    enabled: bool,
    published: u64,
    restart_pending: bool,
}

/// Registry of the logs exposed by one guest.
pub struct GuestLogRegistry {
    datastore: Arc<dyn Datastore>,
    status: Arc<GuestStatusMachine>,
    publisher: Option<Arc<dyn LogPublisher>>,
    defs: BTreeMap<String, GuestLogDef>,
    state: Mutex<HashMap<String, LogState>>,
}

impl GuestLogRegistry {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        status: Arc<GuestStatusMachine>,
        publisher: Option<Arc<dyn LogPublisher>>,
    ) -> Self {
        let defs: BTreeMap<String, GuestLogDef> = datastore
            .guest_log_defs()
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        let state = defs
            .values()
            .map(|def| {
                let initial = LogState {
                    enabled: def.log_type == LogType::Sys,
                    ..LogState::default()
                };
                (def.name.clone(), initial)
            })
            .collect();

        Self {
            datastore,
            status,
            publisher,
            defs,
            state: Mutex::new(state),
        }
    }

    fn state_of(&self, name: &str) -> LogState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    fn update_state(&self, name: &str, f: impl FnOnce(&mut LogState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(state.entry(name.to_string()).or_default());
    }

    fn describe(&self, def: &GuestLogDef) -> GuestLogInfo {
        let state = self.state_of(&def.name);
        let size = std::fs::metadata(&def.file).ok().map(|m| m.len());

        let status = if state.restart_pending {
            LogStatus::RestartRequired
        } else if def.log_type == LogType::User && !state.enabled {
            LogStatus::Disabled
        } else {
            match size {
                Some(size) if size > state.published => {
                    if state.published > 0 {
                        LogStatus::Partial
                    } else {
                        LogStatus::Ready
                    }
                }
                Some(_) => {
                    if state.published > 0 {
                        LogStatus::Published
                    } else {
                        LogStatus::Enabled
                    }
                }
                None => match def.log_type {
                    LogType::User => LogStatus::Disabled,
                    LogType::Sys => LogStatus::Unavailable,
                },
            }
        };

        GuestLogInfo {
            name: def.name.clone(),
            log_type: def.log_type,
            status,
            published: state.published,
            pending: size.map_or(0, |s| s.saturating_sub(state.published)),
        }
    }

    /// Describe every log.
    pub fn list(&self) -> Vec<GuestLogInfo> {
        self.defs.values().map(|def| self.describe(def)).collect()
    }

    /// Enable, disable, publish or discard one log.
    pub async fn action(&self, action: GuestLogAction) -> Result<GuestLogInfo, GuestError> {
        if action.enable && action.disable {
            return Err(GuestError::BadRequest(
                "cannot enable and disable a log at the same time".to_string(),
            ));
        }
        let enable = action.enable || (action.publish && !action.disable);

        let def = self
            .defs
            .get(&action.name)
            .ok_or_else(|| GuestError::NotFound(format!("log '{}'", action.name)))?;

        match def.log_type {
            LogType::Sys => {
                if action.disable || (enable && !action.publish) {
                    return Err(GuestError::BadRequest(format!(
                        "cannot enable or disable system log '{}'",
                        def.name
                    )));
                }
            }
            LogType::User => {
                let enabled = self.state_of(&def.name).enabled;
                if (enable && !enabled) || (action.disable && enabled) {
                    self.toggle(def, action.disable).await?;
                }
            }
        }

        if action.discard {
            self.discard(def).await?;
        }
        if action.publish {
            self.publish(def).await?;
        }
        Ok(self.describe(def))
    }

    async fn toggle(&self, def: &GuestLogDef, disable: bool) -> Result<(), GuestError> {
        let configurator = self
            .datastore
            .configurator()
            .ok_or_else(|| GuestError::unsupported("guest_log_enable", self.datastore.manager()))?;
        let overrides = if disable {
            &def.disable_overrides
        } else {
            &def.enable_overrides
        };

        if def.requires_restart {
            configurator.update_overrides(overrides, false).await?;
            info!(log = %def.name, enabled = !disable, "Log toggle requires a restart");
            self.status
                .set_status(ServiceStatus::RestartRequired, false)
                .await?;
        } else {
            configurator.apply_overrides(overrides).await?;
        }

        let restart_pending = def.requires_restart;
        self.update_state(&def.name, |state| {
            state.enabled = !disable;
            state.restart_pending = restart_pending;
        });
        Ok(())
    }

    async fn publish(&self, def: &GuestLogDef) -> Result<(), GuestError> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or_else(|| GuestError::unsupported("guest_log_publish", self.datastore.manager()))?;

        let size = std::fs::metadata(&def.file)
            .map_err(|e| GuestError::NotFound(format!("log file {:?}: {}", def.file, e)))?
            .len();
        let from = self.state_of(&def.name).published;
        if size <= from {
            debug!(log = %def.name, "Nothing new to publish");
            return Ok(());
        }

        publisher.publish(&def.name, &def.file, from, size).await?;
        self.update_state(&def.name, |state| state.published = size);
        info!(log = %def.name, bytes = size - from, "Published log");
        Ok(())
    }

    async fn discard(&self, def: &GuestLogDef) -> Result<(), GuestError> {
        if let Some(publisher) = &self.publisher {
            publisher.discard(&def.name).await?;
        }
        self.update_state(&def.name, |state| state.published = 0);
        info!(log = %def.name, "Discarded published log");
        Ok(())
    }

    /// Forget pending restarts once the engine has restarted.
    pub fn clear_restart_required(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for log in state.values_mut() {
            log.restart_pending = false;
        }
    }
}
