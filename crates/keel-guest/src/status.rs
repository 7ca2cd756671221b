// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-guest service status machine.
//!
//! Tracks what the guest believes about its engine and reports it to the
//! control plane through a [`HeartbeatSink`]. Two lifecycle flags gate the
//! reports:
//!
//! - `prepare_completed`: backed by the `.guestagent.prepare.end` marker file,
//!   so it survives agent restarts. Until it is set, only forced status
//!   changes are reported.
//! - `restart_mode`: process-local. While set, periodic [`update`] calls do
//!   nothing so a deliberate stop is not reported as a crash.
//! - `failed`: set by a forced FAILED and cleared only by `end_install` or
//!   `end_restart`. While set, unforced reports are dropped.
//!
//! [`update`]: GuestStatusMachine::update

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::guest_api::{HeartbeatPayload, HeartbeatSink};
use keel_core::status::ServiceStatus;
use tracing::{debug, error, info};

use crate::error::GuestError;

/// Default interval between probes in [`GuestStatusMachine::wait_for_real_status_to_change_to`].
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Marker written when prepare starts.
pub const PREPARE_START_FILENAME: &str = ".guestagent.prepare.start";
/// Marker written when prepare completes without error or pending post-processing.
pub const PREPARE_END_FILENAME: &str = ".guestagent.prepare.end";

/// Reads the actual engine status.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self) -> ServiceStatus;
}

/// Prepare marker files with a cached view of the end marker.
struct PrepareMarkers {
    start: PathBuf,
    end: PathBuf,
    completed: Mutex<Option<bool>>,
}

impl PrepareMarkers {
    fn new(dir: &Path) -> Self {
        Self {
            start: dir.join(PREPARE_START_FILENAME),
            end: dir.join(PREPARE_END_FILENAME),
            completed: Mutex::new(None),
        }
    }

    fn completed(&self) -> bool {
        let mut cached = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        *cached.get_or_insert_with(|| self.end.is_file())
    }

    fn refresh(&self) {
        let mut cached = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        *cached = Some(self.end.is_file());
    }

    fn write(path: &Path) -> Result<(), GuestError> {
        std::fs::write(path, b"").map_err(|source| GuestError::Marker {
            path: path.to_path_buf(),
            source,
        })
    }

    fn begin(&self) -> Result<(), GuestError> {
        Self::write(&self.start)?;
        match std::fs::remove_file(&self.end) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(GuestError::Marker {
                    path: self.end.clone(),
                    source,
                });
            }
        }
        self.refresh();
        Ok(())
    }

    fn complete(&self) -> Result<(), GuestError> {
        Self::write(&self.end)?;
        self.refresh();
        Ok(())
    }
}

/// Clears the in-flight flag of [`GuestStatusMachine::update`] on every exit path.
struct UpdateGuard<'a>(&'a AtomicBool);

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Guest-side status state machine.
pub struct GuestStatusMachine {
    instance_id: String,
    markers: PrepareMarkers,
    probe: Arc<dyn StatusProbe>,
    sink: Arc<dyn HeartbeatSink>,
    status: Mutex<Option<ServiceStatus>>,
    restart_mode: AtomicBool,
    failed: AtomicBool,
    updating: AtomicBool,
    probe_interval: Duration,
}

impl GuestStatusMachine {
    /// Create a status machine whose prepare markers live in `guest_dir`.
    pub fn new(
        instance_id: impl Into<String>,
        guest_dir: &Path,
        probe: Arc<dyn StatusProbe>,
        sink: Arc<dyn HeartbeatSink>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            markers: PrepareMarkers::new(guest_dir),
            probe,
            sink,
            status: Mutex::new(None),
            restart_mode: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    /// Override the probe interval used while waiting for a status change.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Last status successfully reported, if any.
    pub fn status(&self) -> Option<ServiceStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once prepare finished cleanly (end marker present).
    pub fn is_installed(&self) -> bool {
        self.markers.completed()
    }

    pub fn is_restarting(&self) -> bool {
        self.restart_mode.load(Ordering::Acquire)
    }

    /// True while a forced FAILED is pinned.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.status() == Some(ServiceStatus::Running)
    }

    /// Read the actual engine status without reporting it.
    pub async fn probe(&self) -> ServiceStatus {
        self.probe.probe().await
    }

    /// Called right before the engine is prepared.
    pub async fn begin_install(&self) -> Result<(), GuestError> {
        self.markers.begin()?;
        self.set_status(ServiceStatus::Building, true).await?;
        Ok(())
    }

    /// Called after prepare, whatever its outcome.
    ///
    /// Writes the end marker only when there was no error and no
    /// post-processing is pending. The final status is FAILED on error,
    /// INSTANCE_READY when post-processing is pending, and the probed engine
    /// status otherwise. The final status is always forced.
    pub async fn end_install(
        &self,
        error_occurred: bool,
        post_processing: bool,
    ) -> Result<(), GuestError> {
        if !(error_occurred || post_processing) {
            self.markers.complete()?;
        }

        let final_status = if error_occurred {
            ServiceStatus::Failed
        } else if post_processing {
            ServiceStatus::InstanceReady
        } else {
            let real = self.probe.probe().await;
            info!(instance_id = %self.instance_id, status = %real, "Current database status");
            real
        };

        info!(instance_id = %self.instance_id, status = %final_status, "Setting final install status");
        self.failed.store(false, Ordering::Release);
        self.set_status(final_status, true).await?;
        Ok(())
    }

    /// Called before the engine is deliberately restarted.
    pub fn begin_restart(&self) {
        self.restart_mode.store(true, Ordering::Release);
    }

    /// Leave restart mode and report the freshly probed status.
    pub async fn end_restart(&self) -> Result<(), GuestError> {
        self.restart_mode.store(false, Ordering::Release);
        info!(instance_id = %self.instance_id, "Ending restart");
        let real = self.probe.probe().await;
        self.failed.store(false, Ordering::Release);
        self.set_status(real, true).await?;
        Ok(())
    }

    /// Report `status` to the control plane.
    ///
    /// Without `force` the report is skipped until prepare has completed
    /// and while a forced FAILED is pinned. Returns whether the status was
    /// reported. The cached status only changes after the sink accepted the
    /// report.
    pub async fn set_status(
        &self,
        status: ServiceStatus,
        force: bool,
    ) -> Result<bool, GuestError> {
        if !(force || self.is_installed()) {
            debug!(instance_id = %self.instance_id, status = %status, "Prepare has not completed yet, skipping heartbeat");
            return Ok(false);
        }
        if !force && self.is_failed() {
            debug!(instance_id = %self.instance_id, status = %status, "Status is pinned to FAILED, skipping heartbeat");
            return Ok(false);
        }
        if force && status == ServiceStatus::Failed {
            self.failed.store(true, Ordering::Release);
        }

        let payload = HeartbeatPayload {
            service_status: status.description().to_string(),
        };
        self.sink
            .heartbeat(&self.instance_id, payload, Utc::now())
            .await
            .inspect_err(|e| {
                error!(instance_id = %self.instance_id, status = %status, error = %e, "Failed to report status");
            })?;

        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
        debug!(instance_id = %self.instance_id, status = %status, "Reported status");
        Ok(true)
    }

    /// Probe and report the engine status.
    ///
    /// Does nothing before prepare completes, during a restart, after a
    /// forced FAILED, or while another update is still running.
    pub async fn update(&self) -> Result<(), GuestError> {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(instance_id = %self.instance_id, "Status update already in progress, skipping");
            return Ok(());
        }
        let _guard = UpdateGuard(&self.updating);

        if !self.is_installed() || self.is_restarting() || self.is_failed() {
            debug!(
                instance_id = %self.instance_id,
                "Database is not installed, is restarting or has failed, skipping status update"
            );
            return Ok(());
        }

        let status = self.probe.probe().await;
        self.set_status(status, false).await?;
        Ok(())
    }

    /// Poll the engine until it reports `target` or `max_wait` elapses.
    ///
    /// Sleeps one probe interval before every probe. The public status is
    /// only updated when `update_db` is set. Returns whether the target was
    /// reached.
    pub async fn wait_for_real_status_to_change_to(
        &self,
        target: ServiceStatus,
        max_wait: Duration,
        update_db: bool,
    ) -> Result<bool, GuestError> {
        let mut waited = Duration::ZERO;
        while waited < max_wait {
            tokio::time::sleep(self.probe_interval).await;
            waited += self.probe_interval;

            let actual = self.probe.probe().await;
            debug!(
                instance_id = %self.instance_id,
                target = %target,
                actual = %actual,
                waited_secs = waited.as_secs(),
                "Waiting for database status to change"
            );
            if actual == target {
                if update_db {
                    self.set_status(actual, false).await?;
                }
                return Ok(true);
            }
        }

        error!(instance_id = %self.instance_id, target = %target, "Timeout while waiting for database status to change");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingHeartbeatSink, ScriptedProbe};
    use tokio::time::Instant;

    fn machine(
        dir: &Path,
        probe: Arc<ScriptedProbe>,
    ) -> (GuestStatusMachine, Arc<RecordingHeartbeatSink>) {
        let sink = Arc::new(RecordingHeartbeatSink::new());
        let machine = GuestStatusMachine::new("db-1", dir, probe, sink.clone());
        (machine, sink)
    }

    #[tokio::test]
    async fn test_install_marker_only_after_clean_end_install() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, _sink) = machine(dir.path(), probe);

        machine.begin_install().await.unwrap();
        assert!(!machine.is_installed());

        for _ in 0..3 {
            machine.end_install(true, false).await.unwrap();
            assert!(!machine.is_installed());
            assert_eq!(machine.status(), Some(ServiceStatus::Failed));
        }

        machine.end_install(false, true).await.unwrap();
        assert!(!machine.is_installed());
        assert_eq!(machine.status(), Some(ServiceStatus::InstanceReady));

        machine.end_install(false, false).await.unwrap();
        assert!(machine.is_installed());
        assert_eq!(machine.status(), Some(ServiceStatus::Running));
        assert!(dir.path().join(PREPARE_START_FILENAME).is_file());
        assert!(dir.path().join(PREPARE_END_FILENAME).is_file());
    }

    #[tokio::test]
    async fn test_begin_install_clears_previous_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(PREPARE_END_FILENAME), b"").unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe);

        assert!(machine.is_installed());
        machine.begin_install().await.unwrap();

        assert!(!machine.is_installed());
        assert_eq!(sink.statuses(), vec![ServiceStatus::Building]);
    }

    #[tokio::test]
    async fn test_marker_survives_new_machine() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
            let (machine, _) = machine(dir.path(), probe);
            machine.begin_install().await.unwrap();
            machine.end_install(false, false).await.unwrap();
        }

        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (restarted, _) = machine(dir.path(), probe);
        assert!(restarted.is_installed());
        assert!(!restarted.is_restarting());
    }

    #[tokio::test]
    async fn test_unforced_status_suppressed_before_prepare() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe);

        assert!(!machine.set_status(ServiceStatus::Running, false).await.unwrap());
        assert_eq!(machine.status(), None);
        assert!(sink.statuses().is_empty());

        assert!(machine.set_status(ServiceStatus::Blocked, true).await.unwrap());
        assert_eq!(machine.status(), Some(ServiceStatus::Blocked));
        assert_eq!(sink.statuses(), vec![ServiceStatus::Blocked]);
    }

    #[tokio::test]
    async fn test_cached_status_unchanged_when_sink_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe);

        machine.set_status(ServiceStatus::Building, true).await.unwrap();
        sink.set_failing(true);

        let err = machine
            .set_status(ServiceStatus::Running, true)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "HEARTBEAT_FAILED");
        assert_eq!(machine.status(), Some(ServiceStatus::Building));
    }

    #[tokio::test]
    async fn test_update_is_gated_by_restart_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe.clone());
        machine.begin_install().await.unwrap();
        machine.end_install(false, false).await.unwrap();

        machine.begin_restart();
        probe.set(ServiceStatus::Shutdown);
        machine.update().await.unwrap();
        assert_eq!(machine.status(), Some(ServiceStatus::Running));

        probe.set(ServiceStatus::Blocked);
        machine.end_restart().await.unwrap();
        assert_eq!(machine.status(), Some(ServiceStatus::Blocked));
        assert_eq!(sink.statuses().last(), Some(&ServiceStatus::Blocked));

        probe.set(ServiceStatus::Running);
        machine.update().await.unwrap();
        assert_eq!(machine.status(), Some(ServiceStatus::Running));
    }

    #[tokio::test]
    async fn test_forced_failed_survives_updates_until_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe.clone());
        machine.begin_install().await.unwrap();
        machine.end_install(false, false).await.unwrap();

        machine.set_status(ServiceStatus::Failed, true).await.unwrap();
        let probes = probe.probe_count();
        machine.update().await.unwrap();
        assert!(!machine.set_status(ServiceStatus::Running, false).await.unwrap());

        assert!(machine.is_failed());
        assert_eq!(machine.status(), Some(ServiceStatus::Failed));
        assert_eq!(probe.probe_count(), probes);
        assert_eq!(
            sink.statuses(),
            vec![
                ServiceStatus::Building,
                ServiceStatus::Running,
                ServiceStatus::Failed
            ]
        );

        machine.begin_restart();
        machine.end_restart().await.unwrap();
        assert!(!machine.is_failed());
        assert_eq!(machine.status(), Some(ServiceStatus::Running));

        probe.set(ServiceStatus::Shutdown);
        machine.update().await.unwrap();
        assert_eq!(machine.status(), Some(ServiceStatus::Shutdown));
    }

    #[tokio::test]
    async fn test_end_install_clears_forced_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, _sink) = machine(dir.path(), probe);

        machine.begin_install().await.unwrap();
        machine.set_status(ServiceStatus::Failed, true).await.unwrap();
        assert!(machine.is_failed());

        machine.end_install(false, false).await.unwrap();
        assert!(!machine.is_failed());
        assert_eq!(machine.status(), Some(ServiceStatus::Running));

        machine.end_install(true, false).await.unwrap();
        assert!(machine.is_failed());
    }

    #[tokio::test]
    async fn test_update_skipped_before_install() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Running));
        let (machine, sink) = machine(dir.path(), probe.clone());

        machine.update().await.unwrap();

        assert_eq!(probe.probe_count(), 0);
        assert!(sink.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_is_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::always(ServiceStatus::Shutdown));
        let (machine, _) = machine(dir.path(), probe.clone());

        let started = Instant::now();
        let reached = machine
            .wait_for_real_status_to_change_to(
                ServiceStatus::Running,
                Duration::from_secs(9),
                false,
            )
            .await
            .unwrap();

        assert!(!reached);
        assert_eq!(probe.probe_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_reports_when_asked() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = Arc::new(ScriptedProbe::sequence(vec![
            ServiceStatus::Shutdown,
            ServiceStatus::Running,
        ]));
        let (machine, sink) = machine(dir.path(), probe.clone());
        machine.begin_install().await.unwrap();
        machine.end_install(false, false).await.unwrap();
        let reports_before = sink.statuses().len();

        let reached = machine
            .wait_for_real_status_to_change_to(
                ServiceStatus::Running,
                Duration::from_secs(30),
                true,
            )
            .await
            .unwrap();

        assert!(reached);
        assert_eq!(sink.statuses().len(), reports_before + 1);
        assert_eq!(machine.status(), Some(ServiceStatus::Running));
    }
}
