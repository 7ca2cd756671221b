// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-level probes: filesystem usage and engine process liveness.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_core::status::ServiceStatus;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::GuestError;
use crate::status::StatusProbe;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Size and usage of the filesystem holding the data volume, in GB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeStats {
    pub total_gb: f64,
    pub used_gb: f64,
}

/// Read filesystem statistics for `path`.
pub fn filesystem_stats(path: &Path) -> Result<VolumeStats, GuestError> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|e| GuestError::Datastore(format!("statvfs({:?}) failed: {}", path, e)))?;

    let fragment = stats.fragment_size() as f64;
    let total_gb = stats.blocks() as f64 * fragment / BYTES_PER_GB;
    let free_gb = stats.blocks_free() as f64 * fragment / BYTES_PER_GB;

    Ok(VolumeStats {
        total_gb,
        used_gb: total_gb - free_gb,
    })
}

/// Probes the engine through the pid file it writes on start.
///
/// | pid file | process | status |
/// |----------|---------|--------|
/// | missing | - | `SHUTDOWN` |
/// | present | alive | `RUNNING` |
/// | present | gone | `CRASHED` |
/// | unreadable | - | `UNKNOWN` |
pub struct PidFileProbe {
    pid_file: PathBuf,
}

impl PidFileProbe {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    fn read_pid(&self) -> Result<Option<i32>, String> {
        match std::fs::read_to_string(&self.pid_file) {
            Ok(contents) => contents
                .trim()
                .parse::<i32>()
                .map(Some)
                .map_err(|e| format!("invalid pid file contents: {}", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl StatusProbe for PidFileProbe {
    async fn probe(&self) -> ServiceStatus {
        let pid = match self.read_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) => return ServiceStatus::Shutdown,
            Err(e) => {
                warn!(pid_file = ?self.pid_file, error = %e, "Cannot read engine pid file");
                return ServiceStatus::Unknown;
            }
        };

        // Signal 0 only checks that the process exists.
        match signal::kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => ServiceStatus::Running,
            Err(Errno::ESRCH) => {
                debug!(pid = pid, "Pid file present but process is gone");
                ServiceStatus::Crashed
            }
            Err(e) => {
                warn!(pid = pid, error = %e, "Failed to probe engine process");
                ServiceStatus::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_pid_file_means_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let probe = PidFileProbe::new(dir.path().join("engine.pid"));
        assert_eq!(probe.probe().await, ServiceStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_own_pid_is_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("engine.pid");
        std::fs::write(&pid_file, std::process::id().to_string()).unwrap();

        let probe = PidFileProbe::new(&pid_file);
        assert_eq!(probe.probe().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_garbage_pid_file_is_unknown() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("engine.pid");
        std::fs::write(&pid_file, "not-a-pid").unwrap();

        let probe = PidFileProbe::new(&pid_file);
        assert_eq!(probe.probe().await, ServiceStatus::Unknown);
    }

    #[test]
    fn test_filesystem_stats_of_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let stats = filesystem_stats(dir.path()).unwrap();
        assert!(stats.total_gb > 0.0);
        assert!(stats.used_gb >= 0.0);
        assert!(stats.used_gb <= stats.total_gb);
    }
}
