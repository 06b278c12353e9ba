//! Run-directory lifecycle: PID file, contact file, and the liveness
//! check the scheduler loop's health check relies on.
//!
//! Grounded on `src/daemon.rs`'s `DaemonManager` (PID file read/write,
//! `is_process_running` via `kill(pid, None)`), generalized to also
//! carry the contact file the spec's external interfaces name as
//! authoritative for clients and jobs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `.service/contact`: host, port, PID, UUID, version, written once at
/// startup and authoritative for the running scheduler's address.
/// `shared_secret` lets the `wfd message`/CLI poll paths authenticate to
/// the ingress listener the same way a job's own callback does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactFile {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub uuid: String,
    pub version: String,
    pub shared_secret: String,
}

impl ContactFile {
    pub fn new(host: impl Into<String>, port: u16, pid: u32, version: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self { host: host.into(), port, pid, uuid: Uuid::new_v4().to_string(), version: version.into(), shared_secret: shared_secret.into() }
    }
}

/// The `run_dir/.service` layout: contact file, PID file, and the
/// clean-shutdown marker wfstore's schema module also tracks at the
/// store level.
pub struct WorkflowServices {
    run_dir: PathBuf,
    /// Held for the scheduler's lifetime once `write_contact` succeeds;
    /// dropping it (on exit, or if this struct is dropped early) releases
    /// the advisory lock so a subsequent `play` can re-acquire it.
    pid_lock: Mutex<Option<fs::File>>,
}

impl WorkflowServices {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self { run_dir: run_dir.into(), pid_lock: Mutex::new(None) }
    }

    /// Takes an exclusive, advisory lock on the PID file so two `play`
    /// invocations against the same run directory can't both believe
    /// they own it. Non-blocking: a live second scheduler fails fast
    /// instead of waiting for the first to exit.
    fn lock_pid_file(&self) -> Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.pid_path())
            .context("failed to open PID file for locking")?;
        file.try_lock_exclusive().map_err(|_| {
            eyre::eyre!("another scheduler instance already holds the PID file lock at {}", self.pid_path().display())
        })?;
        *self.pid_lock.lock().unwrap() = Some(file);
        Ok(())
    }

    fn service_dir(&self) -> PathBuf {
        self.run_dir.join(".service")
    }

    pub fn contact_path(&self) -> PathBuf {
        self.service_dir().join("contact")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.service_dir().join("scheduler.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.run_dir.join("log").join("scheduler")
    }

    pub fn job_log_dir(&self, cycle: &str, namespace: &str, submit_number: u32) -> PathBuf {
        self.run_dir.join("log").join("job").join(cycle).join(namespace).join(format!("{submit_number:02}"))
    }

    /// Writes the PID and contact files; called once at scheduler
    /// startup, the way `DaemonManager::start` writes its PID file
    /// immediately after spawning.
    pub fn write_contact(&self, contact: &ContactFile) -> Result<()> {
        fs::create_dir_all(self.service_dir()).context("failed to create .service directory")?;
        self.lock_pid_file().context("failed to acquire scheduler PID file lock")?;
        fs::write(self.pid_path(), contact.pid.to_string()).context("failed to write PID file")?;
        let json = serde_json::to_string_pretty(contact).context("failed to serialize contact file")?;
        fs::write(self.contact_path(), json).context("failed to write contact file")?;
        info!(pid = contact.pid, port = contact.port, "wrote contact file");
        Ok(())
    }

    pub fn read_contact(&self) -> Option<ContactFile> {
        let contents = fs::read_to_string(self.contact_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Health check per the scheduler loop's configurable interval:
    /// verifies the run directory and contact file are still intact. If
    /// either vanished, another instance may have taken over and this
    /// one must shut down immediately.
    pub fn is_healthy(&self, expected: &ContactFile) -> bool {
        if !self.run_dir.exists() {
            warn!(run_dir = %self.run_dir.display(), "run directory missing, health check failing");
            return false;
        }
        match self.read_contact() {
            Some(on_disk) if on_disk.uuid == expected.uuid => true,
            Some(on_disk) => {
                warn!(expected_uuid = %expected.uuid, found_uuid = %on_disk.uuid, "contact file replaced by another instance");
                false
            }
            None => {
                warn!("contact file missing, health check failing");
                false
            }
        }
    }

    /// Removes the contact and PID files on a clean exit path.
    pub fn finalize(&self) {
        debug!("finalizing workflow services");
        *self.pid_lock.lock().unwrap() = None;
        let _ = fs::remove_file(self.contact_path());
        let _ = fs::remove_file(self.pid_path());
    }
}

/// `true` if `pid` refers to a live process, checked the way
/// `is_process_running` does: `kill(pid, None)` succeeds without
/// sending a real signal.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_contact_round_trips() {
        let temp = TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let contact = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        services.write_contact(&contact).unwrap();

        let read_back = services.read_contact().unwrap();
        assert_eq!(read_back, contact);
    }

    #[test]
    fn health_check_fails_when_contact_file_missing() {
        let temp = TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let contact = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        assert!(!services.is_healthy(&contact));
    }

    #[test]
    fn health_check_fails_when_uuid_does_not_match() {
        let temp = TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let original = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        services.write_contact(&original).unwrap();

        let other = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        assert!(!services.is_healthy(&other));
    }

    #[test]
    fn finalize_removes_service_files() {
        let temp = TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let contact = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        services.write_contact(&contact).unwrap();
        services.finalize();
        assert!(services.read_contact().is_none());
    }

    #[test]
    fn current_process_is_reported_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn second_write_contact_on_same_run_dir_fails_while_first_holds_the_lock() {
        let temp = TempDir::new().unwrap();
        let first = WorkflowServices::new(temp.path());
        let second = WorkflowServices::new(temp.path());
        let contact = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        first.write_contact(&contact).unwrap();
        assert!(second.write_contact(&contact).is_err());
    }

    #[test]
    fn write_contact_succeeds_again_after_finalize_releases_the_lock() {
        let temp = TempDir::new().unwrap();
        let services = WorkflowServices::new(temp.path());
        let contact = ContactFile::new("localhost", 43001, std::process::id(), "0.1.0", "sekret");
        services.write_contact(&contact).unwrap();
        services.finalize();
        assert!(services.write_contact(&contact).is_ok());
    }
}
