//! Advisory lock on the settings directory
//!
//! Serializes writers across processes sharing one data directory. The
//! in-process side is a mutex held by `SettingsStore`.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_FILE: &str = ".settings.lock";

/// Exclusive lock on `<conf_dir>/.settings.lock`, released on drop
pub struct SettingsLock {
    _file: File,
    path: PathBuf,
}

impl SettingsLock {
    /// Try to take the lock without blocking
    ///
    /// `Ok(None)` means another process holds it.
    pub fn try_acquire(conf_dir: &Path) -> Result<Option<Self>> {
        fs::create_dir_all(conf_dir).context("Failed to create settings directory")?;

        let path = conf_dir.join(LOCK_FILE);
        let file = File::create(&path).context("Failed to create settings lock file")?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired settings lock {:?}", path);
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!("Settings lock {:?} is held elsewhere", path);
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to acquire settings lock"),
        }
    }

    /// Poll for the lock until `timeout` expires
    pub fn acquire(conf_dir: &Path, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);

        loop {
            if let Some(lock) = Self::try_acquire(conf_dir)? {
                return Ok(lock);
            }
            if start.elapsed() >= timeout {
                anyhow::bail!(
                    "Timed out after {:?} waiting for the settings lock in {}",
                    timeout,
                    conf_dir.display()
                );
            }
            std::thread::sleep(poll_interval);
        }
    }
}

impl Drop for SettingsLock {
    fn drop(&mut self) {
        tracing::debug!("Releasing settings lock {:?}", self.path);
    }
}
