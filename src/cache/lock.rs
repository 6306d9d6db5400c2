//! Per-key advisory file locks
//!
//! Each lock is a `flock(2)`-style lock on a dedicated lock file. The kernel
//! drops it when the holding process exits, so a crashed holder never wedges
//! a key. Every `FileLock` opens its own descriptor, which makes two locks on
//! the same path exclude each other inside one process too.

use crate::error::{HoardError, HoardResult};
use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, warn};

/// How a lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many holders at once; blocks exclusive holders
    Shared,
    /// One holder at a time
    Exclusive,
}

/// An advisory lock on one lock file
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
    mode: Option<LockMode>,
}

impl FileLock {
    /// Create an unlocked handle for `path`; nothing is opened yet
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            mode: None,
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current hold, if any
    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    /// Whether any hold is in place
    pub fn is_locked(&self) -> bool {
        self.mode.is_some()
    }

    /// Block until the lock is held in `mode`.
    ///
    /// Converting an existing hold (shared to exclusive or back) reuses the
    /// same descriptor. Requesting the mode already held is a no-op.
    ///
    /// If the returned future is dropped before it completes, drop this
    /// `FileLock` as well: the pending request may still be granted to its
    /// descriptor afterwards.
    pub async fn lock(&mut self, mode: LockMode) -> HoardResult<()> {
        if self.mode == Some(mode) {
            return Ok(());
        }

        let path = self.path.clone();
        let handle = self
            .open()
            .await?
            .try_clone()
            .await
            .map_err(|e| HoardError::io(format!("duplicating {}", path.display()), e))?;

        debug!("Waiting for {:?} lock on {}", mode, path.display());
        tokio::task::spawn_blocking(move || match mode {
            LockMode::Shared => handle.lock_shared(),
            LockMode::Exclusive => handle.lock_exclusive(),
        })
        .await
        .map_err(|e| HoardError::Internal(format!("lock task for {}: {}", path.display(), e)))?
        .map_err(|e| HoardError::io(format!("locking {}", path.display()), e))?;

        self.mode = Some(mode);
        Ok(())
    }

    /// Drop any hold. The descriptor is closed as well.
    pub fn unlock(&mut self) -> HoardResult<()> {
        self.mode = None;
        match self.file.take() {
            Some(file) => file
                .unlock()
                .map_err(|e| HoardError::io(format!("unlocking {}", self.path.display()), e)),
            None => Ok(()),
        }
    }

    async fn open(&mut self) -> HoardResult<&File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    HoardError::io(format!("creating lock directory {}", parent.display()), e)
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&self.path)
                .await
                .map_err(|e| HoardError::io(format!("opening {}", self.path.display()), e))?;
            self.file = Some(file);
        }

        self.file
            .as_ref()
            .ok_or_else(|| HoardError::Internal("lock file vanished".to_string()))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!("{}", e);
        }
    }
}
