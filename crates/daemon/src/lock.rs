//! Store-wide reconcile lock
//!
//! `run` and `once` both reconcile; two processes pointed at the same store
//! would otherwise drive the same nodes at the same time.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock on `<store>/reconcile.lock`, released on drop
#[derive(Debug)]
pub struct ReconcileLock {
    _file: File,
    path: PathBuf,
}

impl ReconcileLock {
    pub fn acquire(store_path: &Path) -> anyhow::Result<Self> {
        let path = store_path.join("reconcile.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!("Acquired {}", path.display());
                Ok(Self { _file: file, path })
            }
            Err(TryLockError::WouldBlock) => anyhow::bail!(
                "another divisorad is already reconciling {} (lock {})",
                store_path.display(),
                path.display()
            ),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
