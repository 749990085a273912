//! Filesystem artifacts published for the lifetime of a run.
//!
//! Every pid file and symlink the supervisor creates is recorded here, and
//! this is the only place they are removed. Removal happens once, on the
//! first [`ResourceRegistry::cleanup_all`] call, whichever exit path gets
//! there first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult, nonfatal};

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    paths: Mutex<Vec<PathBuf>>,
    drained: AtomicBool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` for removal at cleanup.
    ///
    /// Registering after cleanup already ran removes the path immediately,
    /// so nothing published late can outlive the process.
    pub fn register(&self, path: PathBuf) {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if self.drained.load(Ordering::Acquire) {
            drop(paths);
            warn!(path = %path.display(), "registered after cleanup, removing now");
            remove(&path);
            return;
        }
        debug!(path = %path.display(), "registered");
        paths.push(path);
    }

    /// Paths currently pending removal.
    pub fn registered(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Write the current process id to `path` and register it.
    pub fn publish_pid_file(&self, path: &Path) -> SupervisorResult<()> {
        let pid = nix::unistd::getpid();
        std::fs::write(path, pid.to_string()).map_err(|e| {
            SupervisorError::Config(format!("write pidfile {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), %pid, "pidfile written");
        self.register(path.to_path_buf());
        Ok(())
    }

    /// Point `link` at `target` and register the link.
    ///
    /// A stale symlink left at `link` by an earlier run is replaced; any
    /// other existing file is left alone. Failure is non-fatal and reported
    /// as `false`.
    pub fn publish_symlink(&self, target: &Path, link: &Path) -> bool {
        if let Ok(meta) = link.symlink_metadata() {
            if !meta.file_type().is_symlink() {
                warn!(link = %link.display(), "refusing to replace non-symlink");
                return false;
            }
            nonfatal("remove stale symlink", std::fs::remove_file(link));
        }

        match nonfatal("create symlink", std::os::unix::fs::symlink(target, link)) {
            Some(()) => {
                info!(link = %link.display(), target = %target.display(), "symlink created");
                self.register(link.to_path_buf());
                true
            }
            None => false,
        }
    }

    /// Remove every registered path. Only the first call does any work;
    /// it returns `true`, later calls return `false`.
    pub fn cleanup_all(&self) -> bool {
        let paths = {
            let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
            if self.drained.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *paths)
        };

        for path in &paths {
            remove(path);
        }
        info!(removed = paths.len(), "cleanup complete");
        true
    }
}

fn remove(path: &Path) {
    if nonfatal("remove artifact", std::fs::remove_file(path)).is_some() {
        debug!(path = %path.display(), "removed");
    }
}
