//! Per-path append lock.
//!
//! Two layers: an in-process mutex per canonical path (so threads queue
//! without spinning on the OS lock), then an advisory exclusive `flock` on
//! the store file so separate processes cooperate too. Both are bounded by
//! one deadline and both are released when the [`AppendGuard`] drops.

use crate::error::StoreError;
use fs2::FileExt;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Interval between OS lock attempts while another process holds it.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Table of in-process locks keyed by canonical store path.
///
/// Entries are weak; a path's entry is dropped once no guard or waiter
/// holds it, so the table does not grow with every path ever written.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>,
}

impl LockTable {
    /// Empty table, isolated from the process-wide one.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide table, created on first use.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<LockTable>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(LockTable::new))
    }

    /// Number of paths with a live holder or waiter.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Whether no path is currently held or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock `path` for appending through `file`, waiting at most `timeout`.
    ///
    /// `file` must be an open handle to the store at `path`; the guard takes
    /// ownership of it and hands it back through [`AppendGuard::file`].
    pub fn acquire(
        self: &Arc<Self>,
        path: &Path,
        file: File,
        timeout: Duration,
    ) -> Result<AppendGuard, StoreError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let slot = self.slot(path);
        let Some(held) = slot.try_lock_arc_for(timeout) else {
            drop(slot);
            self.evict(path);
            return Err(self.timed_out(path, started));
        };
        drop(slot);

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(held);
                        self.evict(path);
                        return Err(self.timed_out(path, started));
                    }
                    std::thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(err) => {
                    drop(held);
                    self.evict(path);
                    return Err(StoreError::Io(err));
                }
            }
        }

        log::trace!(
            "append lock acquired (path={}, waited_ms={})",
            path.display(),
            started.elapsed().as_millis()
        );
        Ok(AppendGuard {
            table: Arc::clone(self),
            path: path.to_path_buf(),
            file,
            held: Some(held),
        })
    }

    fn slot(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(path).and_then(Weak::upgrade) {
            return existing;
        }
        entries.retain(|_, entry| entry.strong_count() > 0);
        let created = Arc::new(Mutex::new(()));
        entries.insert(path.to_path_buf(), Arc::downgrade(&created));
        created
    }

    fn evict(&self, path: &Path) {
        let mut entries = self.entries.lock();
        if entries
            .get(path)
            .is_some_and(|entry| entry.strong_count() == 0)
        {
            entries.remove(path);
        }
    }

    fn timed_out(&self, path: &Path, started: Instant) -> StoreError {
        let waited = started.elapsed();
        log::warn!(
            "append lock timed out (path={}, waited_ms={})",
            path.display(),
            waited.as_millis()
        );
        StoreError::LockTimeout {
            path: path.to_path_buf(),
            waited,
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive append access to one store path.
pub struct AppendGuard {
    table: Arc<LockTable>,
    path: PathBuf,
    file: File,
    held: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl AppendGuard {
    /// Canonical path this guard covers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store file handle, valid for writes while the guard lives.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl fmt::Debug for AppendGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendGuard")
            .field("path", &self.path)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl Drop for AppendGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!(
                "failed to release file lock (path={}, err={err})",
                self.path.display()
            );
        }
        self.held.take();
        self.table.evict(&self.path);
    }
}
