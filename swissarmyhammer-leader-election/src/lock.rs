//! Advisory file locks
//!
//! A namespace's lock file is held open for the lifetime of its view. Leadership is
//! an exclusive OS lock (`flock` on Unix, via `fs2`) on that open file, valid until
//! it is released, the file is closed, or the process dies.
//!
//! Some filesystems (NFS among them) emulate `flock` with per-process POSIX locks,
//! under which a second lock from the same process silently succeeds. A
//! process-wide registry of locked paths turns that case into an explicit
//! [`LockAttempt::Overlapping`] on every platform.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use once_cell::sync::Lazy;

use crate::error::{ClusterError, Result};

/// Lock files currently locked by this process
static LOCAL_LOCKS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn register_local(key: &Path) -> bool {
    LOCAL_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(key.to_path_buf())
}

fn unregister_local(key: &Path) {
    LOCAL_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(key);
}

/// Outcome of a non-blocking lock attempt
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock is ours until the handle is released or dropped
    Acquired(LockHandle),
    /// Another process holds the lock
    HeldElsewhere,
    /// Another holder in this process already has the lock
    Overlapping,
}

/// An open namespace lock file
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
    key: PathBuf,
    file: Arc<File>,
}

impl LockFile {
    /// Open `path` for reading and writing, creating it and its parent directories
    ///
    /// Existing content is kept, it may hold the current leader's record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ClusterError::LockFileCreation)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(ClusterError::LockFileCreation)?;

        let key = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());

        Ok(Self {
            path,
            key,
            file: Arc::new(file),
        })
    }

    /// Path the file was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open file
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Canonical path identifying the file within this process
    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// Strategy for taking an exclusive lock on an open lock file
///
/// Views only see this seam, so the OS locking call can be swapped.
pub trait FileLocker: Send + Sync + fmt::Debug {
    /// Try to lock `file` exclusively without blocking
    fn try_lock(&self, file: &LockFile) -> io::Result<LockAttempt>;
}

/// [`FileLocker`] backed by `fs2` OS advisory locks
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvisoryLocker;

impl FileLocker for AdvisoryLocker {
    fn try_lock(&self, file: &LockFile) -> io::Result<LockAttempt> {
        if !register_local(file.key()) {
            return Ok(LockAttempt::Overlapping);
        }

        match FileExt::try_lock_exclusive(&**file.file()) {
            Ok(()) => Ok(LockAttempt::Acquired(LockHandle::new(file))),
            Err(e) if is_contended(&e) => {
                unregister_local(file.key());
                Ok(LockAttempt::HeldElsewhere)
            }
            Err(e) => {
                unregister_local(file.key());
                Err(e)
            }
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// A held exclusive lock
///
/// Dropping a still-valid handle releases the lock, so a lock taken by an attempt
/// whose caller already gave up is not kept by accident.
pub struct LockHandle {
    file: Arc<File>,
    key: PathBuf,
    valid: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(file: &LockFile) -> Self {
        Self {
            file: Arc::clone(file.file()),
            key: file.key().to_path_buf(),
            valid: AtomicBool::new(true),
        }
    }

    /// Whether the lock is still held
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Release the lock; releasing twice is a no-op
    pub fn release(&self) -> io::Result<()> {
        if !self.valid.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        unregister_local(&self.key);
        FileExt::unlock(&*self.file)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.key)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::debug!("Failed to release lock on {}: {}", self.key.display(), e);
        }
    }
}
