//! Registry lock scopes
//!
//! Each scope pairs an in-process mutex with an optional `flock(2)` on a
//! lock file so that several manager processes sharing one storage
//! directory serialize their writes. A thread may hold at most one scope
//! at a time; asking for a second one is refused instead of deadlocking.

use crate::error::{McmpError, McmpResult};
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::fs::File;
use std::path::Path;
use tracing::error;

thread_local! {
    static HELD: Cell<Option<&'static str>> = const { Cell::new(None) };
}

/// One named lock domain
pub struct ScopeLock {
    name: &'static str,
    mutex: Mutex<()>,
    file: Option<File>,
}

/// Proof that the current thread holds a [`ScopeLock`]
pub struct ScopeGuard<'a> {
    lock: &'a ScopeLock,
    _guard: MutexGuard<'a, ()>,
}

impl ScopeLock {
    /// A lock that only excludes threads of this process
    pub fn local(name: &'static str) -> Self {
        Self {
            name,
            mutex: Mutex::new(()),
            file: None,
        }
    }

    /// A lock that also excludes other processes using `path`
    pub fn shared(name: &'static str, path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            name,
            mutex: Mutex::new(()),
            file: Some(file),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn acquire(&self) -> McmpResult<ScopeGuard<'_>> {
        if let Some(held) = HELD.with(|h| h.get()) {
            error!(held, wanted = self.name, "Lock order violation");
            return Err(McmpError::general(format!(
                "GENERAL: lock order violation: {} lock requested while holding {} lock",
                self.name, held
            )));
        }

        let guard = self.mutex.lock();
        if let Some(file) = &self.file {
            flock(file, true).map_err(|e| {
                McmpError::general(format!("GENERAL: can't lock {} table: {}", self.name, e))
            })?;
        }
        HELD.with(|h| h.set(Some(self.name)));
        Ok(ScopeGuard {
            lock: self,
            _guard: guard,
        })
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.lock.file {
            if let Err(e) = flock(file, false) {
                error!(lock = self.lock.name, error = %e, "Failed to release file lock");
            }
        }
        HELD.with(|h| h.set(None));
    }
}

#[cfg(unix)]
fn flock(file: &File, exclusive: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_UN };
    let result = unsafe { libc::flock(file.as_raw_fd(), op) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock(_file: &File, _exclusive: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_scope_on_same_thread_is_refused() {
        let node = ScopeLock::local("node");
        let context = ScopeLock::local("context");

        let guard = node.acquire().unwrap();
        let err = context.acquire().err().unwrap();
        assert!(err.message().contains("lock order violation"));
        drop(guard);

        assert!(context.acquire().is_ok());
    }

    #[test]
    fn test_reentry_is_refused() {
        let node = ScopeLock::local("node");
        let _guard = node.acquire().unwrap();
        assert!(node.acquire().is_err());
    }

    #[test]
    fn test_excludes_other_threads() {
        let lock = Arc::new(ScopeLock::local("node"));
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.acquire().unwrap();
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
    }

    #[test]
    fn test_shared_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.node.lock");
        let lock = ScopeLock::shared("node", &path).unwrap();
        {
            let _guard = lock.acquire().unwrap();
        }
        assert!(path.exists());
        assert!(lock.acquire().is_ok());
    }
}
