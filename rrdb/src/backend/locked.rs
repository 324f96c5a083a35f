//! Lock-guarded file backend.
//!
//! Wraps [`FileBackend`] with an exclusive advisory lock taken at open and
//! held until close. This is the only backend that is safe when several
//! independent processes share one database file. Because another process
//! may change the bytes at any time, typed fields never cache values read
//! through this backend.
//!
//! # Locking
//!
//! ```text
//! open ──► try_lock_exclusive ──ok──► backend ready
//!              │ would block
//!              ▼
//!          sleep(retry) ──► elapsed < wait ? retry : LockTimeout
//! ```

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::{Backend, FileBackend, ResourceUri};
use crate::error::{BackendError, ConcurrencyError, Result};

/// Default bound on how long an opener waits for the lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(3000);

/// Default pause between lock attempts.
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(50);

/// File backend holding an exclusive `flock`-style lock for its lifetime.
#[derive(Debug)]
pub struct LockedFileBackend {
    inner: FileBackend,
    locked: bool,
}

impl LockedFileBackend {
    /// Opens `path` and blocks until the exclusive lock is held or
    /// `lock_wait` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if the file cannot be opened and
    /// [`ConcurrencyError::LockTimeout`] if the lock stays contended.
    pub fn open<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        lock_wait: Duration,
        lock_retry: Duration,
    ) -> Result<Self> {
        let inner = FileBackend::open(path, read_only)?;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match inner.file()?.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let waited = started.elapsed();
                    if waited >= lock_wait {
                        tracing::warn!(
                            "gave up locking {} after {attempts} attempts",
                            inner.path()
                        );
                        return Err(ConcurrencyError::LockTimeout {
                            path: inner.path().to_string(),
                            waited,
                        }
                        .into());
                    }
                    tracing::trace!("{} is locked, retrying in {lock_retry:?}", inner.path());
                    thread::sleep(lock_retry.min(lock_wait - waited));
                }
                Err(e) => {
                    return Err(BackendError::Open {
                        path: inner.path().to_string(),
                        source: e,
                    }
                    .into());
                }
            }
        }

        tracing::debug!("locked {} after {attempts} attempt(s)", inner.path());
        Ok(Self {
            inner,
            locked: true,
        })
    }

    fn unlock(&mut self) -> Result<()> {
        if self.locked {
            self.inner
                .file()?
                .unlock()
                .map_err(|e| BackendError::Sync {
                    path: self.inner.path().to_string(),
                    source: e,
                })?;
            self.locked = false;
        }
        Ok(())
    }
}

impl Backend for LockedFileBackend {
    fn path(&self) -> &str {
        self.inner.path()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write(offset, data)
    }

    fn length(&self) -> Result<u64> {
        self.inner.length()
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        self.inner.set_length(length)
    }

    fn close(&mut self) -> Result<()> {
        // Data first, then the lock, so a waiting process never sees a
        // half-flushed file.
        if self.inner.file().is_ok() {
            let synced = self.inner.sync();
            let unlocked = self.unlock();
            self.inner.close()?;
            synced?;
            unlocked?;
        }
        Ok(())
    }

    fn caching_allowed(&self) -> bool {
        false
    }
}

impl Drop for LockedFileBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing locked backend {} failed: {e}", self.inner.path());
        }
    }
}

/// Provider for [`LockedFileBackend`] under the `lock` scheme.
#[derive(Debug)]
pub struct LockedFactory {
    lock_wait: Duration,
    lock_retry: Duration,
}

impl Default for LockedFactory {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_WAIT, DEFAULT_LOCK_RETRY)
    }
}

impl LockedFactory {
    /// Scheme served by this provider.
    pub const SCHEME: &'static str = "lock";

    /// Creates a provider with explicit lock timing.
    pub fn new(lock_wait: Duration, lock_retry: Duration) -> Self {
        Self {
            lock_wait,
            lock_retry: lock_retry.max(Duration::from_millis(1)),
        }
    }

    /// Maximum time an opener waits for the lock.
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    /// Pause between lock attempts.
    pub fn lock_retry(&self) -> Duration {
        self.lock_retry
    }

    /// Opens a locked backend for an already-canonical identifier.
    ///
    /// # Errors
    ///
    /// See [`LockedFileBackend::open`].
    pub fn open(&self, uri: &ResourceUri, read_only: bool) -> Result<LockedFileBackend> {
        LockedFileBackend::open(uri.path(), read_only, self.lock_wait, self.lock_retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RrdError;
    use tempfile::tempdir;

    #[test]
    fn test_second_open_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.rrd");

        let first = LockedFileBackend::open(
            &path,
            false,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap();

        let started = Instant::now();
        let err = LockedFileBackend::open(
            &path,
            false,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(matches!(
            err,
            RrdError::Concurrency(ConcurrencyError::LockTimeout { .. })
        ));

        drop(first);
    }

    #[test]
    fn test_lock_released_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("released.rrd");
        let wait = Duration::from_millis(200);
        let retry = Duration::from_millis(10);

        let mut first = LockedFileBackend::open(&path, false, wait, retry).unwrap();
        first.set_length(16).unwrap();
        first.write(0, &[9; 4]).unwrap();
        first.close().unwrap();
        assert!(!first.locked);
        first.close().unwrap();

        let second = LockedFileBackend::open(&path, false, wait, retry).unwrap();
        let mut buf = [0u8; 4];
        second.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9; 4]);
        assert!(!second.caching_allowed());
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("handoff.rrd");

        let first = LockedFileBackend::open(
            &path,
            false,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            LockedFileBackend::open(
                &waiter_path,
                false,
                Duration::from_secs(5),
                Duration::from_millis(10),
            )
            .map(|_| ())
        });

        thread::sleep(Duration::from_millis(50));
        drop(first);
        waiter.join().unwrap().unwrap();
    }
}
