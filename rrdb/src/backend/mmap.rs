//! Memory-mapped file backend with periodic background flushing.
//!
//! The whole database file is mapped into the address space; reads and
//! writes are plain memory copies. Dirty pages are pushed to disk by one
//! background thread per [`MmapFactory`], which wakes every sync period and
//! issues an asynchronous flush for every mapping still alive.
//!
//! # Design
//!
//! ```text
//!  MmapBackend ──Arc──► RwLock<Option<Mapping>> ◄──Weak── flush thread
//!        │                                                 (per factory)
//!        └─ close(): flush, then take() the mapping → munmap now
//! ```
//!
//! Unmapping is explicit: `close()` drops the mapping under the write lock,
//! so the address range is released immediately even if the flush thread
//! still holds a weak reference to the (now empty) slot.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::{Condvar, Mutex, RwLock};

use super::{Backend, ResourceUri, check_range, to_usize};
use crate::error::{BackendError, Result};

/// Default interval between background flushes.
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(300);

/// A live mapping, writable or not.
#[derive(Debug)]
enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::ReadWrite(m) => m,
            Self::ReadOnly(m) => m,
        }
    }
}

type SharedMapping = Arc<RwLock<Option<Mapping>>>;

/// Backend over a memory-mapped file.
#[derive(Debug)]
pub struct MmapBackend {
    /// Underlying file; `None` after close.
    file: Option<File>,
    /// Current mapping, shared weakly with the flush thread.
    map: SharedMapping,
    /// Path for error reporting and identity.
    path: String,
    read_only: bool,
}

impl MmapBackend {
    /// Opens (creating if writable) and maps `path`.
    ///
    /// A zero-length file is left unmapped until [`Backend::set_length`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] or [`BackendError::Map`] on failure.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)
            .map_err(|e| BackendError::Open {
                path: path_str.clone(),
                source: e,
            })?;

        let mut backend = Self {
            file: Some(file),
            map: Arc::new(RwLock::new(None)),
            path: path_str,
            read_only,
        };
        backend.remap()?;

        tracing::debug!("mapped {} (read_only={read_only})", backend.path);
        Ok(backend)
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            BackendError::Closed {
                path: self.path.clone(),
            }
            .into()
        })
    }

    /// Replaces the current mapping with one covering the whole file.
    fn remap(&mut self) -> Result<()> {
        let file = self.file()?;
        let length = file
            .metadata()
            .map_err(|e| BackendError::Map {
                path: self.path.clone(),
                source: e,
            })?
            .len();

        let mapping = if length == 0 {
            None
        } else {
            let len = to_usize(&self.path, length)?;
            let map_err = |e| BackendError::Map {
                path: self.path.clone(),
                source: e,
            };
            if self.read_only {
                // SAFETY: The file is open for reading and the mapping length
                // matches its current size. Concurrent truncation by another
                // process is outside the supported single-writer model.
                let map = unsafe { MmapOptions::new().len(len).map(file).map_err(map_err)? };
                Some(Mapping::ReadOnly(map))
            } else {
                // SAFETY: The file is open read/write and sized to `len`. The
                // mapping is only accessed through the RwLock below.
                let map = unsafe { MmapOptions::new().len(len).map_mut(file).map_err(map_err)? };
                Some(Mapping::ReadWrite(map))
            }
        };

        *self.map.write() = mapping;
        Ok(())
    }

    /// Weak handle used by the flush thread.
    fn downgrade(&self) -> Weak<RwLock<Option<Mapping>>> {
        Arc::downgrade(&self.map)
    }

    /// Synchronously flushes dirty pages.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Sync`] if `msync` fails.
    pub fn sync(&self) -> Result<()> {
        if let Some(Mapping::ReadWrite(map)) = self.map.read().as_ref() {
            map.flush().map_err(|e| BackendError::Sync {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Whether a mapping is currently established.
    pub fn is_mapped(&self) -> bool {
        self.map.read().is_some()
    }
}

impl Backend for MmapBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.map.read();
        let bytes = guard.as_ref().map_or(&[][..], Mapping::bytes);
        check_range(&self.path, offset, buf.len(), bytes.len() as u64)?;
        let start = to_usize(&self.path, offset)?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly {
                path: self.path.clone(),
            }
            .into());
        }
        let mut guard = self.map.write();
        match guard.as_mut() {
            Some(Mapping::ReadWrite(map)) => {
                check_range(&self.path, offset, data.len(), map.len() as u64)?;
                let start = to_usize(&self.path, offset)?;
                map[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => {
                check_range(&self.path, offset, data.len(), 0)?;
                Ok(())
            }
        }
    }

    fn length(&self) -> Result<u64> {
        if let Some(mapping) = self.map.read().as_ref() {
            return Ok(mapping.bytes().len() as u64);
        }
        let metadata = self.file()?.metadata().map_err(|e| BackendError::Read {
            path: self.path.clone(),
            offset: 0,
            source: e,
        })?;
        Ok(metadata.len())
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly {
                path: self.path.clone(),
            }
            .into());
        }
        self.sync()?;
        *self.map.write() = None;
        self.file()?
            .set_len(length)
            .map_err(|e| BackendError::SetLength {
                path: self.path.clone(),
                length,
                source: e,
            })?;
        self.remap()
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let flushed = self.sync();
        // Unmap now rather than whenever the last reference goes away.
        *self.map.write() = None;
        self.file = None;
        tracing::debug!("unmapped {}", self.path);
        flushed
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing mapped backend {} failed: {e}", self.path);
        }
    }
}

/// State shared between a factory and its flush thread.
#[derive(Debug, Default)]
struct SyncShared {
    state: Mutex<SyncState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct SyncState {
    targets: Vec<(String, Weak<RwLock<Option<Mapping>>>)>,
    stop: bool,
}

/// Periodic flusher owning one background thread.
#[derive(Debug)]
struct SyncTask {
    shared: Arc<SyncShared>,
    handle: Option<JoinHandle<()>>,
}

impl SyncTask {
    fn spawn(period: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(SyncShared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("rrdb-mmap-sync".to_string())
            .spawn(move || run_sync_loop(&worker, period))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn register(&self, path: String, map: Weak<RwLock<Option<Mapping>>>) {
        self.shared.state.lock().targets.push((path, map));
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("mmap sync thread panicked");
        }
    }
}

fn run_sync_loop(shared: &SyncShared, period: Duration) {
    loop {
        let live: Vec<(String, Arc<RwLock<Option<Mapping>>>)> = {
            let mut state = shared.state.lock();
            if !state.stop {
                let _ = shared.wake.wait_for(&mut state, period);
            }
            if state.stop {
                return;
            }
            state.targets.retain(|(_, weak)| weak.strong_count() > 0);
            state
                .targets
                .iter()
                .filter_map(|(path, weak)| weak.upgrade().map(|map| (path.clone(), map)))
                .collect()
        };

        for (path, map) in live {
            if let Some(Mapping::ReadWrite(m)) = map.read().as_ref()
                && let Err(e) = m.flush_async()
            {
                tracing::warn!("background flush of {path} failed: {e}");
            }
        }
    }
}

/// Provider for [`MmapBackend`] under the `mmap` scheme.
///
/// Owns the background flush thread, started on first use and stopped when
/// the factory is dropped.
#[derive(Debug)]
pub struct MmapFactory {
    sync_period: Duration,
    task: Mutex<Option<SyncTask>>,
}

impl Default for MmapFactory {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_PERIOD)
    }
}

impl MmapFactory {
    /// Scheme served by this provider.
    pub const SCHEME: &'static str = "mmap";

    /// Creates a provider flushing every `sync_period`.
    pub fn new(sync_period: Duration) -> Self {
        Self {
            sync_period: sync_period.max(Duration::from_millis(1)),
            task: Mutex::new(None),
        }
    }

    /// Interval between background flushes.
    pub fn sync_period(&self) -> Duration {
        self.sync_period
    }

    /// Opens and maps an already-canonical identifier, registering it with
    /// the flush thread.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] or [`BackendError::Map`] on failure.
    pub fn open(&self, uri: &ResourceUri, read_only: bool) -> Result<MmapBackend> {
        let backend = MmapBackend::open(uri.path(), read_only)?;
        if !read_only {
            let mut task = self.task.lock();
            if task.is_none() {
                let spawned = SyncTask::spawn(self.sync_period).map_err(|e| BackendError::Open {
                    path: backend.path.clone(),
                    source: e,
                })?;
                tracing::debug!("started mmap sync thread (period {:?})", self.sync_period);
                *task = Some(spawned);
            }
            if let Some(task) = task.as_ref() {
                task.register(backend.path.clone(), backend.downgrade());
            }
        }
        Ok(backend)
    }

    /// Number of mappings the flush thread still tracks.
    pub fn tracked_mappings(&self) -> usize {
        self.task.lock().as_ref().map_or(0, |task| {
            task.shared
                .state
                .lock()
                .targets
                .iter()
                .filter(|(_, weak)| weak.upgrade().is_some_and(|m| m.read().is_some()))
                .count()
        })
    }
}
