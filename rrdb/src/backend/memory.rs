//! In-memory backend.
//!
//! Buffers live in the owning [`MemoryFactory`], keyed by name. Closing a
//! backend keeps its buffer so the same name can be reopened later;
//! [`MemoryFactory::delete`] reclaims it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Backend, ResourceUri, check_range, to_usize};
use crate::error::{BackendError, Result};

type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// Growable, non-persistent backend over a named shared buffer.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    buffer: SharedBuffer,
    read_only: bool,
    closed: bool,
}

impl MemoryBackend {
    /// Creates a standalone backend not registered with any factory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(RwLock::new(Vec::new())),
            read_only: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BackendError::Closed {
                path: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn path(&self) -> &str {
        &self.name
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.buffer.read();
        check_range(&self.name, offset, buf.len(), bytes.len() as u64)?;
        let start = to_usize(&self.name, offset)?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(BackendError::ReadOnly {
                path: self.name.clone(),
            }
            .into());
        }
        let start = to_usize(&self.name, offset)?;
        let end = start + data.len();
        let mut bytes = self.buffer.write();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.buffer.read().len() as u64)
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        self.ensure_open()?;
        let length = to_usize(&self.name, length)?;
        self.buffer.write().resize(length, 0);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // The buffer stays with the factory for reopen-by-name.
        self.closed = true;
        Ok(())
    }
}

/// Provider for [`MemoryBackend`] under the `memory` scheme.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    buffers: Mutex<HashMap<String, SharedBuffer>>,
}

impl MemoryFactory {
    /// Scheme served by this provider.
    pub const SCHEME: &'static str = "memory";

    /// Opens the buffer named by `uri`, creating it when writable.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when opening a missing buffer
    /// read-only.
    pub fn open(&self, uri: &ResourceUri, read_only: bool) -> Result<MemoryBackend> {
        let mut buffers = self.buffers.lock();
        let buffer = match buffers.get(uri.path()) {
            Some(buffer) => Arc::clone(buffer),
            None if read_only => {
                return Err(BackendError::NotFound {
                    path: uri.path().to_string(),
                }
                .into());
            }
            None => {
                let buffer = SharedBuffer::default();
                buffers.insert(uri.path().to_string(), Arc::clone(&buffer));
                buffer
            }
        };
        Ok(MemoryBackend {
            name: uri.path().to_string(),
            buffer,
            read_only,
            closed: false,
        })
    }

    /// Whether a buffer with this name exists.
    pub fn exists(&self, uri: &ResourceUri) -> bool {
        self.buffers.lock().contains_key(uri.path())
    }

    /// Drops the named buffer. Returns whether one existed.
    ///
    /// Backends still open on the buffer keep their copy alive until they
    /// are dropped.
    pub fn delete(&self, uri: &ResourceUri) -> bool {
        let removed = self.buffers.lock().remove(uri.path()).is_some();
        if removed {
            tracing::debug!("deleted memory buffer {}", uri.path());
        }
        removed
    }

    /// Names of all buffers currently held.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_survives_close() {
        let factory = MemoryFactory::default();
        let uri = ResourceUri::new("memory", "cpu");

        let mut backend = factory.open(&uri, false).unwrap();
        backend.set_length(16).unwrap();
        backend.write(4, &[5, 6]).unwrap();
        backend.close().unwrap();
        assert!(backend.length().is_err());

        assert!(factory.exists(&uri));
        let reopened = factory.open(&uri, true).unwrap();
        let mut buf = [0u8; 2];
        reopened.read(4, &mut buf).unwrap();
        assert_eq!(buf, [5, 6]);
    }

    #[test]
    fn test_delete_reclaims_buffer() {
        let factory = MemoryFactory::default();
        let uri = ResourceUri::new("memory", "gone");
        factory.open(&uri, false).unwrap();

        assert_eq!(factory.names(), vec!["gone".to_string()]);
        assert!(factory.delete(&uri));
        assert!(!factory.exists(&uri));
        assert!(!factory.delete(&uri));
        assert!(factory.open(&uri, true).is_err());
    }

    #[test]
    fn test_writes_grow_buffer() {
        let mut backend = MemoryBackend::new("grow");
        backend.write(10, &[1, 2]).unwrap();
        assert_eq!(backend.length().unwrap(), 12);

        let mut buf = [0u8; 4];
        assert!(backend.read(10, &mut buf).is_err());
    }
}
