//! Plain-file backend: one positioned read or write per access.
//!
//! Suitable for single-process use. Nothing stops two processes from
//! writing the same file; use [`super::LockedFileBackend`] for that.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{Backend, ResourceUri, check_range};
use crate::error::{BackendError, Result};

/// Backend over a regular file using seek + read/write.
#[derive(Debug)]
pub struct FileBackend {
    /// Open file handle; `None` after close.
    file: Option<File>,
    /// Path used for error reporting and identity.
    path: String,
    /// Writes are rejected when set.
    read_only: bool,
}

impl FileBackend {
    /// Opens `path`, creating it when not read-only.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if the file cannot be opened.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use rrdb::backend::{Backend, FileBackend};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut backend = FileBackend::open("/tmp/cpu.rrd", false)?;
    /// backend.set_length(1024)?;
    /// backend.write(0, b"hello")?;
    /// # Ok(())
    /// # }
    /// ```
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

        tracing::debug!("opened file backend {path_str} (read_only={read_only})");

        Ok(Self {
            file: Some(file),
            path: path_str,
            read_only,
        })
    }

    /// Returns the open file handle.
    pub(crate) fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| {
            BackendError::Closed {
                path: self.path.clone(),
            }
            .into()
        })
    }

    /// Flushes written data to disk. A no-op for read-only backends.
    pub(crate) fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file()?.sync_data().map_err(|e| BackendError::Sync {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Whether this backend rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl Backend for FileBackend {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file()?;
        let read_err = |e| BackendError::Read {
            path: self.path.clone(),
            offset,
            source: e,
        };

        file.seek(SeekFrom::Start(offset)).map_err(read_err)?;
        match file.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // Report the size so the caller sees a truncation, not an I/O fault.
                let size = self.length()?;
                check_range(&self.path, offset, buf.len(), size)?;
                Err(read_err(e).into())
            }
            Err(e) => Err(read_err(e).into()),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly {
                path: self.path.clone(),
            }
            .into());
        }
        let mut file = self.file()?;
        let write_err = |e| BackendError::Write {
            path: self.path.clone(),
            offset,
            source: e,
        };

        file.seek(SeekFrom::Start(offset)).map_err(write_err)?;
        file.write_all(data).map_err(write_err)?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
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
        self.file()?
            .set_len(length)
            .map_err(|e| BackendError::SetLength {
                path: self.path.clone(),
                length,
                source: e,
            })?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.sync()?;
            self.file = None;
            tracing::debug!("closed file backend {}", self.path);
        }
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing {} failed: {e}", self.path);
        }
    }
}

/// Provider for [`FileBackend`] under the `file` scheme.
#[derive(Debug, Default)]
pub struct FileFactory;

impl FileFactory {
    /// Scheme served by this provider.
    pub const SCHEME: &'static str = "file";

    /// Opens a backend for an already-canonical identifier.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if the file cannot be opened.
    pub fn open(&self, uri: &ResourceUri, read_only: bool) -> Result<FileBackend> {
        FileBackend::open(uri.path(), read_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.rrd");

        let mut backend = FileBackend::open(&path, false).unwrap();
        backend.set_length(64).unwrap();
        backend.write(8, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        backend.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(backend.length().unwrap(), 64);
        backend.close().unwrap();

        let reopened = FileBackend::open(&path, true).unwrap();
        let mut buf = [0u8; 4];
        reopened.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_past_end_is_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.rrd");

        let mut backend = FileBackend::open(&path, false).unwrap();
        backend.set_length(4).unwrap();

        let mut buf = [0u8; 8];
        let err = backend.read(0, &mut buf).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.rrd");
        FileBackend::open(&path, false).unwrap().set_length(8).unwrap();

        let mut backend = FileBackend::open(&path, true).unwrap();
        assert!(backend.is_read_only());
        let err = backend.write(0, &[1]).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_access_after_close_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(dir.path().join("c.rrd"), false).unwrap();
        backend.set_length(8).unwrap();
        backend.close().unwrap();
        backend.close().unwrap();

        let mut buf = [0u8; 1];
        assert!(backend.read(0, &mut buf).is_err());
    }
}
