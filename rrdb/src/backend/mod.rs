//! Byte-addressable storage backends.
//!
//! Every round-robin database lives in a flat, fixed-size byte region. A
//! [`Backend`] exposes positioned reads and writes over that region; the
//! typed field layer in [`crate::primitive`] turns them into big-endian
//! integers, doubles and strings.
//!
//! # Providers
//!
//! | Provider | Scheme | Storage | Caching |
//! |---|---|---|---|
//! | [`FileBackend`] | `file` | positioned file I/O | yes |
//! | [`MmapBackend`] | `mmap` | whole-file mapping, periodic async flush | yes |
//! | [`LockedFileBackend`] | `lock` | file I/O under an exclusive advisory lock | no |
//! | [`MemoryBackend`] | `memory` | named in-process buffer | yes |
//!
//! Providers are selected through [`FactoryRegistry`], which matches a
//! resource identifier against an ordered list of active
//! [`BackendFactory`] values.

use std::fmt;

use crate::error::{CorruptionError, Result};

pub mod factory;
pub mod file;
pub mod locked;
pub mod memory;
pub mod mmap;

pub use factory::{BackendFactory, FactoryRegistry};
pub use file::{FileBackend, FileFactory};
pub use locked::{LockedFactory, LockedFileBackend};
pub use memory::{MemoryBackend, MemoryFactory};
pub use mmap::{MmapBackend, MmapFactory};

/// Positioned byte storage underneath one database.
///
/// All multi-byte values travel big-endian; the backend itself only moves
/// bytes. `set_length` is called once, when a database is created.
pub trait Backend: Send + fmt::Debug {
    /// Returns the canonical path (or name) of the resource.
    fn path(&self) -> &str;

    /// Fills `buf` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::Truncated`] when the range ends past the
    /// resource, or a backend error when the read itself fails.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the resource is read-only, closed, or the
    /// write fails.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Returns the current length of the resource in bytes.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the length cannot be determined.
    fn length(&self) -> Result<u64>;

    /// Resizes the resource to exactly `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the resize fails.
    fn set_length(&mut self, length: u64) -> Result<()>;

    /// Releases OS resources held by the backend. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a backend error if flushing or unlocking fails.
    fn close(&mut self) -> Result<()>;

    /// Whether typed fields may cache values read from this backend.
    fn caching_allowed(&self) -> bool {
        true
    }

    /// Reads the complete resource.
    ///
    /// # Errors
    ///
    /// Propagates [`Backend::length`] and [`Backend::read`] failures.
    fn read_all(&self) -> Result<Vec<u8>> {
        let length = self.length()?;
        let mut buf = vec![0u8; to_usize(self.path(), length)?];
        self.read(0, &mut buf)?;
        Ok(buf)
    }
}

/// Canonical identity of a stored database: a provider scheme plus a path
/// (or memory name) inside that provider's namespace.
///
/// Two identifiers that name the same physical store compare equal once
/// canonicalised, which makes this the key of the handle pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceUri {
    scheme: String,
    path: String,
}

impl ResourceUri {
    /// Builds an identifier from already-canonical parts.
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    /// Splits `scheme:path` into its parts. Bare paths have no scheme.
    ///
    /// A single-letter prefix is treated as a Windows drive, not a scheme,
    /// and `scheme://path` drops the slashes.
    pub fn split(id: &str) -> (Option<&str>, &str) {
        if let Some((scheme, rest)) = id.split_once(':') {
            let valid = scheme.len() >= 2
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
            if valid {
                let rest = rest.strip_prefix("//").unwrap_or(rest);
                return (Some(scheme), rest);
            }
        }
        (None, id)
    }

    /// Returns the provider scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the path inside the provider namespace.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}

/// Rejects reads that end beyond `size`.
pub(crate) fn check_range(path: &str, offset: u64, length: usize, size: u64) -> Result<()> {
    let end = offset.checked_add(length as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(CorruptionError::Truncated {
            path: path.to_string(),
            offset,
            length: length as u64,
            size,
        }
        .into()),
    }
}

/// Converts a store length or offset into a slice index.
pub(crate) fn to_usize(path: &str, value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        crate::error::BackendError::TooLarge {
            path: path.to_string(),
            length: value,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_identifiers() {
        assert_eq!(ResourceUri::split("file:/tmp/a.rrd"), (Some("file"), "/tmp/a.rrd"));
        assert_eq!(ResourceUri::split("file:///tmp/a.rrd"), (Some("file"), "/tmp/a.rrd"));
        assert_eq!(ResourceUri::split("memory:cpu"), (Some("memory"), "cpu"));
        assert_eq!(ResourceUri::split("/tmp/a.rrd"), (None, "/tmp/a.rrd"));
        assert_eq!(ResourceUri::split("C:\\data\\a.rrd"), (None, "C:\\data\\a.rrd"));
        assert_eq!(ResourceUri::split("relative.rrd"), (None, "relative.rrd"));
    }

    #[test]
    fn test_uri_display() {
        let uri = ResourceUri::new("mmap", "/var/lib/a.rrd");
        assert_eq!(uri.to_string(), "mmap:/var/lib/a.rrd");
        assert_eq!(uri.scheme(), "mmap");
        assert_eq!(uri.path(), "/var/lib/a.rrd");
    }

    #[test]
    fn test_check_range() {
        assert!(check_range("x", 0, 8, 8).is_ok());
        assert!(check_range("x", 1, 8, 8).is_err());
        assert!(check_range("x", u64::MAX, 8, 8).is_err());
    }
}
