//! Backend provider selection.
//!
//! A [`BackendFactory`] is one of the four closed provider variants. The
//! [`FactoryRegistry`] owns one instance of each, an ordered list of
//! active providers consulted when resolving identifiers, and the default
//! provider used for bare paths.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::{
    Backend, FileFactory, LockedFactory, MemoryFactory, MmapFactory, ResourceUri,
};
use crate::config::EngineConfig;
use crate::error::{BackendError, LookupError, Result};

/// A backend provider.
#[derive(Debug)]
pub enum BackendFactory {
    /// Plain positioned file I/O.
    File(FileFactory),
    /// Memory-mapped files with background flushing.
    Mmap(MmapFactory),
    /// Plain file I/O under an exclusive lock.
    Locked(LockedFactory),
    /// Named in-process buffers.
    Memory(MemoryFactory),
}

impl BackendFactory {
    /// Provider name used in configuration (`FILE`, `MMAP`, `LOCKED`, `MEMORY`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "FILE",
            Self::Mmap(_) => "MMAP",
            Self::Locked(_) => "LOCKED",
            Self::Memory(_) => "MEMORY",
        }
    }

    /// Scheme owned by the provider.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::File(_) => FileFactory::SCHEME,
            Self::Mmap(_) => MmapFactory::SCHEME,
            Self::Locked(_) => LockedFactory::SCHEME,
            Self::Memory(_) => MemoryFactory::SCHEME,
        }
    }

    /// Whether opened databases should have their signature checked.
    pub fn validate_header(&self) -> bool {
        !matches!(self, Self::Memory(_))
    }

    /// Whether the provider stores files on disk.
    pub fn is_file_based(&self) -> bool {
        !matches!(self, Self::Memory(_))
    }

    /// Whether this provider serves `uri`.
    pub fn can_store(&self, uri: &ResourceUri) -> bool {
        uri.scheme() == self.scheme()
    }

    /// Canonicalises `id` inside this provider's namespace.
    ///
    /// File-based providers turn the path into an absolute, normalised path
    /// (resolving symlinks where the file or its directory exists).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::SchemeMismatch`] when `id` names another
    /// scheme, and [`BackendError::Open`] when the path cannot be made
    /// absolute.
    pub fn canonical(&self, id: &str) -> Result<ResourceUri> {
        let (scheme, path) = ResourceUri::split(id);
        if let Some(scheme) = scheme
            && scheme != self.scheme()
        {
            return Err(BackendError::SchemeMismatch {
                uri: id.to_string(),
                expected: self.scheme().to_string(),
            }
            .into());
        }

        let path = if self.is_file_based() {
            canonical_file_path(path)?
        } else {
            path.to_string()
        };
        Ok(ResourceUri::new(self.scheme(), path))
    }

    /// Physical identity of a canonical identifier.
    ///
    /// The file, mmap and lock providers share one on-disk namespace, so
    /// their identifiers for the same path map to one `file:` identity.
    pub fn identity(&self, uri: &ResourceUri) -> ResourceUri {
        if self.is_file_based() {
            ResourceUri::new(FileFactory::SCHEME, uri.path())
        } else {
            uri.clone()
        }
    }

    /// Opens a backend for a canonical identifier.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::SchemeMismatch`] for a foreign identifier,
    /// otherwise whatever the provider's open fails with.
    pub fn open(&self, uri: &ResourceUri, read_only: bool) -> Result<Box<dyn Backend>> {
        self.check_scheme(uri)?;
        let backend: Box<dyn Backend> = match self {
            Self::File(f) => Box::new(f.open(uri, read_only)?),
            Self::Mmap(f) => Box::new(f.open(uri, read_only)?),
            Self::Locked(f) => Box::new(f.open(uri, read_only)?),
            Self::Memory(f) => Box::new(f.open(uri, read_only)?),
        };
        Ok(backend)
    }

    /// Whether the resource behind `uri` exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::SchemeMismatch`] for a foreign identifier.
    pub fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        self.check_scheme(uri)?;
        Ok(match self {
            Self::Memory(f) => f.exists(uri),
            _ => Path::new(uri.path()).is_file(),
        })
    }

    /// Removes the resource behind `uri`. Missing resources are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Open`] if a file cannot be removed.
    pub fn delete(&self, uri: &ResourceUri) -> Result<()> {
        self.check_scheme(uri)?;
        match self {
            Self::Memory(f) => {
                f.delete(uri);
            }
            _ => match std::fs::remove_file(uri.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BackendError::Open {
                        path: uri.path().to_string(),
                        source: e,
                    }
                    .into());
                }
            },
        }
        Ok(())
    }

    fn check_scheme(&self, uri: &ResourceUri) -> Result<()> {
        if self.can_store(uri) {
            Ok(())
        } else {
            Err(BackendError::SchemeMismatch {
                uri: uri.to_string(),
                expected: self.scheme().to_string(),
            }
            .into())
        }
    }
}

/// Makes `path` absolute and normalised, resolving symlinks where possible.
fn canonical_file_path(path: &str) -> Result<String> {
    let absolute = std::path::absolute(path).map_err(|e| BackendError::Open {
        path: path.to_string(),
        source: e,
    })?;
    let normalized = normalize(&absolute);

    let resolved = if let Ok(real) = std::fs::canonicalize(&normalized) {
        real
    } else if let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name())
        && let Ok(real_parent) = std::fs::canonicalize(parent)
    {
        real_parent.join(name)
    } else {
        normalized
    };
    Ok(resolved.to_string_lossy().to_string())
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Ordered set of backend providers.
///
/// Identifiers with a scheme go to the first *active* provider owning that
/// scheme; bare paths go to the default provider.
#[derive(Debug)]
pub struct FactoryRegistry {
    factories: Vec<Arc<BackendFactory>>,
    active: RwLock<Vec<usize>>,
    default: RwLock<usize>,
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::build(
            MmapFactory::default(),
            LockedFactory::default(),
            vec![1, 0, 2, 3],
            1,
        )
    }
}

impl FactoryRegistry {
    fn build(mmap: MmapFactory, locked: LockedFactory, active: Vec<usize>, default: usize) -> Self {
        let factories = vec![
            Arc::new(BackendFactory::File(FileFactory)),
            Arc::new(BackendFactory::Mmap(mmap)),
            Arc::new(BackendFactory::Locked(locked)),
            Arc::new(BackendFactory::Memory(MemoryFactory::default())),
        ];
        Self {
            factories,
            active: RwLock::new(active),
            default: RwLock::new(default),
        }
    }

    /// Builds a registry from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownBackend`] if the configuration names a
    /// provider that does not exist.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = Self::build(
            MmapFactory::new(Duration::from_secs(config.mmap.sync_period_secs)),
            LockedFactory::new(
                Duration::from_millis(config.locked.lock_wait_ms),
                Duration::from_millis(config.locked.lock_retry_ms),
            ),
            Vec::new(),
            1,
        );
        let names: Vec<&str> = config.active_backends.iter().map(String::as_str).collect();
        registry.set_active(&names)?;
        registry.set_default(&config.default_backend)?;
        Ok(registry)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.factories
            .iter()
            .position(|f| f.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                LookupError::UnknownBackend {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Returns the provider registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownBackend`] for an unknown name.
    pub fn factory(&self, name: &str) -> Result<Arc<BackendFactory>> {
        let index = self.index_of(name)?;
        Ok(Arc::clone(&self.factories[index]))
    }

    /// Returns the default provider.
    pub fn default_factory(&self) -> Arc<BackendFactory> {
        Arc::clone(&self.factories[*self.default.read()])
    }

    /// Changes the default provider.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownBackend`] for an unknown name.
    pub fn set_default(&self, name: &str) -> Result<()> {
        let index = self.index_of(name)?;
        *self.default.write() = index;
        Ok(())
    }

    /// Replaces the ordered list of active providers.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownBackend`] if any name is unknown; the
    /// previous list is kept in that case.
    pub fn set_active(&self, names: &[&str]) -> Result<()> {
        let indices = names
            .iter()
            .map(|name| self.index_of(name))
            .collect::<Result<Vec<_>>>()?;
        *self.active.write() = indices;
        Ok(())
    }

    /// Names of the active providers, in match order.
    pub fn active_names(&self) -> Vec<&'static str> {
        self.active
            .read()
            .iter()
            .map(|&i| self.factories[i].name())
            .collect()
    }

    /// Finds the provider for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownBackend`] when no active provider owns
    /// the identifier's scheme.
    pub fn find(&self, id: &str) -> Result<Arc<BackendFactory>> {
        let (scheme, _) = ResourceUri::split(id);
        let Some(scheme) = scheme else {
            return Ok(self.default_factory());
        };
        self.active
            .read()
            .iter()
            .map(|&i| &self.factories[i])
            .find(|f| f.scheme() == scheme)
            .map(Arc::clone)
            .ok_or_else(|| {
                LookupError::UnknownBackend {
                    name: id.to_string(),
                }
                .into()
            })
    }

    /// Finds the provider for `id` and canonicalises it.
    ///
    /// # Errors
    ///
    /// See [`FactoryRegistry::find`] and [`BackendFactory::canonical`].
    pub fn resolve(&self, id: &str) -> Result<(Arc<BackendFactory>, ResourceUri)> {
        let factory = self.find(id)?;
        let uri = factory.canonical(id)?;
        Ok((factory, uri))
    }

    /// Resolves `id` with an explicit provider instead of the active list.
    ///
    /// # Errors
    ///
    /// See [`FactoryRegistry::factory`] and [`BackendFactory::canonical`].
    pub fn resolve_with(&self, name: &str, id: &str) -> Result<(Arc<BackendFactory>, ResourceUri)> {
        let factory = self.factory(name)?;
        let uri = factory.canonical(id)?;
        Ok((factory, uri))
    }
}
