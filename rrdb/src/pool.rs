//! A bounded pool of shared database handles.
//!
//! The pool keeps at most `capacity` databases open and never opens the same
//! physical store twice: concurrent requests for one database share a
//! single [`RrdDb`], reference counted. Entries are keyed by
//! [`BackendFactory::identity`], so `file:`, `mmap:` and `lock:` names for one
//! path all land on the same entry. Dropping the last [`PooledDb`] closes
//! the database and frees its slot.
//!
//! ```text
//!               request(id)                       last release
//!   (absent) ───────────────▶ Busy ──open──▶ Resident{n} ──────────▶ Busy ──close──▶ (absent)
//!                                              │    ▲
//!                                   request(id)│    │release (n > 1)
//!                                              ▼    │
//!                                           Resident{n ± 1}
//! ```
//!
//! A `Busy` entry is being opened, created or closed by exactly one thread,
//! outside the pool lock; everyone else asking for that identifier waits.
//! Requests that need a new slot while the pool is full queue up and are
//! served in arrival order.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rrdb::{FactoryRegistry, RrdDbPool};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RrdDbPool::new(Arc::new(FactoryRegistry::default()), 50)?;
//!
//! let db = pool.request("/var/lib/rrd/cpu.rrd")?;
//! db.update(1_700_000_300, &[0.5])?;
//! drop(db); // released; closed when no other handle remains
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::backend::{BackendFactory, FactoryRegistry, ResourceUri};
use crate::config::EngineConfig;
use crate::db::RrdDb;
use crate::error::{ConcurrencyError, Result, ValidationError};
use crate::schema::RrdDef;

/// Bounded, reference-counted handle pool. Cloning shares the pool.
#[derive(Clone)]
pub struct RrdDbPool {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Arc<FactoryRegistry>,
    state: Mutex<PoolState>,
    changed: Condvar,
}

struct PoolState {
    capacity: usize,
    default_backend: &'static str,
    /// Keyed by physical identity.
    entries: HashMap<ResourceUri, Entry>,
    /// Tickets of requests waiting for a free slot, oldest first.
    queue: VecDeque<u64>,
    next_ticket: u64,
}

enum Entry {
    /// Opened, created or closed by one thread right now.
    Busy,
    Resident { db: Arc<RrdDb>, count: usize },
}

/// What a request does once it owns an empty slot.
enum Open<'a> {
    Existing,
    Create(&'a RrdDef),
}

impl PoolState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back(ticket);
        ticket
    }

    fn leave_queue(&mut self, ticket: Option<u64>) {
        if let Some(ticket) = ticket {
            self.queue.retain(|&t| t != ticket);
        }
    }

    fn slot_free_for(&self, ticket: u64) -> bool {
        self.entries.len() < self.capacity && self.queue.front() == Some(&ticket)
    }
}

impl RrdDbPool {
    /// Creates a pool over `registry` holding at most `capacity` databases.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidCapacity`] for a zero capacity.
    pub fn new(registry: Arc<FactoryRegistry>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ValidationError::InvalidCapacity { capacity }.into());
        }
        let default_backend = registry.default_factory().name();
        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                state: Mutex::new(PoolState {
                    capacity,
                    default_backend,
                    entries: HashMap::new(),
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    /// Builds the registry and the pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation or lookup error.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = FactoryRegistry::from_config(config)?;
        Self::new(Arc::new(registry), config.pool.capacity)
    }

    /// The provider registry.
    pub fn registry(&self) -> &FactoryRegistry {
        &self.shared.registry
    }

    fn resolve(&self, id: &str) -> Result<(Arc<BackendFactory>, ResourceUri)> {
        let (scheme, _) = ResourceUri::split(id);
        if scheme.is_some() {
            self.shared.registry.resolve(id)
        } else {
            let default_backend = self.shared.state.lock().default_backend;
            self.shared.registry.resolve_with(default_backend, id)
        }
    }

    /// Shares or opens the database `id`, waiting as long as needed.
    ///
    /// # Errors
    ///
    /// Returns the open failure of the database.
    pub fn request(&self, id: &str) -> Result<PooledDb> {
        let (factory, uri) = self.resolve(id)?;
        self.acquire(&factory, uri, Open::Existing, None)
    }

    /// Like [`RrdDbPool::request`], giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::PoolTimeout`] when no slot or entry became
    /// available in time; the pool is left as if the request never happened.
    pub fn request_timeout(&self, id: &str, timeout: Duration) -> Result<PooledDb> {
        let (factory, uri) = self.resolve(id)?;
        self.acquire(&factory, uri, Open::Existing, Some(timeout))
    }

    /// Creates a database from `def` and returns the only handle to it.
    ///
    /// Waits until every other handle to the same identifier is released.
    ///
    /// # Errors
    ///
    /// Returns the creation failure of the database.
    pub fn create(&self, def: &RrdDef) -> Result<PooledDb> {
        let (factory, uri) = self.resolve(&def.path)?;
        self.acquire(&factory, uri, Open::Create(def), None)
    }

    fn acquire(
        &self,
        factory: &BackendFactory,
        uri: ResourceUri,
        open: Open<'_>,
        timeout: Option<Duration>,
    ) -> Result<PooledDb> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let key = factory.identity(&uri);
        let mut state = self.shared.state.lock();
        let mut ticket = None;

        loop {
            match state.entries.get_mut(&key) {
                Some(Entry::Resident { db, count }) if matches!(open, Open::Existing) => {
                    *count += 1;
                    let db = Arc::clone(db);
                    state.leave_queue(ticket);
                    self.shared.changed.notify_all();
                    return Ok(self.handle(key, db));
                }
                Some(_) => {}
                None => {
                    let mine = *ticket.get_or_insert_with(|| state.take_ticket());
                    if state.slot_free_for(mine) {
                        state.queue.pop_front();
                        state.entries.insert(key.clone(), Entry::Busy);
                        return self.open_slot(state, factory, key, uri, open);
                    }
                }
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        state.leave_queue(ticket);
                        self.shared.changed.notify_all();
                        tracing::debug!("pool request for {uri} timed out");
                        return Err(ConcurrencyError::PoolTimeout {
                            uri: uri.to_string(),
                            waited: started.elapsed(),
                        }
                        .into());
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }

    /// Opens or creates the database for a slot already marked busy.
    fn open_slot(
        &self,
        state: MutexGuard<'_, PoolState>,
        factory: &BackendFactory,
        key: ResourceUri,
        uri: ResourceUri,
        open: Open<'_>,
    ) -> Result<PooledDb> {
        drop(state);
        let opened = match open {
            Open::Existing => RrdDb::open_with(factory, uri.clone(), false),
            Open::Create(def) => RrdDb::create_with(def, factory, uri.clone()),
        };

        let mut state = self.shared.state.lock();
        let result = match opened {
            Ok(db) => {
                let db = Arc::new(db);
                state.entries.insert(
                    key.clone(),
                    Entry::Resident {
                        db: Arc::clone(&db),
                        count: 1,
                    },
                );
                tracing::debug!("pool opened {uri} ({} open)", state.entries.len());
                Ok(self.handle(key, db))
            }
            Err(e) => {
                state.entries.remove(&key);
                Err(e)
            }
        };
        self.shared.changed.notify_all();
        result
    }

    fn handle(&self, key: ResourceUri, db: Arc<RrdDb>) -> PooledDb {
        PooledDb {
            pool: self.clone(),
            key,
            db,
            released: false,
        }
    }

    /// Releases a handle. Same as dropping it, but reports close failures.
    ///
    /// # Errors
    ///
    /// Propagates the close failure of the last handle to a database.
    pub fn release(&self, handle: PooledDb) -> Result<()> {
        handle.release()
    }

    fn release_key(&self, key: &ResourceUri) -> Result<()> {
        let mut state = self.shared.state.lock();
        let not_pooled = || ConcurrencyError::NotPooled {
            uri: key.to_string(),
        };
        let entry = state.entries.get_mut(key).ok_or_else(not_pooled)?;
        let db = match entry {
            Entry::Resident { count, .. } if *count > 1 => {
                *count -= 1;
                return Ok(());
            }
            Entry::Resident { db, .. } => {
                let db = Arc::clone(db);
                *entry = Entry::Busy;
                db
            }
            Entry::Busy => return Err(not_pooled().into()),
        };
        drop(state);

        let closed = db.close();
        let mut state = self.shared.state.lock();
        state.entries.remove(key);
        tracing::debug!("pool closed {} ({} open)", db.uri(), state.entries.len());
        self.shared.changed.notify_all();
        closed
    }

    /// Number of handles currently sharing `id`; zero when not open.
    ///
    /// # Errors
    ///
    /// Returns a lookup error when `id` cannot be resolved.
    pub fn open_count(&self, id: &str) -> Result<usize> {
        let (factory, uri) = self.resolve(id)?;
        Ok(match self.shared.state.lock().entries.get(&factory.identity(&uri)) {
            Some(Entry::Resident { count, .. }) => *count,
            _ => 0,
        })
    }

    /// Number of occupied slots.
    pub fn open_file_count(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Physical identities of the occupied slots, sorted.
    pub fn open_uris(&self) -> Vec<ResourceUri> {
        let mut uris: Vec<ResourceUri> =
            self.shared.state.lock().entries.keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Maximum number of open databases.
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Changes the capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidCapacity`] for zero and
    /// [`ConcurrencyError::PoolNotEmpty`] while any database is open.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(ValidationError::InvalidCapacity { capacity }.into());
        }
        let mut state = self.shared.state.lock();
        if !state.entries.is_empty() {
            return Err(ConcurrencyError::PoolNotEmpty {
                open: state.entries.len(),
            }
            .into());
        }
        state.capacity = capacity;
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Changes the provider used for identifiers without a scheme.
    ///
    /// # Errors
    ///
    /// Returns a lookup error for an unknown provider and
    /// [`ConcurrencyError::PoolNotEmpty`] while any database is open.
    pub fn set_default_backend(&self, name: &str) -> Result<()> {
        let factory = self.shared.registry.factory(name)?;
        let mut state = self.shared.state.lock();
        if !state.entries.is_empty() {
            return Err(ConcurrencyError::PoolNotEmpty {
                open: state.entries.len(),
            }
            .into());
        }
        state.default_backend = factory.name();
        Ok(())
    }
}

impl fmt::Debug for RrdDbPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RrdDbPool")
            .field("capacity", &state.capacity)
            .field("default_backend", &state.default_backend)
            .field("open", &state.entries.len())
            .field("waiting", &state.queue.len())
            .finish()
    }
}

/// A shared database handle checked out of an [`RrdDbPool`].
///
/// Dereferences to [`RrdDb`]. Dropping it releases it.
pub struct PooledDb {
    pool: RrdDbPool,
    key: ResourceUri,
    db: Arc<RrdDb>,
    released: bool,
}

impl PooledDb {
    /// Canonical identifier the database was opened with.
    pub fn uri(&self) -> &ResourceUri {
        self.db.uri()
    }

    /// Returns the handle to the pool.
    ///
    /// # Errors
    ///
    /// Propagates the close failure when this was the last handle.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.pool.release_key(&self.key)
    }
}

impl Deref for PooledDb {
    type Target = RrdDb;

    fn deref(&self) -> &RrdDb {
        &self.db
    }
}

impl fmt::Debug for PooledDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledDb").field("uri", self.db.uri()).finish()
    }
}

impl Drop for PooledDb {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("releasing {} failed: {e}", self.db.uri());
        }
    }
}
