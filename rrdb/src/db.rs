//! The round-robin database engine.
//!
//! An [`RrdDb`] ties one backend to the typed blocks laid out on it:
//!
//! ```text
//! offset 0
//! ┌────────┬──────────────┬──────────────┬─────────────────────────────┐
//! │ Header │ Datasource 0 │ Datasource n │ Archive 0 .. Archive m      │
//! └────────┴──────────────┴──────────────┴─────────────────────────────┘
//!                                         (state + rings, see archive)
//! ```
//!
//! Blocks are allocated in definition order when a database is created and
//! in the same order when it is opened, after the header has told how many
//! datasources and archives follow.
//!
//! # Concurrency
//!
//! Every operation runs under one per-database mutex, so an update's
//! datasource and archive writes are atomic to other callers. Read accessors
//! return owned snapshots ([`DatasourceInfo`], [`ArchiveInfo`]) rather than
//! views into the locked state.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rrdb::{ConsolFun, DsType, FactoryRegistry, FetchRequest, RrdDb, RrdDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FactoryRegistry::default();
//!
//! let mut def = RrdDef::new("/var/lib/rrd/load.rrd", 1_700_000_000, 300)?;
//! def.add_datasource_with("load", DsType::Gauge, 600, 0.0, f64::NAN)?;
//! def.add_archive_with(ConsolFun::Average, 0.5, 1, 288)?;
//! def.add_archive_with(ConsolFun::Max, 0.5, 12, 168)?;
//!
//! let db = RrdDb::create(&def, &registry)?;
//! db.update(1_700_000_300, &[0.42])?;
//! db.update(1_700_000_600, &[0.37])?;
//!
//! let request = FetchRequest::new(ConsolFun::Average, 1_700_000_000, 1_700_000_600)?;
//! let data = db.fetch(&request)?;
//! assert_eq!(data.column_count(), 1);
//! db.close()?;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;

use crate::archive::{Archive, ArchiveInfo};
use crate::backend::{BackendFactory, FactoryRegistry, ResourceUri};
use crate::consolidate::{ConsolFun, current_time};
use crate::datasource::{Datasource, DatasourceInfo};
use crate::error::{
    BackendError, CorruptionError, LookupError, Result, RrdError, ValidationError,
};
use crate::fetch::{FetchData, FetchRequest};
use crate::header::Header;
use crate::primitive::{Allocator, Storage};
use crate::sample::Sample;
use crate::schema::{DsType, RrdDef};

/// An open round-robin database.
#[derive(Debug)]
pub struct RrdDb {
    uri: ResourceUri,
    read_only: bool,
    /// `None` once closed.
    inner: Mutex<Option<Inner>>,
}

/// The blocks of an open database and the storage they live on.
#[derive(Debug)]
struct Inner {
    storage: Storage,
    header: Header,
    datasources: Vec<Datasource>,
    archives: Vec<Archive>,
}

impl RrdDb {
    /// Creates a database from `def`, replacing whatever is stored under
    /// `def.path`.
    ///
    /// The provider is chosen by [`FactoryRegistry::resolve`].
    ///
    /// # Errors
    ///
    /// Returns the definition's [`ValidationError`], a lookup error when no
    /// provider serves the path, or the backend's failure.
    pub fn create(def: &RrdDef, registry: &FactoryRegistry) -> Result<Self> {
        let (factory, uri) = registry.resolve(&def.path)?;
        Self::create_with(def, &factory, uri)
    }

    /// Creates a database with an explicit provider and canonical identifier.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::create`].
    pub fn create_with(def: &RrdDef, factory: &BackendFactory, uri: ResourceUri) -> Result<Self> {
        def.validate()?;
        let storage = Storage::new(factory.open(&uri, false)?);
        let inner = Inner::create(storage, def)?;
        tracing::info!(
            "created {uri} ({} datasources, {} archives, {} bytes)",
            def.ds_count(),
            def.arc_count(),
            def.estimated_size()
        );
        Ok(Self {
            uri,
            read_only: false,
            inner: Mutex::new(Some(inner)),
        })
    }

    /// Opens an existing database for reading and updating.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when nothing is stored under `id`,
    /// and a [`crate::error::CorruptionError`] when the stored bytes are not
    /// a database.
    pub fn open(id: &str, registry: &FactoryRegistry) -> Result<Self> {
        let (factory, uri) = registry.resolve(id)?;
        Self::open_with(&factory, uri, false)
    }

    /// Opens an existing database; every write fails.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::open`].
    pub fn open_read_only(id: &str, registry: &FactoryRegistry) -> Result<Self> {
        let (factory, uri) = registry.resolve(id)?;
        Self::open_with(&factory, uri, true)
    }

    /// Opens with an explicit provider and canonical identifier.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::open`].
    pub fn open_with(factory: &BackendFactory, uri: ResourceUri, read_only: bool) -> Result<Self> {
        if !factory.exists(&uri)? {
            return Err(BackendError::NotFound {
                path: uri.to_string(),
            }
            .into());
        }
        let storage = Storage::new(factory.open(&uri, read_only)?);
        let inner = Inner::open(storage, factory.validate_header())?;
        tracing::debug!("opened {uri} (read_only={read_only})");
        Ok(Self {
            uri,
            read_only,
            inner: Mutex::new(Some(inner)),
        })
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| RrdError::Closed {
            path: self.uri.to_string(),
        })?;
        f(inner)
    }

    fn with_writable<R>(&self, f: impl FnOnce(&mut Inner) -> Result<R>) -> Result<R> {
        if self.read_only {
            return Err(BackendError::ReadOnly {
                path: self.uri.to_string(),
            }
            .into());
        }
        self.with_inner(f)
    }

    /// Canonical identifier.
    pub fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    /// Path inside the provider's namespace.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Whether the database was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether [`RrdDb::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Closes the backend. Later calls are no-ops; every other operation
    /// fails with [`RrdError::Closed`].
    ///
    /// # Errors
    ///
    /// Propagates the backend's close failure.
    pub fn close(&self) -> Result<()> {
        let Some(mut inner) = self.inner.lock().take() else {
            return Ok(());
        };
        inner.storage.close()?;
        tracing::debug!("closed {}", self.uri);
        Ok(())
    }

    /// Applies one sample: `values` holds one raw value per datasource, NaN
    /// for unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NonIncreasingTimestamp`] unless `time` is
    /// after the last update, [`ValidationError::ValueCount`] for a wrong
    /// number of values, and [`BackendError::ReadOnly`] on a read-only
    /// database.
    pub fn update(&self, time: i64, values: &[f64]) -> Result<()> {
        self.with_writable(|inner| inner.update(time, values))
    }

    /// A sample at `time` with every value unknown.
    pub fn create_sample(&self, time: i64) -> Sample<'_> {
        Sample::new(self, time, self.ds_count())
    }

    /// A sample at the current time.
    pub fn create_sample_now(&self) -> Sample<'_> {
        self.create_sample(current_time())
    }

    /// Fetches from the archive that best matches `request`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NoMatchingArchive`] when no archive uses the
    /// requested function and [`LookupError::UnknownDatasource`] for an
    /// unknown name in the filter.
    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchData> {
        self.with_inner(|inner| inner.fetch(request))
    }

    /// Index of the archive best suited to fetch `[start, end]` at
    /// `resolution`.
    ///
    /// Archives whose window reaches back to `start` are preferred, closest
    /// step to `resolution` first; otherwise the archive covering most of
    /// the range wins, ties again broken by step.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NoMatchingArchive`] when no archive uses
    /// `consol_fun`.
    pub fn find_matching_archive(
        &self,
        consol_fun: ConsolFun,
        start: i64,
        end: i64,
        resolution: i64,
    ) -> Result<usize> {
        self.with_inner(|inner| inner.find_matching_archive(consol_fun, start, end, resolution))
    }

    /// Index of the archive best suited to cover `start` until now at
    /// `resolution`. An exact step match wins; archives starting after
    /// `start` are only a fallback.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NoMatchingArchive`] when no archive uses
    /// `consol_fun`.
    pub fn find_start_match_archive(
        &self,
        consol_fun: ConsolFun,
        start: i64,
        resolution: i64,
    ) -> Result<usize> {
        self.with_inner(|inner| inner.find_start_match_archive(consol_fun, start, resolution))
    }

    /// Primary step in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn step(&self) -> Result<i64> {
        self.with_inner(|inner| inner.header.step(&inner.storage))
    }

    /// Layout version (1 or 2).
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close.
    pub fn version(&self) -> Result<u32> {
        self.with_inner(|inner| Ok(inner.header.version()))
    }

    /// Raw header signature.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close.
    pub fn signature(&self) -> Result<String> {
        self.with_inner(|inner| Ok(inner.header.signature().to_string()))
    }

    /// Number of datasources; zero once closed.
    pub fn ds_count(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |i| i.datasources.len())
    }

    /// Number of archives; zero once closed.
    pub fn arc_count(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |i| i.archives.len())
    }

    /// Time of the last accepted sample.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn last_update_time(&self) -> Result<i64> {
        self.with_inner(|inner| inner.header.last_update_time(&inner.storage))
    }

    /// Latest row timestamp over all archives.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn last_archive_update_time(&self) -> Result<i64> {
        self.with_inner(|inner| {
            let last_update = inner.header.last_update_time(&inner.storage)?;
            inner.archives.iter().try_fold(0, |latest, archive| {
                Ok(latest.max(archive.end_time(&inner.storage, last_update)?))
            })
        })
    }

    /// Last raw value of every datasource.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn last_datasource_values(&self) -> Result<Vec<f64>> {
        self.with_inner(|inner| {
            inner
                .datasources
                .iter()
                .map(|ds| ds.last_value(&inner.storage))
                .collect()
        })
    }

    /// Last raw value of the named datasource.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownDatasource`] for an unknown name.
    pub fn last_datasource_value(&self, name: &str) -> Result<f64> {
        self.with_inner(|inner| {
            let index = inner.ds_index(name)?;
            inner.datasources[index].last_value(&inner.storage)
        })
    }

    /// Index of the named datasource.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownDatasource`] for an unknown name.
    pub fn ds_index(&self, name: &str) -> Result<usize> {
        self.with_inner(|inner| inner.ds_index(name))
    }

    /// Whether a datasource with this name exists.
    pub fn contains_ds(&self, name: &str) -> bool {
        self.ds_index(name).is_ok()
    }

    /// Datasource names, in layout order.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close.
    pub fn ds_names(&self) -> Result<Vec<String>> {
        self.with_inner(|inner| Ok(inner.ds_names()))
    }

    /// Index of the archive with this identity.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownArchive`] when there is none.
    pub fn arc_index(&self, consol_fun: ConsolFun, steps: i32) -> Result<usize> {
        self.with_inner(|inner| inner.arc_index(consol_fun, steps))
    }

    /// Snapshot of datasource `index`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::IndexOutOfRange`] beyond the datasource count.
    pub fn datasource(&self, index: usize) -> Result<DatasourceInfo> {
        self.with_inner(|inner| inner.datasource(index)?.info(&inner.storage))
    }

    /// Snapshot of archive `index`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::IndexOutOfRange`] beyond the archive count.
    pub fn archive(&self, index: usize) -> Result<ArchiveInfo> {
        self.with_inner(|inner| {
            let last_update = inner.header.last_update_time(&inner.storage)?;
            inner.archive(index)?.info(&inner.storage, last_update)
        })
    }

    /// Ring contents of datasource `ds` in archive `arc`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::IndexOutOfRange`] for either index.
    pub fn archive_values(&self, arc: usize, ds: usize) -> Result<Vec<f64>> {
        self.with_inner(|inner| {
            inner.datasource(ds)?;
            match inner.archive(arc)?.robin(ds) {
                Some(robin) => robin.values(&inner.storage),
                None => Ok(Vec::new()),
            }
        })
    }

    /// Definition that recreates this database, starting at its last update.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn rrd_def(&self) -> Result<RrdDef> {
        self.with_inner(|inner| {
            let storage = &inner.storage;
            let mut def = RrdDef::new(
                self.uri.to_string(),
                inner.header.last_update_time(storage)?,
                inner.header.step(storage)?,
            )?;
            def.set_version(inner.header.version())?;
            for ds in &inner.datasources {
                def.add_datasource(ds.info(storage)?.def())?;
            }
            let last_update = inner.header.last_update_time(storage)?;
            for archive in &inner.archives {
                def.add_archive(archive.info(storage, last_update)?.def())?;
            }
            Ok(def)
        })
    }

    /// Text dump of the header, datasources and archives.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn dump(&self) -> Result<String> {
        self.with_inner(|inner| {
            let storage = &inner.storage;
            let last_update = inner.header.last_update_time(storage)?;
            let mut out = inner.header.dump(storage)?;
            for ds in &inner.datasources {
                out.push_str(&ds.dump(storage)?);
            }
            for archive in &inner.archives {
                out.push_str(&archive.dump(storage, last_update)?);
            }
            Ok(out)
        })
    }

    /// Image of the whole store.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Closed`] after close, or a read failure.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.with_inner(|inner| inner.storage.backend().read_all())
    }

    /// Changes the heartbeat of datasource `ds`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidHeartbeat`] below one second.
    pub fn set_heartbeat(&self, ds: usize, heartbeat: i64) -> Result<()> {
        self.with_writable(|inner| {
            let count = inner.datasources.len();
            let datasource = inner
                .datasources
                .get(ds)
                .ok_or_else(|| out_of_range("datasource", ds, count))?;
            datasource.set_heartbeat(&mut inner.storage, heartbeat)
        })
    }

    /// Changes the bounds of datasource `ds`. With `filter`, archived values
    /// outside the new bounds become NaN.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidMinMax`] when `min >= max`.
    pub fn set_min_max(&self, ds: usize, min: f64, max: f64, filter: bool) -> Result<()> {
        self.with_writable(|inner| {
            let count = inner.datasources.len();
            let datasource = inner
                .datasources
                .get(ds)
                .ok_or_else(|| out_of_range("datasource", ds, count))?;
            datasource.set_min_max(&mut inner.storage, min, max)?;
            if filter {
                for archive in &inner.archives {
                    if let Some(robin) = archive.robin(ds) {
                        robin.filter_values(&mut inner.storage, min, max)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Renames datasource `ds`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateDatasource`] when another
    /// datasource already has the name, or the name's validation error.
    pub fn set_ds_name(&self, ds: usize, name: &str) -> Result<()> {
        self.with_writable(|inner| {
            let count = inner.datasources.len();
            if ds >= count {
                return Err(out_of_range("datasource", ds, count));
            }
            let taken = inner
                .datasources
                .iter()
                .enumerate()
                .any(|(i, d)| i != ds && d.name() == name);
            if taken {
                return Err(ValidationError::DuplicateDatasource {
                    name: name.to_string(),
                }
                .into());
            }
            inner.datasources[ds].set_name(&mut inner.storage, name)
        })
    }

    /// Changes the type of datasource `ds`. The PDP state and the archives'
    /// fold values for it are reset.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::IndexOutOfRange`] beyond the datasource count.
    pub fn set_ds_type(&self, ds: usize, ds_type: DsType) -> Result<()> {
        self.with_writable(|inner| {
            let count = inner.datasources.len();
            let datasource = inner
                .datasources
                .get_mut(ds)
                .ok_or_else(|| out_of_range("datasource", ds, count))?;
            if datasource.ds_type() == ds_type {
                return Ok(());
            }
            datasource.set_ds_type(&mut inner.storage, ds_type)?;
            for archive in &inner.archives {
                archive.reset_accum(&mut inner.storage, ds)?;
            }
            Ok(())
        })
    }

    /// Changes the X-files factor of archive `arc`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidXff`] outside `[0, 1)`.
    pub fn set_xff(&self, arc: usize, xff: f64) -> Result<()> {
        self.with_writable(|inner| {
            let count = inner.archives.len();
            let archive = inner
                .archives
                .get(arc)
                .ok_or_else(|| out_of_range("archive", arc, count))?;
            archive.set_xff(&mut inner.storage, xff)
        })
    }

    /// Copies this database's state into `target`: the last update time,
    /// datasources matched by name, and archives matched by function and
    /// steps. Rings are copied newest-aligned.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SameDatabase`] when `target` is this
    /// database, and [`RrdError::Closed`] if either is closed.
    pub fn copy_state_to(&self, target: &RrdDb) -> Result<()> {
        if std::ptr::eq(self, target) {
            return Err(ValidationError::SameDatabase {
                path: self.uri.to_string(),
            }
            .into());
        }
        if target.read_only {
            return Err(BackendError::ReadOnly {
                path: target.uri.to_string(),
            }
            .into());
        }

        // Lock in address order so two opposite copies cannot deadlock.
        let source_guard;
        let mut target_guard;
        if std::ptr::from_ref(self) < std::ptr::from_ref(target) {
            source_guard = self.inner.lock();
            target_guard = target.inner.lock();
        } else {
            target_guard = target.inner.lock();
            source_guard = self.inner.lock();
        }

        let source = source_guard.as_ref().ok_or_else(|| RrdError::Closed {
            path: self.uri.to_string(),
        })?;
        let destination = target_guard.as_mut().ok_or_else(|| RrdError::Closed {
            path: target.uri.to_string(),
        })?;
        source.copy_state_to(destination)?;
        tracing::debug!("copied state of {} into {}", self.uri, target.uri);
        Ok(())
    }
}

impl Drop for RrdDb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing {} on drop failed: {e}", self.uri);
        }
    }
}

fn out_of_range(kind: &'static str, index: usize, count: usize) -> RrdError {
    LookupError::IndexOutOfRange { kind, index, count }.into()
}

/// Closes a store whose layout could not be built. The original error wins.
fn abandon(mut storage: Storage, error: &RrdError) {
    if let Err(close_error) = storage.close() {
        tracing::warn!(
            "closing {} after '{error}' failed: {close_error}",
            storage.path()
        );
    }
}

impl Inner {
    fn create(mut storage: Storage, def: &RrdDef) -> Result<Self> {
        match Self::lay_out(&mut storage, def) {
            Ok((header, datasources, archives)) => Ok(Self {
                storage,
                header,
                datasources,
                archives,
            }),
            Err(e) => {
                abandon(storage, &e);
                Err(e)
            }
        }
    }

    fn lay_out(
        storage: &mut Storage,
        def: &RrdDef,
    ) -> Result<(Header, Vec<Datasource>, Vec<Archive>)> {
        storage.backend_mut().set_length(def.estimated_size())?;
        let mut allocator = Allocator::new();
        let header = Header::create(&mut allocator, storage, def)?;
        let mut datasources = Vec::with_capacity(def.ds_count());
        for ds in &def.datasources {
            datasources.push(Datasource::create(
                &mut allocator,
                storage,
                ds,
                def.start_time,
                def.step,
            )?);
        }
        let mut archives = Vec::with_capacity(def.arc_count());
        for arc in &def.archives {
            archives.push(Archive::create(
                &mut allocator,
                storage,
                arc,
                def.ds_count(),
                def.version,
                def.step,
                def.start_time,
            )?);
        }
        Ok((header, datasources, archives))
    }

    fn open(mut storage: Storage, validate: bool) -> Result<Self> {
        match Self::read_layout(&mut storage, validate) {
            Ok((header, datasources, archives)) => Ok(Self {
                storage,
                header,
                datasources,
                archives,
            }),
            Err(e) => {
                abandon(storage, &e);
                Err(e)
            }
        }
    }

    fn read_layout(
        storage: &mut Storage,
        validate: bool,
    ) -> Result<(Header, Vec<Datasource>, Vec<Archive>)> {
        let mut allocator = Allocator::new();
        let header = Header::open(&mut allocator, storage, validate)?;
        let ds_count = header.ds_count(storage)?;
        let arc_count = header.arc_count(storage)?;
        let step = header.step(storage)?;

        let mut datasources = Vec::with_capacity(ds_count);
        for _ in 0..ds_count {
            datasources.push(Datasource::open(&mut allocator, storage)?);
        }
        let mut archives = Vec::with_capacity(arc_count);
        for _ in 0..arc_count {
            archives.push(Archive::open(
                &mut allocator,
                storage,
                ds_count,
                header.version(),
                step,
            )?);
        }

        let length = storage.backend().length()?;
        if allocator.allocated() > length {
            return Err(CorruptionError::InvalidHeader {
                path: storage.path().to_string(),
                reason: format!(
                    "layout needs {} bytes, store has {length}",
                    allocator.allocated()
                ),
            }
            .into());
        }
        Ok((header, datasources, archives))
    }

    fn datasource(&self, index: usize) -> Result<&Datasource> {
        self.datasources
            .get(index)
            .ok_or_else(|| out_of_range("datasource", index, self.datasources.len()))
    }

    fn archive(&self, index: usize) -> Result<&Archive> {
        self.archives
            .get(index)
            .ok_or_else(|| out_of_range("archive", index, self.archives.len()))
    }

    fn ds_names(&self) -> Vec<String> {
        self.datasources.iter().map(|d| d.name().to_string()).collect()
    }

    fn ds_index(&self, name: &str) -> Result<usize> {
        self.datasources
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| {
                LookupError::UnknownDatasource {
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn arc_index(&self, consol_fun: ConsolFun, steps: i32) -> Result<usize> {
        for (i, archive) in self.archives.iter().enumerate() {
            if archive.consol_fun() == consol_fun && archive.steps(&self.storage)? == steps {
                return Ok(i);
            }
        }
        Err(LookupError::UnknownArchive {
            consol_fun: consol_fun.to_string(),
            steps,
        }
        .into())
    }

    fn update(&mut self, time: i64, values: &[f64]) -> Result<()> {
        let Self {
            storage,
            header,
            datasources,
            archives,
        } = self;
        if values.len() != datasources.len() {
            return Err(ValidationError::ValueCount {
                expected: datasources.len(),
                actual: values.len(),
            }
            .into());
        }
        let last_update = header.last_update_time(storage)?;
        if time <= last_update {
            return Err(ValidationError::NonIncreasingTimestamp {
                timestamp: time,
                last_update,
            }
            .into());
        }

        let step = header.step(storage)?;
        for (index, (ds, &value)) in datasources.iter_mut().zip(values).enumerate() {
            let Some(points) = ds.process(storage, step, last_update, time, value)? else {
                continue;
            };
            for archive in archives.iter() {
                let pdp = if archive.consol_fun().uses_total() {
                    points.total
                } else {
                    points.last
                };
                archive.archive(storage, index, pdp, points.steps, last_update)?;
            }
        }
        // Last, so a failed archive write leaves the update unapplied.
        header.set_last_update_time(storage, time)?;
        tracing::trace!("updated {} at {time}", storage.path());
        Ok(())
    }

    fn find_matching_archive(
        &self,
        consol_fun: ConsolFun,
        start: i64,
        end: i64,
        resolution: i64,
    ) -> Result<usize> {
        let last_update = self.header.last_update_time(&self.storage)?;
        let mut full: Option<(usize, i64)> = None;
        let mut partial: Option<(usize, i64, i64)> = None;
        for (i, archive) in self.archives.iter().enumerate() {
            if archive.consol_fun() != consol_fun {
                continue;
            }
            let arc_step = archive.arc_step(&self.storage)?;
            let arc_start = archive.start_time(&self.storage, last_update)? - arc_step;
            let step_diff = (arc_step - resolution).abs();
            if arc_start <= start {
                if full.is_none_or(|(_, best)| step_diff < best) {
                    full = Some((i, step_diff));
                }
            } else {
                let covered = end.saturating_sub(arc_start);
                let better = partial.is_none_or(|(_, best_cover, best_diff)| {
                    covered > best_cover || (covered == best_cover && step_diff < best_diff)
                });
                if better {
                    partial = Some((i, covered, step_diff));
                }
            }
        }
        full.map(|(i, _)| i)
            .or(partial.map(|(i, _, _)| i))
            .ok_or_else(|| {
                LookupError::NoMatchingArchive {
                    consol_fun: consol_fun.to_string(),
                }
                .into()
            })
    }

    fn find_start_match_archive(
        &self,
        consol_fun: ConsolFun,
        start: i64,
        resolution: i64,
    ) -> Result<usize> {
        let last_update = self.header.last_update_time(&self.storage)?;
        let mut covering: Option<(usize, i64)> = None;
        let mut fallback: Option<(usize, i64)> = None;
        for (i, archive) in self.archives.iter().enumerate() {
            if archive.consol_fun() != consol_fun {
                continue;
            }
            let diff = (resolution - archive.arc_step(&self.storage)?).abs();
            if start >= archive.start_time(&self.storage, last_update)? {
                if diff == 0 {
                    return Ok(i);
                }
                if covering.is_none_or(|(_, best)| diff < best) {
                    covering = Some((i, diff));
                }
            } else if fallback.is_none_or(|(_, best)| diff < best) {
                fallback = Some((i, diff));
            }
        }
        covering
            .or(fallback)
            .map(|(i, _)| i)
            .ok_or_else(|| {
                LookupError::NoMatchingArchive {
                    consol_fun: consol_fun.to_string(),
                }
                .into()
            })
    }

    fn fetch(&self, request: &FetchRequest) -> Result<FetchData> {
        let index = self.find_matching_archive(
            request.consol_fun(),
            request.start(),
            request.end(),
            request.resolution(),
        )?;
        let archive = &self.archives[index];

        let (names, indices) = match request.filter() {
            Some(filter) => {
                let indices = filter
                    .iter()
                    .map(|name| self.ds_index(name))
                    .collect::<Result<Vec<_>>>()?;
                (filter.to_vec(), indices)
            }
            None => (self.ds_names(), (0..self.datasources.len()).collect()),
        };

        let last_update = self.header.last_update_time(&self.storage)?;
        let (timestamps, values) = archive.fetch(
            &self.storage,
            request.start(),
            request.end(),
            &indices,
            last_update,
        )?;
        Ok(FetchData::new(
            request,
            archive.steps(&self.storage)?,
            archive.arc_step(&self.storage)?,
            names,
            timestamps,
            values,
        ))
    }

    fn copy_state_to(&self, target: &mut Inner) -> Result<()> {
        let last_update = self.header.last_update_time(&self.storage)?;
        target
            .header
            .set_last_update_time(&mut target.storage, last_update)?;

        let mut pairs = Vec::new();
        for (from, ds) in self.datasources.iter().enumerate() {
            if let Some(to) = target.datasources.iter().position(|t| t.name() == ds.name()) {
                ds.copy_state_to(&self.storage, &mut target.datasources[to], &mut target.storage)?;
                pairs.push((from, to));
            }
        }

        for archive in &self.archives {
            let steps = archive.steps(&self.storage)?;
            if let Ok(to) = target.arc_index(archive.consol_fun(), steps) {
                archive.copy_state_to(
                    &self.storage,
                    &target.archives[to],
                    &mut target.storage,
                    &pairs,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArcDef, DsDef};

    fn def(name: &str, version: u32) -> RrdDef {
        let mut def = RrdDef::new(format!("memory:{name}"), 960, 60).unwrap();
        def.set_version(version).unwrap();
        def.add_datasource_with("in", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        def.add_datasource_with("out", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        def.add_archive_with(ConsolFun::Average, 0.5, 1, 10).unwrap();
        def.add_archive_with(ConsolFun::Max, 0.5, 5, 10).unwrap();
        def
    }

    #[test]
    fn test_create_and_reopen() {
        let registry = FactoryRegistry::default();
        for version in [1, 2] {
            let def = def(&format!("db-reopen-{version}"), version);
            let db = RrdDb::create(&def, &registry).unwrap();
            db.update(1_020, &[1.0, 2.0]).unwrap();
            db.update(1_080, &[3.0, 4.0]).unwrap();
            let before = db.dump().unwrap();
            db.close().unwrap();

            let db = RrdDb::open(&def.path, &registry).unwrap();
            assert_eq!(db.version().unwrap(), version);
            assert_eq!(db.dump().unwrap(), before);
            assert_eq!(db.last_update_time().unwrap(), 1_080);
            assert_eq!(db.ds_names().unwrap(), vec!["in", "out"]);
            let values = db.archive_values(0, 1).unwrap();
            assert_eq!(&values[8..], &[2.0, 4.0]);
        }
    }

    #[test]
    fn test_rejects_bad_updates() {
        let registry = FactoryRegistry::default();
        let db = RrdDb::create(&def("db-bad-updates", 2), &registry).unwrap();
        assert!(matches!(
            db.update(960, &[1.0, 2.0]),
            Err(RrdError::Validation(ValidationError::NonIncreasingTimestamp { .. }))
        ));
        assert!(matches!(
            db.update(1_060, &[1.0]),
            Err(RrdError::Validation(ValidationError::ValueCount { .. }))
        ));
        assert_eq!(db.last_update_time().unwrap(), 960);
    }

    #[test]
    fn test_missing_store() {
        let registry = FactoryRegistry::default();
        let err = RrdDb::open("memory:db-missing", &registry).unwrap_err();
        assert!(matches!(err, RrdError::Backend(BackendError::NotFound { .. })));
    }

    #[test]
    fn test_closed_handle() {
        let registry = FactoryRegistry::default();
        let db = RrdDb::create(&def("db-closed", 2), &registry).unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.last_update_time(), Err(RrdError::Closed { .. })));
        assert_eq!(db.ds_count(), 0);
    }

    #[test]
    fn test_lookups() {
        let registry = FactoryRegistry::default();
        let db = RrdDb::create(&def("db-lookups", 2), &registry).unwrap();
        assert_eq!(db.ds_index("out").unwrap(), 1);
        assert!(db.contains_ds("in"));
        assert!(!db.contains_ds("missing"));
        assert_eq!(db.arc_index(ConsolFun::Max, 5).unwrap(), 1);
        assert!(db.arc_index(ConsolFun::Max, 1).is_err());
        assert!(db.datasource(2).is_err());
        assert_eq!(db.archive(1).unwrap().arc_step, 300);
        assert_eq!(db.step().unwrap(), 60);
        assert_eq!(db.signature().unwrap(), "RRD4J, version 0.2");
    }

    #[test]
    fn test_rrd_def_round_trip() {
        let registry = FactoryRegistry::default();
        let original = def("db-def", 1);
        let db = RrdDb::create(&original, &registry).unwrap();
        let rebuilt = db.rrd_def().unwrap();
        assert_eq!(rebuilt.path, "memory:db-def");
        assert_eq!(rebuilt.version, 1);
        assert_eq!(rebuilt.datasources, original.datasources);
        assert_eq!(rebuilt.archives, original.archives);
    }

    #[test]
    fn test_find_matching_archive() {
        let registry = FactoryRegistry::default();
        let mut def = RrdDef::new("memory:db-matching", 0, 60).unwrap();
        def.add_datasource(DsDef::new("x", DsType::Gauge, 120, f64::NAN, f64::NAN).unwrap())
            .unwrap();
        def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 10).unwrap())
            .unwrap();
        def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 10, 10).unwrap())
            .unwrap();
        def.add_archive(ArcDef::new(ConsolFun::Min, 0.5, 1, 10).unwrap())
            .unwrap();
        let db = RrdDb::create(&def, &registry).unwrap();
        db.update(6_000, &[1.0]).unwrap();

        // The fine archive starts at 5_460, the coarse one at 600.
        assert_eq!(db.find_matching_archive(ConsolFun::Average, 5_500, 6_000, 1).unwrap(), 0);
        assert_eq!(db.find_matching_archive(ConsolFun::Average, 600, 6_000, 1).unwrap(), 1);
        assert_eq!(db.find_matching_archive(ConsolFun::Min, 0, 6_000, 1).unwrap(), 2);
        assert!(db.find_matching_archive(ConsolFun::Max, 0, 6_000, 1).is_err());

        assert_eq!(db.find_start_match_archive(ConsolFun::Average, 5_500, 60).unwrap(), 0);
        assert_eq!(db.find_start_match_archive(ConsolFun::Average, 600, 60).unwrap(), 1);
        assert_eq!(db.find_start_match_archive(ConsolFun::Average, 0, 600).unwrap(), 1);
    }

    #[test]
    fn test_tuning() {
        let registry = FactoryRegistry::default();
        let db = RrdDb::create(&def("db-tuning", 2), &registry).unwrap();
        db.update(1_020, &[5.0, 50.0]).unwrap();
        db.update(1_080, &[7.0, 70.0]).unwrap();

        db.set_heartbeat(0, 300).unwrap();
        assert!(db.set_heartbeat(0, 0).is_err());
        assert_eq!(db.datasource(0).unwrap().heartbeat, 300);

        db.set_min_max(1, 0.0, 60.0, true).unwrap();
        let values = db.archive_values(0, 1).unwrap();
        assert_eq!(values[8], 50.0);
        assert!(values[9].is_nan());

        assert!(db.set_ds_name(1, "in").is_err());
        db.set_ds_name(1, "egress").unwrap();
        assert_eq!(db.ds_index("egress").unwrap(), 1);

        db.set_ds_type(0, DsType::Counter).unwrap();
        let info = db.datasource(0).unwrap();
        assert_eq!(info.ds_type, DsType::Counter);
        assert!(info.last_value.is_nan());
        assert!(db.archive(1).unwrap().states[0].accum_value.is_nan());

        assert!(db.set_xff(1, 1.5).is_err());
        db.set_xff(1, 0.1).unwrap();
        assert_eq!(db.archive(1).unwrap().xff, 0.1);
    }

    #[test]
    fn test_read_only() {
        let registry = FactoryRegistry::default();
        let def = def("db-read-only", 2);
        drop(RrdDb::create(&def, &registry).unwrap());
        let db = RrdDb::open_read_only(&def.path, &registry).unwrap();
        assert!(db.is_read_only());
        assert!(matches!(
            db.update(1_060, &[1.0, 1.0]),
            Err(RrdError::Backend(BackendError::ReadOnly { .. }))
        ));
        assert!(db.set_xff(0, 0.2).is_err());
        assert_eq!(db.last_update_time().unwrap(), 960);
    }

    #[test]
    fn test_copy_state() {
        let registry = FactoryRegistry::default();
        let source = RrdDb::create(&def("db-copy-source", 2), &registry).unwrap();
        for i in 1..=12 {
            source
                .update(960 + 60 * i64::from(i), &[f64::from(i), 0.0])
                .unwrap();
        }

        let mut target_def = RrdDef::new("memory:db-copy-target", 0, 60).unwrap();
        target_def
            .add_datasource_with("out", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        target_def
            .add_datasource_with("in", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        target_def.add_archive_with(ConsolFun::Average, 0.5, 1, 4).unwrap();
        let target = RrdDb::create(&target_def, &registry).unwrap();

        source.copy_state_to(&target).unwrap();
        assert!(source.copy_state_to(&source).is_err());
        assert_eq!(target.last_update_time().unwrap(), 1_680);
        assert_eq!(target.last_datasource_value("in").unwrap(), 12.0);
        assert_eq!(target.archive_values(0, 1).unwrap(), vec![9.0, 10.0, 11.0, 12.0]);
        assert_eq!(target.archive_values(0, 0).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_bytes_start_with_signature() {
        let registry = FactoryRegistry::default();
        let def = def("db-bytes", 2);
        let db = RrdDb::create(&def, &registry).unwrap();
        let bytes = db.bytes().unwrap();
        assert_eq!(bytes.len() as u64, def.estimated_size());
        assert_eq!(&bytes[..4], &[0, b'R', 0, b'R']);
    }
}
