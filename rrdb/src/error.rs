//! Error types for the rrdb round-robin database engine.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all rrdb operations.
///
/// Each variant wraps the error family of one concern: definitions that fail
/// validation, stores whose bytes cannot be trusted, lock and pool
/// contention, backend I/O, and name/archive lookups.
#[derive(Error, Debug)]
pub enum RrdError {
    /// A definition or argument was rejected before anything was persisted.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The store contents are not a valid round-robin database.
    #[error("corruption error: {0}")]
    Corruption(#[from] CorruptionError),

    /// A lock or pool wait could not be satisfied.
    #[error("concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// The storage backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A datasource, archive or provider could not be found.
    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),

    /// A configuration file could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The database handle was already closed.
    #[error("database '{path}' is already closed")]
    Closed {
        /// Canonical path of the closed database.
        path: String,
    },
}

/// Errors raised while validating definitions, samples and tuning arguments.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The primary step must be strictly positive.
    #[error("invalid step {step}: must be > 0")]
    InvalidStep {
        /// The rejected step in seconds.
        step: i64,
    },

    /// The start time must not be negative.
    #[error("invalid start time {start_time}: must be >= 0")]
    InvalidStartTime {
        /// The rejected start time.
        start_time: i64,
    },

    /// The layout version is unknown.
    #[error("invalid layout version {version}: expected 1 or 2")]
    InvalidVersion {
        /// The rejected version.
        version: u32,
    },

    /// A definition has no datasources.
    #[error("at least one datasource must be defined")]
    NoDatasources,

    /// A definition has no archives.
    #[error("at least one archive must be defined")]
    NoArchives,

    /// Two datasources share a name.
    #[error("datasource '{name}' is already defined")]
    DuplicateDatasource {
        /// The duplicated name.
        name: String,
    },

    /// Two archives share the same (consolidation function, steps) identity.
    #[error("archive {consol_fun}:{steps} is already defined")]
    DuplicateArchive {
        /// Consolidation function name.
        consol_fun: String,
        /// Steps per consolidated row.
        steps: i32,
    },

    /// A datasource name is unusable.
    #[error("invalid datasource name '{name}': {reason}")]
    InvalidDsName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Heartbeat must be at least one second.
    #[error("invalid heartbeat {heartbeat}: must be >= 1")]
    InvalidHeartbeat {
        /// The rejected heartbeat.
        heartbeat: i64,
    },

    /// Minimum must be below maximum when both are bounded.
    #[error("invalid min/max values: {min}/{max}")]
    InvalidMinMax {
        /// Minimum value.
        min: f64,
        /// Maximum value.
        max: f64,
    },

    /// XFF must lie in `[0, 1)`.
    #[error("invalid xff {xff}: must be >= 0 and < 1")]
    InvalidXff {
        /// The rejected xff.
        xff: f64,
    },

    /// Steps per row must be at least one.
    #[error("invalid steps {steps}: must be >= 1")]
    InvalidSteps {
        /// The rejected value.
        steps: i32,
    },

    /// Rows must be at least two.
    #[error("invalid rows {rows}: must be >= 2")]
    InvalidRows {
        /// The rejected value.
        rows: i32,
    },

    /// A textual definition or sample could not be parsed.
    #[error("cannot parse '{input}': {reason}")]
    Parse {
        /// The offending input.
        input: String,
        /// What went wrong.
        reason: String,
    },

    /// Updates must move strictly forward in time.
    #[error(
        "bad sample time {timestamp}: last update time was {last_update}, at least one second step is required"
    )]
    NonIncreasingTimestamp {
        /// Timestamp of the rejected sample.
        timestamp: i64,
        /// Current last update time of the database.
        last_update: i64,
    },

    /// A sample carried the wrong number of values.
    #[error("sample has {actual} values, database has {expected} datasources")]
    ValueCount {
        /// Datasource count of the database.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },

    /// Fetch range is empty or reversed.
    #[error("invalid fetch range: start {start} > end {end}")]
    InvalidFetchRange {
        /// Requested start.
        start: i64,
        /// Requested end.
        end: i64,
    },

    /// Fetch resolution must be positive.
    #[error("invalid resolution {resolution}: must be > 0")]
    InvalidResolution {
        /// The rejected resolution.
        resolution: i64,
    },

    /// A database cannot copy its state onto itself.
    #[error("cannot copy the state of '{path}' onto itself")]
    SameDatabase {
        /// Canonical identifier of the database.
        path: String,
    },

    /// Pool capacity must be positive.
    #[error("invalid pool capacity {capacity}: must be > 0")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },
}

/// Errors raised when stored bytes cannot be interpreted.
#[derive(Error, Debug)]
pub enum CorruptionError {
    /// The header signature does not identify a supported layout.
    #[error("'{path}' is not a round-robin database: unexpected signature '{found}'")]
    InvalidSignature {
        /// Store path.
        path: String,
        /// Signature that was read.
        found: String,
    },

    /// A persisted enum name is not recognised.
    #[error("'{path}' holds unknown {kind} '{value}' at offset {offset}")]
    UnknownEnum {
        /// Store path.
        path: String,
        /// Byte offset of the field.
        offset: u64,
        /// Enum kind (datasource type, consolidation function).
        kind: &'static str,
        /// Name that was read.
        value: String,
    },

    /// A read extended beyond the end of the store.
    #[error("truncated read from '{path}': offset {offset} + length {length} > size {size}")]
    Truncated {
        /// Store path.
        path: String,
        /// Attempted offset.
        offset: u64,
        /// Attempted length.
        length: u64,
        /// Actual store size.
        size: u64,
    },

    /// Header fields are out of range.
    #[error("'{path}' has an invalid header: {reason}")]
    InvalidHeader {
        /// Store path.
        path: String,
        /// Description of the problem.
        reason: String,
    },

    /// A relocated string could not be decoded.
    #[error("'{path}' has a malformed string at offset {offset}: {reason}")]
    MalformedString {
        /// Store path.
        path: String,
        /// Byte offset of the fixed-width slot.
        offset: u64,
        /// Description of the problem.
        reason: String,
    },
}

/// Errors raised by lock acquisition and pool waits.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// The exclusive file lock could not be acquired in time.
    #[error("could not lock '{path}' within {waited:?}")]
    LockTimeout {
        /// Locked file path.
        path: String,
        /// How long the opener waited.
        waited: Duration,
    },

    /// A pool request gave up waiting.
    #[error("timed out after {waited:?} waiting for pooled database '{uri}'")]
    PoolTimeout {
        /// Canonical identifier requested.
        uri: String,
        /// How long the request waited.
        waited: Duration,
    },

    /// The pool must be empty for this operation.
    #[error("pool still holds {open} open database(s)")]
    PoolNotEmpty {
        /// Number of resident entries.
        open: usize,
    },

    /// A handle was released that the pool does not track.
    #[error("database '{uri}' is not held by this pool")]
    NotPooled {
        /// Canonical identifier.
        uri: String,
    },
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backing resource could not be opened or created.
    #[error("failed to open '{path}': {source}")]
    Open {
        /// Resource path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read failed.
    #[error("failed to read '{path}' at offset {offset}: {source}")]
    Read {
        /// Resource path.
        path: String,
        /// Byte offset of the read.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A write failed.
    #[error("failed to write '{path}' at offset {offset}: {source}")]
    Write {
        /// Resource path.
        path: String,
        /// Byte offset of the write.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Resizing the resource failed.
    #[error("failed to set length of '{path}' to {length}: {source}")]
    SetLength {
        /// Resource path.
        path: String,
        /// Requested length.
        length: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Flushing to stable storage failed.
    #[error("failed to sync '{path}': {source}")]
    Sync {
        /// Resource path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping failed.
    #[error("memory mapping failed for '{path}': {source}")]
    Map {
        /// Resource path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing to a read-only backend.
    #[error("'{path}' is opened read-only")]
    ReadOnly {
        /// Resource path.
        path: String,
    },

    /// Access through a backend that was already closed.
    #[error("backend for '{path}' is closed")]
    Closed {
        /// Resource path.
        path: String,
    },

    /// The resource does not exist.
    #[error("could not open non existent database '{path}'")]
    NotFound {
        /// Resource path.
        path: String,
    },

    /// A provider was handed an identifier in another provider's namespace.
    #[error("identifier '{uri}' does not belong to scheme '{expected}'")]
    SchemeMismatch {
        /// The identifier.
        uri: String,
        /// The provider's scheme.
        expected: String,
    },

    /// A size or offset does not fit the platform's address space.
    #[error("length {length} of '{path}' exceeds the addressable range")]
    TooLarge {
        /// Resource path.
        path: String,
        /// Requested length.
        length: u64,
    },
}

/// Errors raised by name and identity lookups.
#[derive(Error, Debug)]
pub enum LookupError {
    /// No archive uses the requested consolidation function.
    #[error("database does not contain an archive with consolidation function {consol_fun}")]
    NoMatchingArchive {
        /// Requested consolidation function.
        consol_fun: String,
    },

    /// Unknown datasource name.
    #[error("unknown datasource name '{name}'")]
    UnknownDatasource {
        /// The name that was looked up.
        name: String,
    },

    /// Unknown archive identity.
    #[error("could not find archive {consol_fun}/{steps}")]
    UnknownArchive {
        /// Consolidation function name.
        consol_fun: String,
        /// Steps per row.
        steps: i32,
    },

    /// Index beyond the datasource or archive count.
    #[error("{kind} index {index} out of range (count {count})")]
    IndexOutOfRange {
        /// "datasource" or "archive".
        kind: &'static str,
        /// Requested index.
        index: usize,
        /// Available entries.
        count: usize,
    },

    /// No backend provider is registered under this name or scheme.
    #[error("no backend provider for '{name}'")]
    UnknownBackend {
        /// Provider name or identifier.
        name: String,
    },
}

/// Errors that can occur while loading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read a configuration or definition file.
    #[error("failed to read '{}': {source}", path.display())]
    Load {
        /// The file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a configuration or definition file.
    #[error("failed to parse '{}': {source}", path.display())]
    Parse {
        /// The file path.
        path: std::path::PathBuf,
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write a configuration or definition file.
    #[error("failed to write '{}': {source}", path.display())]
    Save {
        /// The file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize to JSON.
    #[error("failed to serialize: {source}")]
    Serialize {
        /// The underlying JSON serialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Type alias for `Result<T, RrdError>`.
pub type Result<T> = std::result::Result<T, RrdError>;
