//! # rrdb
//!
//! Embedded round-robin database engine with RRDTool-compatible consolidation.
//!
//! rrdb stores fixed-size time series the way rrdtool and RRD4J do: raw
//! samples are turned into rates, normalised onto a fixed step
//! (primary data points), and consolidated into any number of circular
//! archives of coarser resolution. A database never grows after creation,
//! and its on-disk layout is byte-compatible with RRD4J's `0.1`/`0.2` files.
//!
//! ## Key Properties
//!
//! - Fixed size: determined by the definition, not by data volume
//! - AVERAGE, MIN, MAX, LAST, FIRST and TOTAL consolidation with XFF
//! - GAUGE, COUNTER (with 32/64-bit wrap), DERIVE and ABSOLUTE datasources
//! - Pluggable storage backends: plain file, memory-mapped, locked file, memory
//! - A bounded pool sharing one handle per database between threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rrdb::{ConsolFun, DsType, FactoryRegistry, FetchRequest, RrdDb, RrdDef};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FactoryRegistry::default();
//!
//! // 5-minute step, one gauge, a day of raw points and a month of hourly maxima
//! let mut def = RrdDef::new("/var/lib/rrd/temp.rrd", 1_700_000_000, 300)?;
//! def.add_datasource_with("temp", DsType::Gauge, 600, -40.0, 100.0)?;
//! def.add_archive_with(ConsolFun::Average, 0.5, 1, 288)?;
//! def.add_archive_with(ConsolFun::Max, 0.5, 12, 744)?;
//!
//! let db = RrdDb::create(&def, &registry)?;
//! db.update(1_700_000_300, &[21.5])?;
//! db.create_sample(0).set_and_update("1700000600:22.0")?;
//!
//! let data = db.fetch(&FetchRequest::new(ConsolFun::Average, 1_700_000_000, 1_700_000_600)?)?;
//! for (i, timestamp) in data.timestamps().iter().enumerate() {
//!     println!("{timestamp}: {:?}", data.values(0).map(|v| v[i]));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  update(t, values)
//!        │
//!        ▼
//!  ┌────────────┐  PDPs   ┌──────────┐  CDPs   ┌────────────────┐
//!  │ Datasource │ ──────▶ │ Archive  │ ──────▶ │ CircularBuffer │
//!  │ (rate, PDP)│         │ (ArcState│         │ (rows)         │
//!  └────────────┘         │  per ds) │         └────────────────┘
//!                         └──────────┘
//!        all fields live in one Storage ─▶ Backend (file/mmap/locked/memory)
//! ```
//!
//! - [`RrdDb`]: Open database; update, fetch, tuning
//! - [`RrdDef`]: Definition used to create a database
//! - [`Sample`]: Pending update in `timestamp:value` form
//! - [`FetchRequest`] / [`FetchData`]: Reading consolidated values
//! - [`RrdDbPool`]: Shared, bounded set of open databases
//! - [`FactoryRegistry`]: Backend providers keyed by URI scheme
//!
//! ## Modules
//!
//! - [`backend`]: Byte-addressed storage backends and their providers
//! - [`primitive`]: Typed fields over a backend
//! - [`header`], [`datasource`], [`archive`], [`ring`]: Persistent layout
//! - [`consolidate`]: Consolidation functions and time helpers
//! - [`schema`]: Definitions and validation
//! - [`config`]: Engine configuration file
//! - [`error`]: Error types

pub mod archive;
pub mod backend;
pub mod config;
pub mod consolidate;
pub mod datasource;
pub mod db;
pub mod error;
pub mod fetch;
pub mod header;
pub mod pool;
pub mod primitive;
pub mod ring;
pub mod sample;
pub mod schema;

// Re-export primary API types at crate root for convenience.
pub use archive::ArchiveInfo;
pub use backend::{Backend, BackendFactory, FactoryRegistry, ResourceUri};
pub use config::EngineConfig;
pub use consolidate::ConsolFun;
pub use datasource::DatasourceInfo;
pub use db::RrdDb;
pub use error::{Result, RrdError};
pub use fetch::{FetchData, FetchRequest};
pub use pool::{PooledDb, RrdDbPool};
pub use sample::Sample;
pub use schema::{ArcDef, DsDef, DsType, RrdDef};
