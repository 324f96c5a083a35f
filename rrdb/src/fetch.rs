//! Fetch requests and their results.
//!
//! A [`FetchRequest`] names a consolidation function, a time range and a
//! preferred resolution. The engine picks the archive that serves the
//! request best (see [`crate::RrdDb::find_matching_archive`]) and returns a
//! [`FetchData`]: one equidistant timestamp axis plus one column of values
//! per requested datasource.
//!
//! ```text
//!             ds0      ds1
//! t0      │  1.0e0  │  NaN   │
//! t0+s    │  2.0e0  │  4.0e0 │
//! t0+2s   │  NaN    │  5.0e0 │
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rrdb::{ConsolFun, FactoryRegistry, FetchRequest, RrdDb};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FactoryRegistry::default();
//! let db = RrdDb::open("/var/lib/rrd/cpu.rrd", &registry)?;
//! let request = FetchRequest::new(ConsolFun::Average, 1_700_000_000, 1_700_086_400)?
//!     .with_resolution(3_600)?;
//! let data = db.fetch(&request)?;
//! println!("{data}");
//! # Ok(())
//! # }
//! ```

use std::fmt;

use serde::Serialize;

use crate::consolidate::ConsolFun;
use crate::error::{LookupError, Result, ValidationError};

/// Parameters of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    consol_fun: ConsolFun,
    start: i64,
    end: i64,
    resolution: i64,
    filter: Option<Vec<String>>,
}

impl FetchRequest {
    /// Creates a request for `[start, end]` at the finest resolution.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidStartTime`] for a negative start and
    /// [`ValidationError::InvalidFetchRange`] when `start > end`.
    pub fn new(consol_fun: ConsolFun, start: i64, end: i64) -> Result<Self> {
        if start < 0 {
            return Err(ValidationError::InvalidStartTime { start_time: start }.into());
        }
        if start > end {
            return Err(ValidationError::InvalidFetchRange { start, end }.into());
        }
        Ok(Self {
            consol_fun,
            start,
            end,
            resolution: 1,
            filter: None,
        })
    }

    /// Sets the preferred archive step in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidResolution`] unless positive.
    pub fn with_resolution(mut self, resolution: i64) -> Result<Self> {
        if resolution <= 0 {
            return Err(ValidationError::InvalidResolution { resolution }.into());
        }
        self.resolution = resolution;
        Ok(self)
    }

    /// Restricts the result to the named datasources, in the given order.
    pub fn with_filter<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Consolidation function.
    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun
    }

    /// Requested start.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Requested end.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Preferred step in seconds.
    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    /// Datasource filter, `None` for all datasources.
    pub fn filter(&self) -> Option<&[String]> {
        self.filter.as_deref()
    }
}

/// Values fetched from one archive.
///
/// Unknown values are NaN (serialized as `null`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchData {
    consol_fun: ConsolFun,
    arc_steps: i32,
    step: i64,
    request_start: i64,
    request_end: i64,
    ds_names: Vec<String>,
    timestamps: Vec<i64>,
    values: Vec<Vec<f64>>,
}

impl FetchData {
    pub(crate) fn new(
        request: &FetchRequest,
        arc_steps: i32,
        step: i64,
        ds_names: Vec<String>,
        timestamps: Vec<i64>,
        values: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            consol_fun: request.consol_fun,
            arc_steps,
            step,
            request_start: request.start,
            request_end: request.end,
            ds_names,
            timestamps,
            values,
        }
    }

    /// Timestamp axis.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Column `index`, in the order of [`FetchData::ds_names`].
    pub fn values(&self, index: usize) -> Option<&[f64]> {
        self.values.get(index).map(Vec::as_slice)
    }

    /// Column of the named datasource.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownDatasource`] if the datasource was not
    /// fetched.
    pub fn values_by_name(&self, name: &str) -> Result<&[f64]> {
        self.ds_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i].as_slice())
            .ok_or_else(|| {
                LookupError::UnknownDatasource {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Number of timestamps.
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// Number of datasources.
    pub fn column_count(&self) -> usize {
        self.ds_names.len()
    }

    /// Fetched datasource names.
    pub fn ds_names(&self) -> &[String] {
        &self.ds_names
    }

    /// Seconds between timestamps.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// First timestamp.
    pub fn first_timestamp(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    /// Last timestamp.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    /// Range originally requested.
    pub fn requested_range(&self) -> (i64, i64) {
        (self.request_start, self.request_end)
    }

    /// Identity `(consolidation function, steps)` of the archive that served
    /// the request.
    pub fn matching_archive(&self) -> (ConsolFun, i32) {
        (self.consol_fun, self.arc_steps)
    }

    /// Reduces the named column with `consol_fun`, skipping unknown values.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownDatasource`] if the datasource was not
    /// fetched.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use rrdb::{ConsolFun, FactoryRegistry, FetchRequest, RrdDb};
    /// # let registry = FactoryRegistry::default();
    /// # let db = RrdDb::open("/var/lib/rrd/net.rrd", &registry)?;
    /// # let data = db.fetch(&FetchRequest::new(ConsolFun::Average, 0, 86_400)?)?;
    /// let bytes = data.aggregate("in", ConsolFun::Total)?;
    /// let peak = data.aggregate("in", ConsolFun::Max)?;
    /// println!("{bytes} bytes, peak {peak} B/s");
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn aggregate(&self, name: &str, consol_fun: ConsolFun) -> Result<f64> {
        Ok(consol_fun.aggregate(self.values_by_name(name)?, self.step))
    }

    /// Plain `timestamp:  value  value` rows.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (row, timestamp) in self.timestamps.iter().enumerate() {
            out.push_str(&format!("{timestamp}:  "));
            for column in &self.values {
                out.push_str(&format!("{}  ", column[row]));
            }
            out.push('\n');
        }
        out
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.10e}")
    }
}

impl fmt::Display for FetchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12}", "")?;
        for name in &self.ds_names {
            write!(f, " {name:>18}")?;
        }
        writeln!(f)?;
        writeln!(f)?;
        for (row, timestamp) in self.timestamps.iter().enumerate() {
            write!(f, "{timestamp:>11}:")?;
            for column in &self.values {
                write!(f, " {:>18}", format_value(column[row]))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
