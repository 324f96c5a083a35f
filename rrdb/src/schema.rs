//! Database definitions.
//!
//! An [`RrdDef`] fixes everything about a database at creation time: the
//! primary step, the datasources it ingests and the archives that keep
//! consolidated history. Definitions are validated here, before anything is
//! persisted, and can be written as JSON or parsed from the classic rrdtool
//! syntax:
//!
//! ```text
//! DS:name:TYPE:heartbeat:min:max      DS:input:COUNTER:600:0:U
//! RRA:CF:xff:steps:rows               RRA:AVERAGE:0.5:1:600
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consolidate::{ConsolFun, current_time};
use crate::error::{ConfigError, Result, ValidationError};
use crate::primitive::string::{MAX_RELOCATED_UNITS, is_digit_unit};
use crate::primitive::PersistedEnum;

/// Default primary step in seconds.
pub const DEFAULT_STEP: i64 = 300;

/// Layout version written by default.
pub const DEFAULT_VERSION: u32 = 2;

/// Suffix marking a datasource whose unknown values are stored as zero.
pub const FORCE_ZERO_SUFFIX: char = '!';

/// How raw datasource values turn into rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsType {
    /// The value is the rate.
    Gauge,
    /// A monotonically increasing counter that may wrap.
    Counter,
    /// A counter that may decrease.
    Derive,
    /// A counter reset on every read.
    Absolute,
}

impl DsType {
    /// All types.
    pub const ALL: [Self; 4] = [Self::Gauge, Self::Counter, Self::Derive, Self::Absolute];

    /// The persisted name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Gauge => "GAUGE",
            Self::Counter => "COUNTER",
            Self::Derive => "DERIVE",
            Self::Absolute => "ABSOLUTE",
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DsType {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_name(&s.trim().to_ascii_uppercase()).ok_or_else(|| ValidationError::Parse {
            input: s.to_string(),
            reason: "unknown datasource type".to_string(),
        })
    }
}

impl PersistedEnum for DsType {
    const KIND: &'static str = "datasource type";

    fn name(self) -> &'static str {
        DsType::name(self)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

/// Serialises unbounded (NaN) limits as JSON `null`.
mod unbounded {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Definition of one datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsDef {
    /// Unique name. A trailing `!` stores unknown values as zero.
    pub name: String,
    /// Rate computation.
    pub ds_type: DsType,
    /// Longest gap, in seconds, between samples that still yields a rate.
    pub heartbeat: i64,
    /// Smallest accepted rate; NaN is unbounded.
    #[serde(with = "unbounded", default = "nan")]
    pub min: f64,
    /// Largest accepted rate; NaN is unbounded.
    #[serde(with = "unbounded", default = "nan")]
    pub max: f64,
}

fn nan() -> f64 {
    f64::NAN
}

impl DsDef {
    /// Creates and validates a datasource definition.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for a bad name, a heartbeat below one
    /// second, or `min >= max`.
    pub fn new(
        name: impl Into<String>,
        ds_type: DsType,
        heartbeat: i64,
        min: f64,
        max: f64,
    ) -> Result<Self> {
        let def = Self {
            name: name.into(),
            ds_type,
            heartbeat,
            min,
            max,
        };
        def.validate()?;
        Ok(def)
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// See [`DsDef::new`].
    pub fn validate(&self) -> Result<()> {
        validate_ds_name(&self.name)?;
        validate_heartbeat(self.heartbeat)?;
        validate_min_max(self.min, self.max)
    }

    /// Whether unknown values are stored as zero.
    pub fn force_zero(&self) -> bool {
        is_force_zero(&self.name)
    }

    /// Definition in rrdtool syntax.
    pub fn dump(&self) -> String {
        format!(
            "DS:{}:{}:{}:{}:{}",
            self.name,
            self.ds_type,
            self.heartbeat,
            format_limit(self.min),
            format_limit(self.max)
        )
    }

    /// Field-by-field equality, NaN limits included.
    pub fn exactly_equal(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ds_type == other.ds_type
            && self.heartbeat == other.heartbeat
            && self.min.to_bits() == other.min.to_bits()
            && self.max.to_bits() == other.max.to_bits()
    }
}

impl PartialEq for DsDef {
    fn eq(&self, other: &Self) -> bool {
        self.exactly_equal(other)
    }
}

impl FromStr for DsDef {
    type Err = crate::error::RrdError;

    /// Parses `DS:name:TYPE:heartbeat:min:max`; `U` marks an unbounded limit.
    fn from_str(s: &str) -> Result<Self> {
        let parse_error = |reason: &str| ValidationError::Parse {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let tokens: Vec<&str> = s.trim().split(':').collect();
        if tokens.len() != 6 || !tokens[0].eq_ignore_ascii_case("DS") {
            return Err(parse_error("expected DS:name:type:heartbeat:min:max").into());
        }
        let ds_type: DsType = tokens[2].parse()?;
        let heartbeat: i64 = tokens[3]
            .parse()
            .map_err(|_| parse_error("heartbeat is not an integer"))?;
        let min = parse_limit(tokens[4]).ok_or_else(|| parse_error("min is not a number"))?;
        let max = parse_limit(tokens[5]).ok_or_else(|| parse_error("max is not a number"))?;
        Self::new(tokens[1], ds_type, heartbeat, min, max)
    }
}

/// Definition of one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcDef {
    /// Consolidation function.
    pub consol_fun: ConsolFun,
    /// Largest tolerated fraction of unknown PDPs per CDP, in `[0, 1)`.
    pub xff: f64,
    /// Primary steps per consolidated row.
    pub steps: i32,
    /// Ring capacity.
    pub rows: i32,
}

impl ArcDef {
    /// Creates and validates an archive definition.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for xff outside `[0, 1)`, `steps < 1`
    /// or `rows < 2`.
    pub fn new(consol_fun: ConsolFun, xff: f64, steps: i32, rows: i32) -> Result<Self> {
        let def = Self {
            consol_fun,
            xff,
            steps,
            rows,
        };
        def.validate()?;
        Ok(def)
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// See [`ArcDef::new`].
    pub fn validate(&self) -> Result<()> {
        validate_xff(self.xff)?;
        if self.steps < 1 {
            return Err(ValidationError::InvalidSteps { steps: self.steps }.into());
        }
        if self.rows < 2 {
            return Err(ValidationError::InvalidRows { rows: self.rows }.into());
        }
        Ok(())
    }

    /// Whether two archives share the `(consol_fun, steps)` identity.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.consol_fun == other.consol_fun && self.steps == other.steps
    }

    /// Definition in rrdtool syntax.
    pub fn dump(&self) -> String {
        format!(
            "RRA:{}:{}:{}:{}",
            self.consol_fun, self.xff, self.steps, self.rows
        )
    }
}

impl PartialEq for ArcDef {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
            && self.xff.to_bits() == other.xff.to_bits()
            && self.rows == other.rows
    }
}

impl FromStr for ArcDef {
    type Err = crate::error::RrdError;

    /// Parses `RRA:CF:xff:steps:rows`.
    fn from_str(s: &str) -> Result<Self> {
        let parse_error = |reason: &str| ValidationError::Parse {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let tokens: Vec<&str> = s.trim().split(':').collect();
        if tokens.len() != 5 || !tokens[0].eq_ignore_ascii_case("RRA") {
            return Err(parse_error("expected RRA:cf:xff:steps:rows").into());
        }
        let consol_fun: ConsolFun = tokens[1].parse()?;
        let xff: f64 = tokens[2]
            .parse()
            .map_err(|_| parse_error("xff is not a number"))?;
        let steps: i32 = tokens[3]
            .parse()
            .map_err(|_| parse_error("steps is not an integer"))?;
        let rows: i32 = tokens[4]
            .parse()
            .map_err(|_| parse_error("rows is not an integer"))?;
        Self::new(consol_fun, xff, steps, rows)
    }
}

/// Complete definition of a database.
///
/// # Examples
///
/// ```rust
/// use rrdb::{ConsolFun, DsType, RrdDef};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut def = RrdDef::new("memory:traffic", 1_700_000_000, 300)?;
/// def.add_datasource("DS:input:COUNTER:600:0:U".parse()?)?;
/// def.add_datasource_with("output", DsType::Counter, 600, 0.0, f64::NAN)?;
/// def.add_archive_with(ConsolFun::Average, 0.5, 1, 600)?;
/// def.add_archive("RRA:MAX:0.5:12:700".parse()?)?;
///
/// assert_eq!(def.ds_count(), 2);
/// assert!(def.estimated_size() > 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrdDef {
    /// Resource identifier (`scheme:path` or a bare path).
    pub path: String,
    /// Creation time; also the initial last update time.
    pub start_time: i64,
    /// Primary step in seconds.
    pub step: i64,
    /// Layout version: 1 (per-datasource rings) or 2 (shared matrix).
    #[serde(default = "default_version")]
    pub version: u32,
    /// Datasources, in layout order.
    #[serde(default)]
    pub datasources: Vec<DsDef>,
    /// Archives, in layout order.
    #[serde(default)]
    pub archives: Vec<ArcDef>,
}

fn default_version() -> u32 {
    DEFAULT_VERSION
}

impl RrdDef {
    /// Starts an empty definition.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidStep`] for a non-positive step and
    /// [`ValidationError::InvalidStartTime`] for a negative start time.
    pub fn new(path: impl Into<String>, start_time: i64, step: i64) -> Result<Self> {
        validate_step(step)?;
        validate_start_time(start_time)?;
        Ok(Self {
            path: path.into(),
            start_time,
            step,
            version: DEFAULT_VERSION,
            datasources: Vec::new(),
            archives: Vec::new(),
        })
    }

    /// Starts an empty definition with the default step, starting ten
    /// seconds ago.
    pub fn with_defaults(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            start_time: (current_time() - 10).max(0),
            step: DEFAULT_STEP,
            version: DEFAULT_VERSION,
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    /// Selects the layout version.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidVersion`] unless `version` is 1 or 2.
    pub fn set_version(&mut self, version: u32) -> Result<()> {
        validate_version(version)?;
        self.version = version;
        Ok(())
    }

    /// Adds a datasource.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateDatasource`] if the name is taken,
    /// or the datasource's own validation error.
    pub fn add_datasource(&mut self, def: DsDef) -> Result<()> {
        def.validate()?;
        if self.datasources.iter().any(|d| d.name == def.name) {
            return Err(ValidationError::DuplicateDatasource { name: def.name }.into());
        }
        self.datasources.push(def);
        Ok(())
    }

    /// Builds and adds a datasource.
    ///
    /// # Errors
    ///
    /// See [`RrdDef::add_datasource`].
    pub fn add_datasource_with(
        &mut self,
        name: &str,
        ds_type: DsType,
        heartbeat: i64,
        min: f64,
        max: f64,
    ) -> Result<()> {
        self.add_datasource(DsDef::new(name, ds_type, heartbeat, min, max)?)
    }

    /// Adds an archive.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateArchive`] if an archive with the
    /// same function and steps exists, or the archive's own validation error.
    pub fn add_archive(&mut self, def: ArcDef) -> Result<()> {
        def.validate()?;
        if self.archives.iter().any(|a| a.same_identity(&def)) {
            return Err(ValidationError::DuplicateArchive {
                consol_fun: def.consol_fun.to_string(),
                steps: def.steps,
            }
            .into());
        }
        self.archives.push(def);
        Ok(())
    }

    /// Builds and adds an archive.
    ///
    /// # Errors
    ///
    /// See [`RrdDef::add_archive`].
    pub fn add_archive_with(
        &mut self,
        consol_fun: ConsolFun,
        xff: f64,
        steps: i32,
        rows: i32,
    ) -> Result<()> {
        self.add_archive(ArcDef::new(consol_fun, xff, steps, rows)?)
    }

    /// Checks the whole definition, as done before creating a database.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<()> {
        validate_step(self.step)?;
        validate_start_time(self.start_time)?;
        validate_version(self.version)?;
        if self.datasources.is_empty() {
            return Err(ValidationError::NoDatasources.into());
        }
        if self.archives.is_empty() {
            return Err(ValidationError::NoArchives.into());
        }
        for (i, ds) in self.datasources.iter().enumerate() {
            ds.validate()?;
            if self.datasources[..i].iter().any(|d| d.name == ds.name) {
                return Err(ValidationError::DuplicateDatasource {
                    name: ds.name.clone(),
                }
                .into());
            }
        }
        for (i, arc) in self.archives.iter().enumerate() {
            arc.validate()?;
            if self.archives[..i].iter().any(|a| a.same_identity(arc)) {
                return Err(ValidationError::DuplicateArchive {
                    consol_fun: arc.consol_fun.to_string(),
                    steps: arc.steps,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Number of datasources.
    pub fn ds_count(&self) -> usize {
        self.datasources.len()
    }

    /// Number of archives.
    pub fn arc_count(&self) -> usize {
        self.archives.len()
    }

    /// Datasource names, in layout order.
    pub fn ds_names(&self) -> Vec<&str> {
        self.datasources.iter().map(|d| d.name.as_str()).collect()
    }

    /// Bytes needed to store a database with this definition.
    pub fn estimated_size(&self) -> u64 {
        let rows: u64 = self
            .archives
            .iter()
            .map(|a| u64::try_from(a.rows).unwrap_or(0))
            .sum();
        let names: Vec<&str> = self.ds_names();
        calculate_size(self.ds_count() as u64, self.arc_count() as u64, rows, &names)
    }

    /// Definition as an rrdtool `create` command line.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "create \"{}\" --version {} --start {} --step {}",
            self.path, self.version, self.start_time, self.step
        );
        for ds in &self.datasources {
            out.push(' ');
            out.push_str(&ds.dump());
        }
        for arc in &self.archives {
            out.push(' ');
            out.push_str(&arc.dump());
        }
        out
    }

    /// Reads a JSON definition file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] or [`ConfigError::Parse`], or the
    /// validation error of the loaded definition.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            source: e,
        })?;
        let def: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        def.validate()?;
        Ok(def)
    }

    /// Writes the definition as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] or [`ConfigError::Save`].
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })?;
        fs::write(path, data).map_err(|e| ConfigError::Save {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }
}

/// Store size for the given shape; oversize datasource names add their
/// relocated bodies.
pub fn calculate_size(ds_count: u64, arc_count: u64, rows: u64, ds_names: &[&str]) -> u64 {
    let relocated: u64 = ds_names
        .iter()
        .map(|n| crate::primitive::string::relocation_size(n.trim().encode_utf16().count()))
        .sum();
    24 + 48 * ds_count
        + 16 * arc_count
        + 20 * ds_count * arc_count
        + 8 * ds_count * rows
        + (1 + 2 * ds_count + arc_count) * crate::primitive::STRING_BYTES
        + relocated
}

/// Whether a datasource name carries the force-zero suffix.
pub fn is_force_zero(name: &str) -> bool {
    name.ends_with(FORCE_ZERO_SUFFIX)
}

/// # Errors
///
/// Returns [`ValidationError::InvalidDsName`] for empty names, names using
/// the reserved private-use range, and names too long to relocate.
pub fn validate_ds_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| ValidationError::InvalidDsName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("name is empty").into());
    }
    if name.trim() != name {
        return Err(invalid("name has surrounding whitespace").into());
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.iter().copied().any(is_digit_unit) {
        return Err(invalid("name uses reserved characters U+E000..U+F8FF").into());
    }
    if units.len() > MAX_RELOCATED_UNITS {
        return Err(invalid("name is longer than 65535 characters").into());
    }
    Ok(())
}

/// # Errors
///
/// Returns [`ValidationError::InvalidHeartbeat`] below one second.
pub fn validate_heartbeat(heartbeat: i64) -> Result<()> {
    if heartbeat < 1 {
        return Err(ValidationError::InvalidHeartbeat { heartbeat }.into());
    }
    Ok(())
}

/// # Errors
///
/// Returns [`ValidationError::InvalidMinMax`] when both limits are known and
/// `min >= max`.
pub fn validate_min_max(min: f64, max: f64) -> Result<()> {
    if !min.is_nan() && !max.is_nan() && min >= max {
        return Err(ValidationError::InvalidMinMax { min, max }.into());
    }
    Ok(())
}

/// # Errors
///
/// Returns [`ValidationError::InvalidXff`] outside `[0, 1)`.
pub fn validate_xff(xff: f64) -> Result<()> {
    if !(0.0..1.0).contains(&xff) {
        return Err(ValidationError::InvalidXff { xff }.into());
    }
    Ok(())
}

fn validate_step(step: i64) -> Result<()> {
    if step <= 0 {
        return Err(ValidationError::InvalidStep { step }.into());
    }
    Ok(())
}

fn validate_start_time(start_time: i64) -> Result<()> {
    if start_time < 0 {
        return Err(ValidationError::InvalidStartTime { start_time }.into());
    }
    Ok(())
}

fn validate_version(version: u32) -> Result<()> {
    if !(1..=2).contains(&version) {
        return Err(ValidationError::InvalidVersion { version }.into());
    }
    Ok(())
}

fn parse_limit(token: &str) -> Option<f64> {
    if token.eq_ignore_ascii_case("U") {
        Some(f64::NAN)
    } else {
        token.parse().ok()
    }
}

fn format_limit(value: f64) -> String {
    if value.is_nan() {
        "U".to_string()
    } else {
        value.to_string()
    }
}
