//! Datasources and the primary data point (PDP) pipeline.
//!
//! Each datasource turns raw samples into a per-second rate, integrates that
//! rate over the current primary step and, whenever a sample crosses a step
//! boundary, emits the step's PDP:
//!
//! ```text
//!  lastUpdate            boundary                      t
//!      │    step k          │  step k+1 .. k+n-1 │ k+n  │
//!  ────┼────────────────────┼────────────────────┼──────┼──▶ time
//!      └── accumulate ──────┘                           │
//!            emit total/last × n steps ─────────────────┘
//!                                      remainder accumulates
//! ```
//!
//! Unknown rates do not contribute area; they add to `nanSeconds`. A step is
//! known when its unknown seconds stay within the heartbeat.

use crate::consolidate::normalize;
use crate::error::Result;
use crate::primitive::{Allocator, EnumField, Field, Storage, StringField};
use crate::schema::{DsDef, DsType, is_force_zero, validate_heartbeat, validate_min_max};

/// 2^32, the wrap of a 32-bit counter.
const MAX_32_BIT: f64 = 4_294_967_296.0;

/// 2^64, the wrap of a 64-bit counter.
const MAX_64_BIT: f64 = 18_446_744_073_709_551_616.0;

/// Result of a sample that completed one or more primary steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrimaryPoints {
    /// Average rate of the completed step, for averaging archives.
    pub total: f64,
    /// Last known rate of the completed step, for the other archives.
    pub last: f64,
    /// Number of primary steps the value stands for.
    pub steps: u64,
}

/// Snapshot of a datasource's definition and PDP state.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasourceInfo {
    /// Name.
    pub name: String,
    /// Rate computation.
    pub ds_type: DsType,
    /// Heartbeat in seconds.
    pub heartbeat: i64,
    /// Lower bound, NaN when unbounded.
    pub min: f64,
    /// Upper bound, NaN when unbounded.
    pub max: f64,
    /// Last raw value received.
    pub last_value: f64,
    /// Integrated rate of the current step.
    pub accum_value: f64,
    /// Unknown seconds of the current step.
    pub nan_seconds: i64,
}

impl DatasourceInfo {
    /// The definition part.
    pub fn def(&self) -> DsDef {
        DsDef {
            name: self.name.clone(),
            ds_type: self.ds_type,
            heartbeat: self.heartbeat,
            min: self.min,
            max: self.max,
        }
    }
}

/// One datasource block.
#[derive(Debug)]
pub struct Datasource {
    name: StringField,
    ds_type: EnumField<DsType>,
    heartbeat: Field<i64>,
    min: Field<f64>,
    max: Field<f64>,
    last_value: Field<f64>,
    accum_value: Field<f64>,
    nan_seconds: Field<i64>,
    /// Last finite rate seen in the current step; not persisted.
    accum_last: f64,
}

impl Datasource {
    fn allocate(allocator: &mut Allocator, storage: &Storage) -> Self {
        Self {
            name: StringField::allocate(allocator),
            ds_type: EnumField::allocate(allocator),
            heartbeat: Field::allocate(allocator, storage, false),
            min: Field::allocate(allocator, storage, false),
            max: Field::allocate(allocator, storage, false),
            last_value: Field::allocate(allocator, storage, false),
            accum_value: Field::allocate(allocator, storage, false),
            nan_seconds: Field::allocate(allocator, storage, false),
            accum_last: f64::NAN,
        }
    }

    /// Allocates and initialises a datasource for a new database.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn create(
        allocator: &mut Allocator,
        storage: &mut Storage,
        def: &DsDef,
        start_time: i64,
        step: i64,
    ) -> Result<Self> {
        let mut ds = Self::allocate(allocator, storage);
        ds.name.set(storage, &def.name)?;
        ds.ds_type.set(storage, def.ds_type)?;
        ds.heartbeat.set(storage, def.heartbeat)?;
        ds.min.set(storage, def.min)?;
        ds.max.set(storage, def.max)?;
        ds.last_value.set(storage, f64::NAN)?;
        ds.accum_value.set(storage, 0.0)?;
        ds.nan_seconds.set(storage, start_time % step)?;
        Ok(ds)
    }

    /// Allocates and reads an existing datasource.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for an unknown datasource type.
    pub fn open(allocator: &mut Allocator, storage: &mut Storage) -> Result<Self> {
        let mut ds = Self::allocate(allocator, storage);
        ds.name.load(storage)?;
        ds.ds_type.load(storage)?;
        Ok(ds)
    }

    /// Name.
    pub fn name(&self) -> &str {
        self.name.get()
    }

    /// Rate computation.
    pub fn ds_type(&self) -> DsType {
        self.ds_type.get().unwrap_or(DsType::Gauge)
    }

    /// Reads the full snapshot.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn info(&self, storage: &Storage) -> Result<DatasourceInfo> {
        Ok(DatasourceInfo {
            name: self.name().to_string(),
            ds_type: self.ds_type(),
            heartbeat: self.heartbeat.get(storage)?,
            min: self.min.get(storage)?,
            max: self.max.get(storage)?,
            last_value: self.last_value.get(storage)?,
            accum_value: self.accum_value.get(storage)?,
            nan_seconds: self.nan_seconds.get(storage)?,
        })
    }

    /// Last raw value.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn last_value(&self, storage: &Storage) -> Result<f64> {
        self.last_value.get(storage)
    }

    /// Feeds one sample taken at `new_time`; the previous sample was at
    /// `old_time`.
    ///
    /// Returns the PDPs completed by this sample, if any, which the caller
    /// must push into every archive.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn process(
        &mut self,
        storage: &mut Storage,
        step: i64,
        old_time: i64,
        new_time: i64,
        new_value: f64,
    ) -> Result<Option<PrimaryPoints>> {
        let start_time = normalize(old_time, step);
        let end_time = start_time + step;
        let rate = self.rate(storage, old_time, new_time, new_value)?;

        if new_time < end_time {
            self.accumulate(storage, old_time, new_time, rate)?;
            return Ok(None);
        }

        let boundary = normalize(new_time, step);
        self.accumulate(storage, old_time, boundary, rate)?;
        let (total, last) = self.totals(storage, start_time, boundary)?;
        let steps = u64::try_from((boundary - end_time) / step + 1).unwrap_or(1);

        self.nan_seconds.set(storage, 0)?;
        self.accum_value.set(storage, 0.0)?;
        self.accum_last = f64::NAN;
        self.accumulate(storage, boundary, new_time, rate)?;

        Ok(Some(PrimaryPoints { total, last, steps }))
    }

    #[allow(clippy::cast_precision_loss)] // elapsed seconds are far below 2^52
    fn rate(&self, storage: &mut Storage, old_time: i64, new_time: i64, new_value: f64) -> Result<f64> {
        let elapsed = new_time - old_time;
        let mut rate = f64::NAN;
        if elapsed <= self.heartbeat.get(storage)? {
            let old_value = self.last_value.get(storage)?;
            let seconds = elapsed as f64;
            rate = match self.ds_type() {
                DsType::Gauge => new_value,
                DsType::Counter => {
                    let mut diff = new_value - old_value;
                    if diff < 0.0 {
                        diff += MAX_32_BIT;
                    }
                    if diff < 0.0 {
                        diff += MAX_64_BIT - MAX_32_BIT;
                    }
                    if diff >= 0.0 { diff / seconds } else { f64::NAN }
                }
                DsType::Derive => (new_value - old_value) / seconds,
                DsType::Absolute => new_value / seconds,
            };

            if !rate.is_nan() {
                let min = self.min.get(storage)?;
                let max = self.max.get(storage)?;
                if (!min.is_nan() && rate < min) || (!max.is_nan() && rate > max) {
                    rate = f64::NAN;
                }
            }
        }
        self.last_value.set(storage, new_value)?;
        Ok(rate)
    }

    #[allow(clippy::cast_precision_loss)] // elapsed seconds are far below 2^52
    fn accumulate(&mut self, storage: &mut Storage, from: i64, to: i64, rate: f64) -> Result<()> {
        if rate.is_nan() {
            let unknown = self.nan_seconds.get(storage)?;
            self.nan_seconds.set(storage, unknown + (to - from))?;
        } else {
            let area = self.accum_value.get(storage)?;
            self.accum_value
                .set(storage, area + rate * (to - from) as f64)?;
            self.accum_last = rate;
        }
        Ok(())
    }

    /// Average and last rate of the step `[start, boundary)`.
    #[allow(clippy::cast_precision_loss)] // valid seconds are far below 2^52
    fn totals(&self, storage: &Storage, start: i64, boundary: i64) -> Result<(f64, f64)> {
        let unknown = self.nan_seconds.get(storage)?;
        let valid = boundary - start - unknown;
        let (mut total, mut last) = (f64::NAN, f64::NAN);
        if unknown <= self.heartbeat.get(storage)? && valid > 0 {
            total = self.accum_value.get(storage)? / valid as f64;
            // No finite rate this session: the step was integrated before a
            // reopen, so the average is the best known value.
            last = if self.accum_last.is_nan() { total } else { self.accum_last };
        }
        if is_force_zero(self.name()) {
            if total.is_nan() {
                total = 0.0;
            }
            if last.is_nan() {
                last = 0.0;
            }
        }
        Ok((total, last))
    }

    /// Changes the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns a validation error below one second.
    pub fn set_heartbeat(&self, storage: &mut Storage, heartbeat: i64) -> Result<()> {
        validate_heartbeat(heartbeat)?;
        self.heartbeat.set(storage, heartbeat)
    }

    /// Changes both bounds.
    ///
    /// # Errors
    ///
    /// Returns a validation error when both are known and `min >= max`.
    pub fn set_min_max(&self, storage: &mut Storage, min: f64, max: f64) -> Result<()> {
        validate_min_max(min, max)?;
        self.min.set(storage, min)?;
        self.max.set(storage, max)
    }

    /// Renames the datasource. Uniqueness is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unusable name.
    pub fn set_name(&mut self, storage: &mut Storage, name: &str) -> Result<()> {
        crate::schema::validate_ds_name(name)?;
        self.name.set(storage, name)
    }

    /// Changes the type and resets the PDP state.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn set_ds_type(&mut self, storage: &mut Storage, ds_type: DsType) -> Result<()> {
        self.ds_type.set(storage, ds_type)?;
        self.last_value.set(storage, f64::NAN)?;
        self.accum_value.set(storage, 0.0)?;
        self.accum_last = f64::NAN;
        Ok(())
    }

    /// Copies the PDP state into `target`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn copy_state_to(
        &self,
        storage: &Storage,
        target: &mut Self,
        target_storage: &mut Storage,
    ) -> Result<()> {
        target
            .last_value
            .set(target_storage, self.last_value.get(storage)?)?;
        target
            .nan_seconds
            .set(target_storage, self.nan_seconds.get(storage)?)?;
        target
            .accum_value
            .set(target_storage, self.accum_value.get(storage)?)?;
        target.accum_last = self.accum_last;
        Ok(())
    }

    /// Human readable block.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn dump(&self, storage: &Storage) -> Result<String> {
        let info = self.info(storage)?;
        Ok(format!(
            "== DATASOURCE ==\n{}\nlastValue:{} nanSeconds:{} accumValue:{}\n",
            info.def().dump(),
            info.last_value,
            info.nan_seconds,
            info.accum_value
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};

    fn setup(def: &DsDef, start: i64, step: i64) -> (Storage, Datasource) {
        let mut backend = MemoryBackend::new("ds");
        backend.set_length(512).unwrap();
        let mut storage = Storage::new(Box::new(backend));
        let ds = Datasource::create(&mut Allocator::new(), &mut storage, def, start, step).unwrap();
        (storage, ds)
    }

    #[test]
    fn test_counter_wrap_32_bit() {
        let def = DsDef::new("bytes", DsType::Counter, 600, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 1);

        assert!(ds.process(&mut storage, 1, 0, 1, 4_294_967_290.0).unwrap().is_some());
        let points = ds.process(&mut storage, 1, 1, 2, 10.0).unwrap().unwrap();
        assert_eq!(points.total, 16.0);
        assert_eq!(points.last, 16.0);
        assert_eq!(points.steps, 1);
    }

    #[test]
    fn test_gauge_average_over_step() {
        let def = DsDef::new("temp", DsType::Gauge, 600, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 1_000, 300);
        assert_eq!(ds.info(&storage).unwrap().nan_seconds, 100);

        // 100 s unknown since creation, then 100 s at 10 and 100 s at 20.
        assert!(ds.process(&mut storage, 300, 1_000, 1_100, 10.0).unwrap().is_none());
        let points = ds.process(&mut storage, 300, 1_100, 1_200, 20.0).unwrap().unwrap();
        assert_eq!(points.total, 15.0);
        assert_eq!(points.last, 20.0);
        assert_eq!(points.steps, 1);
    }

    #[test]
    fn test_gap_spans_several_steps() {
        let def = DsDef::new("temp", DsType::Gauge, 1_000, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 600, 100);

        let points = ds.process(&mut storage, 100, 600, 950, 4.0).unwrap().unwrap();
        assert_eq!(points.steps, 3);
        assert_eq!(points.total, 4.0);
        let info = ds.info(&storage).unwrap();
        assert_eq!(info.accum_value, 200.0);
        assert_eq!(info.nan_seconds, 0);
    }

    #[test]
    fn test_heartbeat_and_bounds_make_unknown() {
        let def = DsDef::new("load", DsType::Gauge, 100, 0.0, 100.0).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 60);

        let points = ds.process(&mut storage, 60, 0, 200, 5.0).unwrap().unwrap();
        assert!(points.total.is_nan(), "gap beyond heartbeat");
        assert_eq!(points.steps, 3);

        ds.process(&mut storage, 60, 200, 240, 50.0).unwrap();
        let points = ds.process(&mut storage, 60, 240, 300, 500.0).unwrap().unwrap();
        assert!(points.total.is_nan(), "rate above max");
        assert_eq!(ds.last_value(&storage).unwrap(), 500.0);
    }

    #[test]
    fn test_force_zero_suffix() {
        let def = DsDef::new("errors!", DsType::Gauge, 10, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 60);
        let points = ds.process(&mut storage, 60, 0, 60, f64::NAN).unwrap().unwrap();
        assert_eq!(points.total, 0.0);
        assert_eq!(points.last, 0.0);
    }

    #[test]
    fn test_derive_and_absolute() {
        let def = DsDef::new("d", DsType::Derive, 600, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 10);
        ds.process(&mut storage, 10, 0, 10, 100.0).unwrap();
        let points = ds.process(&mut storage, 10, 10, 20, 50.0).unwrap().unwrap();
        assert_eq!(points.total, -5.0);

        let def = DsDef::new("a", DsType::Absolute, 600, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 10);
        let points = ds.process(&mut storage, 10, 0, 10, 100.0).unwrap().unwrap();
        assert_eq!(points.total, 10.0);
    }

    #[test]
    fn test_set_type_resets_state() {
        let def = DsDef::new("x", DsType::Gauge, 600, f64::NAN, f64::NAN).unwrap();
        let (mut storage, mut ds) = setup(&def, 0, 300);
        ds.process(&mut storage, 300, 0, 100, 3.0).unwrap();
        assert_eq!(ds.info(&storage).unwrap().accum_value, 300.0);

        ds.set_ds_type(&mut storage, DsType::Counter).unwrap();
        let info = ds.info(&storage).unwrap();
        assert_eq!(info.ds_type, DsType::Counter);
        assert!(info.last_value.is_nan());
        assert_eq!(info.accum_value, 0.0);

        assert!(ds.set_heartbeat(&mut storage, 0).is_err());
        assert!(ds.set_min_max(&mut storage, 10.0, 1.0).is_err());
        ds.set_min_max(&mut storage, 0.0, f64::NAN).unwrap();
        assert_eq!(ds.info(&storage).unwrap().min, 0.0);
    }

    #[test]
    fn test_reopen_reads_name_and_type() {
        let def = DsDef::new("a_rather_long_datasource_name", DsType::Absolute, 60, f64::NAN, 9.0)
            .unwrap();
        let (mut storage, _) = setup(&def, 0, 60);
        let ds = Datasource::open(&mut Allocator::new(), &mut storage).unwrap();
        assert_eq!(ds.name(), "a_rather_long_datasource_name");
        assert_eq!(ds.info(&storage).unwrap().def(), def);
        assert!(ds.dump(&storage).unwrap().starts_with("== DATASOURCE =="));
    }
}
