//! Archives and the consolidated data point (CDP) pipeline.
//!
//! An archive folds `steps` consecutive PDPs of every datasource into one CDP
//! and appends it to that datasource's ring. The fold in progress lives in an
//! [`ArcState`] per datasource.
//!
//! # Layout
//!
//! ```text
//! version 1                            version 2
//! ┌────────────────────────────┐       ┌────────────────────────────┐
//! │ cf │ xff │ steps │ rows    │       │ cf │ xff │ steps │ rows    │
//! ├────────────────────────────┤       ├────────────────────────────┤
//! │ ds0: state │ ptr │ rows×f64│       │ ptr0 .. ptrN               │
//! │ ds1: state │ ptr │ rows×f64│       │ state0 .. stateN           │
//! │ ...                        │       │ rows × N matrix, row-major │
//! └────────────────────────────┘       └────────────────────────────┘
//! ```
//!
//! # Gaps
//!
//! A sample after a long gap stands for many identical PDPs. Instead of
//! folding them one by one, the archive finishes the CDP in progress, writes
//! the whole CDPs in one ring pass and folds only the remainder. The value
//! of each whole CDP is obtained by folding `steps` copies of the PDP into a
//! fresh state, so the result is bit-identical to the one-by-one path.

use crate::consolidate::{ConsolFun, normalize};
use crate::error::{Result, ValidationError};
use crate::primitive::{Allocator, EnumField, Field, Storage};
use crate::ring::{CircularBuffer, RingLayout};
use crate::schema::{ArcDef, validate_xff};

/// Persisted fold state of one datasource in one archive.
#[derive(Debug)]
pub struct ArcState {
    accum_value: Field<f64>,
    nan_steps: Field<i64>,
}

/// Snapshot of an [`ArcState`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcStateInfo {
    /// Fold so far, NaN when nothing known was folded.
    pub accum_value: f64,
    /// Unknown PDPs folded so far.
    pub nan_steps: i64,
}

impl ArcState {
    fn allocate(allocator: &mut Allocator, storage: &Storage) -> Self {
        Self {
            accum_value: Field::allocate(allocator, storage, false),
            nan_steps: Field::allocate(allocator, storage, false),
        }
    }

    /// Reads the state.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn info(&self, storage: &Storage) -> Result<ArcStateInfo> {
        Ok(ArcStateInfo {
            accum_value: self.accum_value.get(storage)?,
            nan_steps: self.nan_steps.get(storage)?,
        })
    }

    fn set(&self, storage: &mut Storage, info: ArcStateInfo) -> Result<()> {
        self.accum_value.set(storage, info.accum_value)?;
        self.nan_steps.set(storage, info.nan_steps)
    }
}

impl ArcStateInfo {
    /// An empty fold.
    pub const FRESH: Self = Self {
        accum_value: f64::NAN,
        nan_steps: 0,
    };

    /// Folds one PDP.
    pub fn accumulate(&mut self, consol_fun: ConsolFun, value: f64) {
        if value.is_nan() {
            self.nan_steps += 1;
        } else {
            self.accum_value = consol_fun.accumulate(self.accum_value, value);
        }
    }

    /// The CDP this fold yields over `steps` PDPs under `xff`.
    #[allow(clippy::cast_precision_loss)] // steps and nan_steps are far below 2^52
    pub fn finalize(&self, consol_fun: ConsolFun, xff: f64, steps: i32) -> f64 {
        let steps = i64::from(steps);
        if self.nan_steps as f64 <= xff * steps as f64 && !self.accum_value.is_nan() {
            if consol_fun == ConsolFun::Average {
                self.accum_value / (steps - self.nan_steps) as f64
            } else {
                self.accum_value
            }
        } else {
            f64::NAN
        }
    }
}

/// Snapshot of an archive's definition, time window and fold states.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    /// Consolidation function.
    pub consol_fun: ConsolFun,
    /// X-files factor.
    pub xff: f64,
    /// PDPs per row.
    pub steps: i32,
    /// Ring capacity.
    pub rows: i32,
    /// Seconds per row.
    pub arc_step: i64,
    /// Timestamp of the oldest row.
    pub start_time: i64,
    /// Timestamp of the newest row.
    pub end_time: i64,
    /// One fold state per datasource.
    pub states: Vec<ArcStateInfo>,
}

impl ArchiveInfo {
    /// The definition part.
    pub fn def(&self) -> ArcDef {
        ArcDef {
            consol_fun: self.consol_fun,
            xff: self.xff,
            steps: self.steps,
            rows: self.rows,
        }
    }
}

/// One archive block.
#[derive(Debug)]
pub struct Archive {
    consol_fun: EnumField<ConsolFun>,
    xff: Field<f64>,
    steps: Field<i32>,
    rows: Field<i32>,
    states: Vec<ArcState>,
    robins: Vec<CircularBuffer>,
    /// Primary step of the database.
    step: i64,
}

impl Archive {
    /// Allocates and initialises an archive for a new database.
    ///
    /// `start_time` is the database's creation time; the PDPs of the current
    /// archive step that precede it count as unknown.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn create(
        allocator: &mut Allocator,
        storage: &mut Storage,
        def: &ArcDef,
        ds_count: usize,
        version: u32,
        step: i64,
        start_time: i64,
    ) -> Result<Self> {
        let mut consol_fun = EnumField::allocate(allocator);
        let xff = Field::allocate(allocator, storage, false);
        let steps = Field::allocate(allocator, storage, true);
        let rows = Field::allocate(allocator, storage, true);
        consol_fun.set(storage, def.consol_fun)?;
        xff.set(storage, def.xff)?;
        steps.set(storage, def.steps)?;
        rows.set(storage, def.rows)?;

        let row_count = usize::try_from(def.rows).unwrap_or(0);
        let (states, robins) = Self::allocate_body(allocator, storage, ds_count, row_count, version);

        let arc_step = step * i64::from(def.steps);
        let initial = ArcStateInfo {
            accum_value: f64::NAN,
            nan_steps: (normalize(start_time, step) - normalize(start_time, arc_step)) / step,
        };
        for state in &states {
            state.set(storage, initial)?;
        }
        for robin in &robins {
            robin.reset(storage, f64::NAN)?;
        }

        Ok(Self {
            consol_fun,
            xff,
            steps,
            rows,
            states,
            robins,
            step,
        })
    }

    /// Allocates and reads an existing archive.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for an unknown consolidation function or
    /// out-of-range steps/rows.
    pub fn open(
        allocator: &mut Allocator,
        storage: &mut Storage,
        ds_count: usize,
        version: u32,
        step: i64,
    ) -> Result<Self> {
        let mut consol_fun = EnumField::allocate(allocator);
        let xff = Field::allocate(allocator, storage, false);
        let steps = Field::allocate(allocator, storage, true);
        let rows = Field::allocate(allocator, storage, true);
        consol_fun.load(storage)?;

        let step_count = steps.get(storage)?;
        let row_count = rows.get(storage)?;
        if step_count < 1 || row_count < 1 {
            return Err(crate::error::CorruptionError::InvalidHeader {
                path: storage.path().to_string(),
                reason: format!("archive with {step_count} steps and {row_count} rows"),
            }
            .into());
        }
        let row_count = usize::try_from(row_count).unwrap_or(0);
        let (states, robins) = Self::allocate_body(allocator, storage, ds_count, row_count, version);

        Ok(Self {
            consol_fun,
            xff,
            steps,
            rows,
            states,
            robins,
            step,
        })
    }

    fn allocate_body(
        allocator: &mut Allocator,
        storage: &Storage,
        ds_count: usize,
        rows: usize,
        version: u32,
    ) -> (Vec<ArcState>, Vec<CircularBuffer>) {
        let mut states = Vec::with_capacity(ds_count);
        let mut robins = Vec::with_capacity(ds_count);
        if version == 1 {
            for _ in 0..ds_count {
                states.push(ArcState::allocate(allocator, storage));
                let pointer = Field::allocate(allocator, storage, false);
                let offset = allocator.allocate(8 * rows as u64);
                robins.push(CircularBuffer::new(pointer, rows, RingLayout::Array { offset }));
            }
        } else {
            let pointers: Vec<Field<i32>> = (0..ds_count)
                .map(|_| Field::allocate(allocator, storage, false))
                .collect();
            for _ in 0..ds_count {
                states.push(ArcState::allocate(allocator, storage));
            }
            let base = allocator.allocate(8 * (rows * ds_count) as u64);
            for (column, pointer) in pointers.into_iter().enumerate() {
                robins.push(CircularBuffer::new(
                    pointer,
                    rows,
                    RingLayout::Matrix {
                        base,
                        columns: ds_count,
                        column,
                    },
                ));
            }
        }
        (states, robins)
    }

    /// Consolidation function.
    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun.get().unwrap_or(ConsolFun::Average)
    }

    /// PDPs per row.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn steps(&self, storage: &Storage) -> Result<i32> {
        self.steps.get(storage)
    }

    /// Ring capacity.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn rows(&self, storage: &Storage) -> Result<i32> {
        self.rows.get(storage)
    }

    /// X-files factor.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn xff(&self, storage: &Storage) -> Result<f64> {
        self.xff.get(storage)
    }

    /// Seconds per row.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn arc_step(&self, storage: &Storage) -> Result<i64> {
        Ok(self.step * i64::from(self.steps(storage)?))
    }

    /// Timestamp of the newest row, given the database's last update time.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn end_time(&self, storage: &Storage, last_update: i64) -> Result<i64> {
        Ok(normalize(last_update, self.arc_step(storage)?))
    }

    /// Timestamp of the oldest row.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn start_time(&self, storage: &Storage, last_update: i64) -> Result<i64> {
        let end = self.end_time(storage, last_update)?;
        Ok(end - (i64::from(self.rows(storage)?) - 1) * self.arc_step(storage)?)
    }

    /// The ring of datasource `ds`.
    pub fn robin(&self, ds: usize) -> Option<&CircularBuffer> {
        self.robins.get(ds)
    }

    /// The fold state of datasource `ds`.
    pub fn state(&self, ds: usize) -> Option<&ArcState> {
        self.states.get(ds)
    }

    /// Reads the full snapshot.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn info(&self, storage: &Storage, last_update: i64) -> Result<ArchiveInfo> {
        Ok(ArchiveInfo {
            consol_fun: self.consol_fun(),
            xff: self.xff(storage)?,
            steps: self.steps(storage)?,
            rows: self.rows(storage)?,
            arc_step: self.arc_step(storage)?,
            start_time: self.start_time(storage, last_update)?,
            end_time: self.end_time(storage, last_update)?,
            states: self
                .states
                .iter()
                .map(|s| s.info(storage))
                .collect::<Result<_>>()?,
        })
    }

    /// Folds `count` identical PDPs of datasource `ds` that follow the
    /// database's previous update at `last_update`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn archive(
        &self,
        storage: &mut Storage,
        ds: usize,
        value: f64,
        count: u64,
        last_update: i64,
    ) -> Result<()> {
        let (Some(state), Some(robin)) = (self.states.get(ds), self.robins.get(ds)) else {
            return Ok(());
        };
        let consol_fun = self.consol_fun();
        let steps = self.steps(storage)?;
        let xff = self.xff(storage)?;
        let arc_step = self.arc_step(storage)?;

        let mut remaining = count;
        let mut update_time = normalize(last_update, self.step) + self.step;
        let mut fold = state.info(storage)?;

        // Finish the CDP in progress.
        while remaining > 0 {
            fold.accumulate(consol_fun, value);
            remaining -= 1;
            if update_time % arc_step == 0 {
                robin.store(storage, fold.finalize(consol_fun, xff, steps))?;
                fold = ArcStateInfo::FRESH;
                break;
            }
            update_time += self.step;
        }

        // Whole CDPs, each folded from `steps` copies of the value.
        let steps_u64 = u64::try_from(steps).unwrap_or(1);
        let whole = remaining / steps_u64;
        if whole > 0 {
            let mut bulk = ArcStateInfo::FRESH;
            for _ in 0..steps {
                bulk.accumulate(consol_fun, value);
            }
            robin.bulk_store(storage, bulk.finalize(consol_fun, xff, steps), whole)?;
        }

        for _ in 0..remaining % steps_u64 {
            fold.accumulate(consol_fun, value);
        }
        state.set(storage, fold)
    }

    /// Changes the X-files factor.
    ///
    /// # Errors
    ///
    /// Returns a validation error outside `[0, 1)`.
    pub fn set_xff(&self, storage: &mut Storage, xff: f64) -> Result<()> {
        validate_xff(xff)?;
        self.xff.set(storage, xff)
    }

    /// Clears the fold value of datasource `ds`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn reset_accum(&self, storage: &mut Storage, ds: usize) -> Result<()> {
        if let Some(state) = self.states.get(ds) {
            state.accum_value.set(storage, f64::NAN)?;
        }
        Ok(())
    }

    /// Rows of the given datasources inside `[start, end]`, normalised to the
    /// archive step. Rows outside the archive's window are NaN.
    ///
    /// Returns the timestamp axis and one column per datasource.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidFetchRange`] when the normalised
    /// window does not fit in memory or in the time axis, and propagates
    /// backend read failures.
    pub fn fetch(
        &self,
        storage: &Storage,
        start: i64,
        end: i64,
        ds_indices: &[usize],
        last_update: i64,
    ) -> Result<(Vec<i64>, Vec<Vec<f64>>)> {
        let invalid = || ValidationError::InvalidFetchRange { start, end };
        let arc_step = self.arc_step(storage)?;
        let fetch_start = normalize(start, arc_step);
        let mut fetch_end = normalize(end, arc_step);
        if fetch_end < end {
            fetch_end = fetch_end.checked_add(arc_step).ok_or_else(invalid)?;
        }
        let start_time = self.start_time(storage, last_update)?;
        let end_time = self.end_time(storage, last_update)?;

        let points = fetch_end
            .checked_sub(fetch_start)
            .and_then(|span| usize::try_from(span / arc_step + 1).ok())
            .ok_or_else(invalid)?;
        let mut timestamps = Vec::new();
        timestamps.try_reserve_exact(points).map_err(|_| invalid())?;
        timestamps.extend(
            (0..points).map(|i| fetch_start + i64::try_from(i).unwrap_or(0) * arc_step),
        );

        let match_start = fetch_start.max(start_time);
        let match_end = fetch_end.min(end_time);
        let mut columns = Vec::with_capacity(ds_indices.len());
        for &ds in ds_indices {
            let mut column = Vec::new();
            column.try_reserve_exact(points).map_err(|_| invalid())?;
            column.resize(points, f64::NAN);
            if match_start <= match_end
                && let Some(robin) = self.robins.get(ds)
            {
                let count = usize::try_from((match_end - match_start) / arc_step + 1).unwrap_or(0);
                let first = usize::try_from((match_start - start_time) / arc_step).unwrap_or(0);
                let offset = usize::try_from((match_start - fetch_start) / arc_step).unwrap_or(0);
                let values = robin.get_range(storage, first, count)?;
                column[offset..offset + count].copy_from_slice(&values);
            }
            columns.push(column);
        }
        Ok((timestamps, columns))
    }

    /// Copies fold states and rings into `target` for each `(from, to)`
    /// datasource pair. Rings are copied newest-aligned.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn copy_state_to(
        &self,
        storage: &Storage,
        target: &Self,
        target_storage: &mut Storage,
        ds_pairs: &[(usize, usize)],
    ) -> Result<()> {
        for &(from, to) in ds_pairs {
            let (Some(state), Some(robin)) = (self.states.get(from), self.robins.get(from)) else {
                continue;
            };
            let (Some(target_state), Some(target_robin)) =
                (target.states.get(to), target.robins.get(to))
            else {
                continue;
            };
            target_state.set(target_storage, state.info(storage)?)?;
            target_robin.set_values(target_storage, &robin.values(storage)?)?;
        }
        Ok(())
    }

    /// Human readable block.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn dump(&self, storage: &Storage, last_update: i64) -> Result<String> {
        let info = self.info(storage, last_update)?;
        let mut out = format!(
            "== ARCHIVE ==\n{}\ninterval [{}, {}]\n",
            info.def().dump(),
            info.start_time,
            info.end_time
        );
        for (state, robin) in info.states.iter().zip(&self.robins) {
            out.push_str(&format!(
                "accumValue:{} nanSteps:{}\n",
                state.accum_value, state.nan_steps
            ));
            let values: Vec<String> = robin
                .values(storage)?
                .iter()
                .map(|v| v.to_string())
                .collect();
            out.push_str(&format!(
                "Robin {}/{}: {}\n",
                robin.pointer(storage)?,
                robin.rows(),
                values.join(" ")
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};

    fn setup(def: &ArcDef, ds_count: usize, version: u32, step: i64, start: i64) -> (Storage, Archive) {
        let mut backend = MemoryBackend::new("archive");
        backend.set_length(4096).unwrap();
        let mut storage = Storage::new(Box::new(backend));
        let archive = Archive::create(
            &mut Allocator::new(),
            &mut storage,
            def,
            ds_count,
            version,
            step,
            start,
        )
        .unwrap();
        (storage, archive)
    }

    fn fold(values: &[f64], consol_fun: ConsolFun) -> ArcStateInfo {
        let mut state = ArcStateInfo::FRESH;
        for &v in values {
            state.accumulate(consol_fun, v);
        }
        state
    }

    #[test]
    fn test_xff_threshold() {
        let known = [8.0, 4.0];
        let mut two_unknown = fold(&known, ConsolFun::Average);
        two_unknown.nan_steps = 2;
        assert_eq!(two_unknown.finalize(ConsolFun::Average, 0.5, 4), 6.0);

        let mut three_unknown = fold(&known[..1], ConsolFun::Average);
        three_unknown.nan_steps = 3;
        assert!(three_unknown.finalize(ConsolFun::Average, 0.5, 4).is_nan());
    }

    #[test]
    fn test_consolidation_functions() {
        let values = [3.0, f64::NAN, 1.0, 5.0];
        let finalize = |cf| fold(&values, cf).finalize(cf, 0.5, 4);
        assert_eq!(finalize(ConsolFun::Average), 3.0);
        assert_eq!(finalize(ConsolFun::Min), 1.0);
        assert_eq!(finalize(ConsolFun::Max), 5.0);
        assert_eq!(finalize(ConsolFun::First), 3.0);
        assert_eq!(finalize(ConsolFun::Last), 5.0);
        assert_eq!(finalize(ConsolFun::Total), 9.0);
        assert!(fold(&[f64::NAN; 4], ConsolFun::Max)
            .finalize(ConsolFun::Max, 0.99, 4)
            .is_nan());
    }

    #[test]
    fn test_initial_nan_steps() {
        let def = ArcDef::new(ConsolFun::Average, 0.5, 4, 10).unwrap();
        // 1_200 starts a 400 s row, so no PDP of it precedes creation.
        let (storage, archive) = setup(&def, 1, 2, 100, 1_250);
        assert_eq!(archive.info(&storage, 1_250).unwrap().states[0].nan_steps, 0);

        let (storage, archive) = setup(&def, 1, 2, 100, 1_450);
        assert_eq!(archive.info(&storage, 1_450).unwrap().states[0].nan_steps, 2);
    }

    #[test]
    fn test_archive_window() {
        let def = ArcDef::new(ConsolFun::Max, 0.5, 2, 5).unwrap();
        let (storage, archive) = setup(&def, 2, 1, 60, 0);
        let info = archive.info(&storage, 1_000).unwrap();
        assert_eq!(info.arc_step, 120);
        assert_eq!(info.end_time, 960);
        assert_eq!(info.start_time, 960 - 4 * 120);
        assert_eq!(info.states.len(), 2);
    }

    #[test]
    fn test_archive_single_steps() {
        let def = ArcDef::new(ConsolFun::Average, 0.5, 1, 3).unwrap();
        let (mut storage, archive) = setup(&def, 1, 2, 300, 0);

        archive.archive(&mut storage, 0, 10.0, 1, 0).unwrap();
        archive.archive(&mut storage, 0, 20.0, 1, 300).unwrap();
        let robin = archive.robin(0).unwrap();
        let values = robin.values(&storage).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(&values[1..], &[10.0, 20.0]);
    }

    #[test]
    fn test_gap_fills_whole_rows() {
        let def = ArcDef::new(ConsolFun::Total, 0.5, 2, 4).unwrap();
        let (mut storage, archive) = setup(&def, 1, 1, 10, 0);

        // Seven PDPs from 10 to 70: rows close at 20, 40 and 60, the PDP
        // at 70 stays folded.
        archive.archive(&mut storage, 0, 1.0, 7, 0).unwrap();
        let values = archive.robin(0).unwrap().values(&storage).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(&values[1..], &[2.0, 2.0, 2.0]);
        let state = archive.info(&storage, 70).unwrap().states[0];
        assert_eq!(state.accum_value, 1.0);
        assert_eq!(state.nan_steps, 0);
    }

    #[test]
    fn test_fetch_fills_window() {
        let def = ArcDef::new(ConsolFun::Last, 0.5, 1, 3).unwrap();
        let (mut storage, archive) = setup(&def, 2, 2, 60, 0);
        for (i, v) in [1.0, 2.0, 3.0, 4.0].iter().enumerate() {
            let last = 60 * i64::try_from(i).unwrap();
            archive.archive(&mut storage, 0, *v, 1, last).unwrap();
            archive.archive(&mut storage, 1, -*v, 1, last).unwrap();
        }

        // Last update 240: rows at 120, 180, 240.
        let (timestamps, columns) = archive.fetch(&storage, 60, 300, &[1, 0], 240).unwrap();
        assert_eq!(timestamps, vec![60, 120, 180, 240, 300]);
        assert!(columns[0][0].is_nan());
        assert_eq!(&columns[0][1..4], &[-2.0, -3.0, -4.0]);
        assert!(columns[1][4].is_nan());
        assert_eq!(&columns[1][1..4], &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fetch_rejects_unbounded_window() {
        let def = ArcDef::new(ConsolFun::Last, 0.5, 1, 3).unwrap();
        let (storage, archive) = setup(&def, 1, 2, 60, 0);
        let is_invalid_range = |err: &crate::error::RrdError| {
            matches!(
                err,
                crate::error::RrdError::Validation(ValidationError::InvalidFetchRange { .. })
            )
        };

        // Rounding the end up to the next row overflows.
        let err = archive.fetch(&storage, 0, i64::MAX, &[0], 240).unwrap_err();
        assert!(is_invalid_range(&err), "{err}");

        // An aligned end overflows nothing but needs an impossible axis.
        let aligned = i64::MAX - i64::MAX % 60;
        let err = archive.fetch(&storage, 0, aligned, &[0], 240).unwrap_err();
        assert!(is_invalid_range(&err), "{err}");
    }

    #[test]
    fn test_set_xff_and_copy() {
        let def = ArcDef::new(ConsolFun::Min, 0.5, 1, 4).unwrap();
        let (mut storage, archive) = setup(&def, 1, 2, 60, 0);
        assert!(archive.set_xff(&mut storage, 1.0).is_err());
        archive.set_xff(&mut storage, 0.25).unwrap();
        assert_eq!(archive.xff(&storage).unwrap(), 0.25);

        archive.archive(&mut storage, 0, 7.0, 2, 0).unwrap();
        let small = ArcDef::new(ConsolFun::Min, 0.5, 1, 2).unwrap();
        let (mut target_storage, target) = setup(&small, 1, 1, 60, 0);
        archive
            .copy_state_to(&storage, &target, &mut target_storage, &[(0, 0)])
            .unwrap();
        assert_eq!(
            target.robin(0).unwrap().values(&target_storage).unwrap(),
            vec![7.0, 7.0]
        );
        assert!(archive.dump(&storage, 120).unwrap().contains("RRA:MIN:0.25:1:4"));
    }
}
