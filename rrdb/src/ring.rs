//! Circular buffers of consolidated values.
//!
//! Every archive keeps one ring of `rows` doubles per datasource. The ring's
//! write pointer `p` is the physical index of the oldest slot, so logical
//! index 0 maps to `p` and the newest value sits just before it:
//!
//! ```text
//!            p
//!            ▼
//! ┌────┬────┬────┬────┬────┐
//! │ v3 │ v4 │ v0 │ v1 │ v2 │     get(0) = v0, get(4) = v4
//! └────┴────┴────┴────┴────┘
//! ```
//!
//! # Layouts
//!
//! - [`RingLayout::Array`]: the ring's rows are contiguous.
//! - [`RingLayout::Matrix`]: all rings of an archive share one row-major
//!   `rows × columns` matrix; ring `c` owns column `c`, so row `r` of ring `c`
//!   lives at `base + 8·(r·columns + c)`. One pointer per ring is still kept.

use crate::error::Result;
use crate::primitive::{Field, Storage};

/// Physical placement of a ring's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingLayout {
    /// Contiguous slots starting at `offset`.
    Array {
        /// Offset of slot 0.
        offset: u64,
    },
    /// One column of a shared row-major matrix.
    Matrix {
        /// Offset of the matrix.
        base: u64,
        /// Number of columns (datasources).
        columns: usize,
        /// This ring's column.
        column: usize,
    },
}

/// Fixed-capacity ring with a persisted write pointer.
#[derive(Debug)]
pub struct CircularBuffer {
    pointer: Field<i32>,
    rows: usize,
    layout: RingLayout,
}

impl CircularBuffer {
    /// Wraps an allocated pointer field and slot region.
    pub fn new(pointer: Field<i32>, rows: usize, layout: RingLayout) -> Self {
        Self {
            pointer,
            rows,
            layout,
        }
    }

    /// Capacity.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Physical layout.
    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    fn slot_offset(&self, physical: usize) -> u64 {
        match self.layout {
            RingLayout::Array { offset } => offset + 8 * physical as u64,
            RingLayout::Matrix {
                base,
                columns,
                column,
            } => base + 8 * (physical * columns + column) as u64,
        }
    }

    /// Physical index of the oldest slot.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn pointer(&self, storage: &Storage) -> Result<usize> {
        let raw = self.pointer.get(storage)?;
        Ok(usize::try_from(raw).unwrap_or(0) % self.rows.max(1))
    }

    fn set_pointer(&self, storage: &mut Storage, pointer: usize) -> Result<()> {
        let pointer = i32::try_from(pointer % self.rows).unwrap_or(0);
        self.pointer.set(storage, pointer)
    }

    /// Resets the pointer and fills every slot with `value`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn reset(&self, storage: &mut Storage, value: f64) -> Result<()> {
        self.set_pointer(storage, 0)?;
        self.fill_from(storage, 0, self.rows, value)
    }

    /// Appends one value, overwriting the oldest.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn store(&self, storage: &mut Storage, value: f64) -> Result<()> {
        let pointer = self.pointer(storage)?;
        storage.write_f64(self.slot_offset(pointer), value)?;
        self.set_pointer(storage, pointer + 1)
    }

    /// Appends `count` copies of `value`, exactly as `count` calls to
    /// [`CircularBuffer::store`] would, but writing each slot at most once.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn bulk_store(&self, storage: &mut Storage, value: f64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let pointer = self.pointer(storage)?;
        let rows = self.rows as u64;
        let filled = usize::try_from(count.min(rows)).unwrap_or(self.rows);
        self.fill_from(storage, pointer, filled, value)?;
        let advance = usize::try_from(count % rows).unwrap_or(0);
        self.set_pointer(storage, pointer + advance)
    }

    /// Writes `count` slots starting at physical index `start`, wrapping.
    fn fill_from(&self, storage: &mut Storage, start: usize, count: usize, value: f64) -> Result<()> {
        match self.layout {
            RingLayout::Array { offset } => {
                let head = count.min(self.rows - start);
                storage.fill_f64(offset + 8 * start as u64, value, head)?;
                if count > head {
                    storage.fill_f64(offset, value, count - head)?;
                }
            }
            RingLayout::Matrix { .. } => {
                for i in 0..count {
                    storage.write_f64(self.slot_offset((start + i) % self.rows), value)?;
                }
            }
        }
        Ok(())
    }

    /// Value at logical index `index` (0 = oldest).
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn get(&self, storage: &Storage, index: usize) -> Result<f64> {
        let pointer = self.pointer(storage)?;
        storage.read_f64(self.slot_offset((pointer + index) % self.rows))
    }

    /// Overwrites the value at logical index `index`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn set(&self, storage: &mut Storage, index: usize, value: f64) -> Result<()> {
        let pointer = self.pointer(storage)?;
        storage.write_f64(self.slot_offset((pointer + index) % self.rows), value)
    }

    /// Values at logical indices `start..start + count`.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn get_range(&self, storage: &Storage, start: usize, count: usize) -> Result<Vec<f64>> {
        let pointer = self.pointer(storage)?;
        let first = (pointer + start) % self.rows;
        match self.layout {
            RingLayout::Array { offset } => {
                let head = count.min(self.rows - first);
                let mut values = storage.read_f64s(offset + 8 * first as u64, head)?;
                if count > head {
                    values.extend(storage.read_f64s(offset, count - head)?);
                }
                Ok(values)
            }
            RingLayout::Matrix { .. } => (0..count)
                .map(|i| storage.read_f64(self.slot_offset((first + i) % self.rows)))
                .collect(),
        }
    }

    /// All values, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn values(&self, storage: &Storage) -> Result<Vec<f64>> {
        self.get_range(storage, 0, self.rows)
    }

    /// Replaces the whole ring, oldest first, and resets the pointer.
    ///
    /// Shorter input keeps its values newest-aligned; missing leading slots
    /// become NaN. Longer input keeps only its newest `rows` values.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn set_values(&self, storage: &mut Storage, values: &[f64]) -> Result<()> {
        let mut aligned = vec![f64::NAN; self.rows];
        let take = values.len().min(self.rows);
        aligned[self.rows - take..].copy_from_slice(&values[values.len() - take..]);
        self.set_pointer(storage, 0)?;
        match self.layout {
            RingLayout::Array { offset } => storage.write_f64s(offset, &aligned),
            RingLayout::Matrix { .. } => {
                for (i, value) in aligned.iter().enumerate() {
                    storage.write_f64(self.slot_offset(i), *value)?;
                }
                Ok(())
            }
        }
    }

    /// Replaces finite values outside finite `min`/`max` bounds with NaN.
    /// NaN bounds are open. The pointer is untouched.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub fn filter_values(&self, storage: &mut Storage, min: f64, max: f64) -> Result<()> {
        for physical in 0..self.rows {
            let offset = self.slot_offset(physical);
            let value = storage.read_f64(offset)?;
            let below = !min.is_nan() && value < min;
            let above = !max.is_nan() && value > max;
            if !value.is_nan() && (below || above) {
                storage.write_f64(offset, f64::NAN)?;
            }
        }
        Ok(())
    }
}
