//! Typed fixed-offset fields over a byte-addressable backend.
//!
//! The database file is a sequence of fields handed out by an
//! [`Allocator`] in definition order. Each field knows its offset and type;
//! the backend is passed in explicitly on every access through [`Storage`],
//! which owns it and performs the big-endian conversions.
//!
//! # Caching
//!
//! A field marked constant always caches its value. Other fields cache only
//! when the backend allows it. A cached field skips the physical write when
//! the new value is identical to the cached one, which keeps memory-mapped
//! pages clean on updates that change nothing.

use std::cell::Cell;
use std::fmt;

use crate::backend::Backend;
use crate::error::{BackendError, CorruptionError, Result};

pub mod string;

pub use string::{STRING_BYTES, STRING_LENGTH};

/// Hands out strictly increasing, non-overlapping byte ranges.
#[derive(Debug, Default, Clone)]
pub struct Allocator {
    next: u64,
}

impl Allocator {
    /// Creates an allocator starting at offset zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `size` bytes and returns their offset.
    pub fn allocate(&mut self, size: u64) -> u64 {
        let offset = self.next;
        self.next += size;
        offset
    }

    /// Total bytes handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next
    }
}

/// A backend plus typed big-endian accessors and the string relocation
/// cursor.
#[derive(Debug)]
pub struct Storage {
    backend: Box<dyn Backend>,
    caching: bool,
    /// Offset of the next relocated string's length word; lazily set.
    tail: Option<u64>,
}

impl Storage {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        let caching = backend.caching_allowed();
        Self {
            backend,
            caching,
            tail: None,
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Mutable access to the wrapped backend.
    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    /// Whether non-constant fields may cache.
    pub fn caching_allowed(&self) -> bool {
        self.caching
    }

    /// Path of the backing resource.
    pub fn path(&self) -> &str {
        self.backend.path()
    }

    fn read_array<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.backend.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Reads a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn read_u16(&self, offset: u64) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array(offset)?))
    }

    /// Reads a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn read_i32(&self, offset: u64) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array(offset)?))
    }

    /// Reads a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn read_i64(&self, offset: u64) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array(offset)?))
    }

    /// Reads a big-endian IEEE-754 double.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn read_f64(&self, offset: u64) -> Result<f64> {
        Ok(f64::from_bits(u64::from_be_bytes(self.read_array(offset)?)))
    }

    /// Reads `count` consecutive doubles in one backend access.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn read_f64s(&self, offset: u64, count: usize) -> Result<Vec<f64>> {
        let mut buf = vec![0u8; 8 * count];
        self.backend.read(offset, &mut buf)?;
        Ok(buf
            .chunks_exact(8)
            .map(|c| {
                let mut bits = [0u8; 8];
                bits.copy_from_slice(c);
                f64::from_bits(u64::from_be_bytes(bits))
            })
            .collect())
    }

    /// Writes a big-endian `i32`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn write_i32(&mut self, offset: u64, value: i32) -> Result<()> {
        self.backend.write(offset, &value.to_be_bytes())
    }

    /// Writes a big-endian `i64`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn write_i64(&mut self, offset: u64, value: i64) -> Result<()> {
        self.backend.write(offset, &value.to_be_bytes())
    }

    /// Writes a big-endian double.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn write_f64(&mut self, offset: u64, value: f64) -> Result<()> {
        self.backend.write(offset, &value.to_bits().to_be_bytes())
    }

    /// Writes consecutive doubles in one backend access.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn write_f64s(&mut self, offset: u64, values: &[f64]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 * values.len());
        for value in values {
            buf.extend_from_slice(&value.to_bits().to_be_bytes());
        }
        self.backend.write(offset, &buf)
    }

    /// Writes `value` into `count` consecutive double slots.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn fill_f64(&mut self, offset: u64, value: f64, count: usize) -> Result<()> {
        let image = value.to_bits().to_be_bytes();
        let buf: Vec<u8> = image.iter().copied().cycle().take(8 * count).collect();
        self.backend.write(offset, &buf)
    }

    fn tail(&mut self) -> Result<u64> {
        match self.tail {
            Some(tail) => Ok(tail),
            None => {
                let tail = self.backend.length()?.saturating_sub(2);
                self.tail = Some(tail);
                Ok(tail)
            }
        }
    }

    /// Reads a logical string from a fixed slot, following relocation.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::MalformedString`] when the relocation
    /// digits or body are out of range.
    pub fn read_string(&mut self, offset: u64) -> Result<String> {
        let slot: [u8; STRING_BYTES as usize] = self.read_array(offset)?;
        let malformed = |reason: String| CorruptionError::MalformedString {
            path: self.backend.path().to_string(),
            offset,
            reason,
        };

        match string::decode(&slot) {
            None => Err(malformed("relocation offset overflows".to_string()).into()),
            Some(string::Decoded::Inline(value)) => Ok(value),
            Some(string::Decoded::Relocated(length_offset)) => {
                let units = u64::from(self.read_u16(length_offset)?);
                let body_offset = length_offset.checked_sub(2 * units).ok_or_else(|| {
                    malformed(format!("body of {units} units does not fit below {length_offset}"))
                })?;
                let mut body = vec![0u8; crate::backend::to_usize(self.path(), 2 * units)?];
                self.backend.read(body_offset, &mut body)?;

                // Later relocations must go below everything already used.
                let floor = body_offset.saturating_sub(2);
                let tail = self.tail()?;
                self.tail = Some(tail.min(floor));
                Ok(string::decode_body(&body))
            }
        }
    }

    /// Writes a logical string into a fixed slot, relocating it to the tail
    /// of the store when it is longer than [`STRING_LENGTH`].
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::TooLarge`] when no tail space is left, or
    /// propagates backend write failures.
    pub fn write_string(&mut self, offset: u64, value: &str) -> Result<()> {
        let units = value.trim().encode_utf16().count();
        let needed = string::relocation_size(units);
        let mut tail = self.tail()?;
        if needed > 0 && tail < needed + offset + STRING_BYTES {
            return Err(BackendError::TooLarge {
                path: self.path().to_string(),
                length: needed,
            }
            .into());
        }

        let encoded = string::encode(value, &mut tail);
        if let Some((body_offset, bytes)) = &encoded.relocated {
            self.backend.write(*body_offset, bytes)?;
            self.tail = Some(tail);
        }
        self.backend.write(offset, &encoded.slot)
    }

    /// Closes the backend.
    ///
    /// # Errors
    ///
    /// Propagates [`Backend::close`] failures.
    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }
}

/// A fixed-size numeric value with a big-endian representation.
pub trait Scalar: Copy + fmt::Debug + Send + 'static {
    /// Encoded width in bytes.
    const SIZE: u64;

    /// Reads a value at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    fn read_from(storage: &Storage, offset: u64) -> Result<Self>;

    /// Writes the value at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    fn write_to(self, storage: &mut Storage, offset: u64) -> Result<()>;

    /// Bitwise identity, so NaN equals NaN for cache purposes.
    fn same(self, other: Self) -> bool;
}

impl Scalar for i32 {
    const SIZE: u64 = 4;

    fn read_from(storage: &Storage, offset: u64) -> Result<Self> {
        storage.read_i32(offset)
    }

    fn write_to(self, storage: &mut Storage, offset: u64) -> Result<()> {
        storage.write_i32(offset, self)
    }

    fn same(self, other: Self) -> bool {
        self == other
    }
}

impl Scalar for i64 {
    const SIZE: u64 = 8;

    fn read_from(storage: &Storage, offset: u64) -> Result<Self> {
        storage.read_i64(offset)
    }

    fn write_to(self, storage: &mut Storage, offset: u64) -> Result<()> {
        storage.write_i64(offset, self)
    }

    fn same(self, other: Self) -> bool {
        self == other
    }
}

impl Scalar for f64 {
    const SIZE: u64 = 8;

    fn read_from(storage: &Storage, offset: u64) -> Result<Self> {
        storage.read_f64(offset)
    }

    fn write_to(self, storage: &mut Storage, offset: u64) -> Result<()> {
        storage.write_f64(offset, self)
    }

    fn same(self, other: Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

/// A numeric field at a fixed offset.
#[derive(Debug)]
pub struct Field<T: Scalar> {
    offset: u64,
    cached: bool,
    cache: Cell<Option<T>>,
}

impl<T: Scalar> Field<T> {
    /// Allocates the next `T::SIZE` bytes.
    pub fn allocate(allocator: &mut Allocator, storage: &Storage, constant: bool) -> Self {
        Self {
            offset: allocator.allocate(T::SIZE),
            cached: constant || storage.caching_allowed(),
            cache: Cell::new(None),
        }
    }

    /// Byte offset of the field.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether reads may be served from the cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Returns the value, reading the backend at most once when cached.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn get(&self, storage: &Storage) -> Result<T> {
        if let Some(value) = self.cache.get() {
            return Ok(value);
        }
        let value = T::read_from(storage, self.offset)?;
        if self.cached {
            self.cache.set(Some(value));
        }
        Ok(value)
    }

    /// Stores `value`, skipping the write when the cache already holds it.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn set(&self, storage: &mut Storage, value: T) -> Result<()> {
        if let Some(current) = self.cache.get()
            && current.same(value)
        {
            return Ok(());
        }
        value.write_to(storage, self.offset)?;
        if self.cached {
            self.cache.set(Some(value));
        }
        Ok(())
    }
}

/// A fixed-width string field. Strings are definition data and always cache.
#[derive(Debug)]
pub struct StringField {
    offset: u64,
    value: String,
}

impl StringField {
    /// Allocates one string slot.
    pub fn allocate(allocator: &mut Allocator) -> Self {
        Self {
            offset: allocator.allocate(STRING_BYTES),
            value: String::new(),
        }
    }

    /// Byte offset of the slot.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the stored string into the cache.
    ///
    /// # Errors
    ///
    /// See [`Storage::read_string`].
    pub fn load(&mut self, storage: &mut Storage) -> Result<&str> {
        self.value = storage.read_string(self.offset)?;
        Ok(&self.value)
    }

    /// Cached value.
    pub fn get(&self) -> &str {
        &self.value
    }

    /// Stores a new value.
    ///
    /// # Errors
    ///
    /// See [`Storage::write_string`].
    pub fn set(&mut self, storage: &mut Storage, value: &str) -> Result<()> {
        let value = value.trim();
        if self.value == value {
            return Ok(());
        }
        storage.write_string(self.offset, value)?;
        self.value = value.to_string();
        Ok(())
    }
}

/// An enumeration persisted by name.
pub trait PersistedEnum: Copy + PartialEq + fmt::Debug + Send + 'static {
    /// Human readable kind used in corruption errors.
    const KIND: &'static str;

    /// The persisted name.
    fn name(self) -> &'static str;

    /// Parses a persisted name.
    fn from_name(name: &str) -> Option<Self>;
}

/// An enum field stored as its name in a string slot.
#[derive(Debug)]
pub struct EnumField<E: PersistedEnum> {
    slot: StringField,
    value: Option<E>,
}

impl<E: PersistedEnum> EnumField<E> {
    /// Allocates one string slot.
    pub fn allocate(allocator: &mut Allocator) -> Self {
        Self {
            slot: StringField::allocate(allocator),
            value: None,
        }
    }

    /// Reads and parses the stored name.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::UnknownEnum`] for an unrecognised name.
    pub fn load(&mut self, storage: &mut Storage) -> Result<E> {
        let name = self.slot.load(storage)?.to_string();
        let value = E::from_name(&name).ok_or_else(|| CorruptionError::UnknownEnum {
            path: storage.path().to_string(),
            offset: self.slot.offset(),
            kind: E::KIND,
            value: name,
        })?;
        self.value = Some(value);
        Ok(value)
    }

    /// Cached value, `None` before the first load or set.
    pub fn get(&self) -> Option<E> {
        self.value
    }

    /// Stores a new value.
    ///
    /// # Errors
    ///
    /// See [`Storage::write_string`].
    pub fn set(&mut self, storage: &mut Storage, value: E) -> Result<()> {
        self.slot.set(storage, value.name())?;
        self.value = Some(value);
        Ok(())
    }
}
