//! The header block at offset zero.
//!
//! ```text
//! ┌───────────────────────┬──────────┬────────────┬─────────────┬──────────────┐
//! │ signature (str, 40 B) │ step i64 │ dsCount i32│ arcCount i32│ lastUpdate i64│
//! └───────────────────────┴──────────┴────────────┴─────────────┴──────────────┘
//! ```
//!
//! The signature doubles as the layout version marker.

use crate::error::{CorruptionError, Result};
use crate::primitive::{Allocator, Field, Storage, StringField};
use crate::schema::RrdDef;

/// Signature of layout version 1.
pub const SIGNATURE_V1: &str = "RRD4J, version 0.1";

/// Signature of layout version 2.
pub const SIGNATURE_V2: &str = "RRD4J, version 0.2";

/// Legacy signature read as layout version 1.
pub const SIGNATURE_LEGACY: &str = "JRobin, version 0.1";

/// Maps a signature to its layout version.
pub fn version_of(signature: &str) -> Option<u32> {
    match signature {
        SIGNATURE_V1 | SIGNATURE_LEGACY => Some(1),
        SIGNATURE_V2 => Some(2),
        _ => None,
    }
}

fn signature_of(version: u32) -> &'static str {
    if version == 1 { SIGNATURE_V1 } else { SIGNATURE_V2 }
}

/// Smallest store holding the given counts with single-row archives and
/// short names.
fn minimum_size(ds_count: u32, arc_count: u32) -> u128 {
    let ds = u128::from(ds_count);
    let arcs = u128::from(arc_count);
    let string = u128::from(crate::primitive::STRING_BYTES);
    24 + (48 + 2 * string) * ds + (16 + string) * arcs + 28 * ds * arcs + string
}

/// Database-wide metadata.
#[derive(Debug)]
pub struct Header {
    signature: StringField,
    step: Field<i64>,
    ds_count: Field<i32>,
    arc_count: Field<i32>,
    last_update_time: Field<i64>,
    version: u32,
}

impl Header {
    fn allocate(allocator: &mut Allocator, storage: &Storage) -> Self {
        Self {
            signature: StringField::allocate(allocator),
            step: Field::allocate(allocator, storage, true),
            ds_count: Field::allocate(allocator, storage, true),
            arc_count: Field::allocate(allocator, storage, true),
            last_update_time: Field::allocate(allocator, storage, false),
            version: 0,
        }
    }

    /// Allocates and writes a fresh header.
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub fn create(allocator: &mut Allocator, storage: &mut Storage, def: &RrdDef) -> Result<Self> {
        let mut header = Self::allocate(allocator, storage);
        header.version = def.version;
        header
            .signature
            .set(storage, signature_of(def.version))?;
        header.step.set(storage, def.step)?;
        header.ds_count.set(storage, count_i32(def.ds_count()))?;
        header.arc_count.set(storage, count_i32(def.arc_count()))?;
        header.last_update_time.set(storage, def.start_time)?;
        Ok(header)
    }

    /// Allocates and reads an existing header.
    ///
    /// With `validate` set, an unknown signature is rejected; otherwise it is
    /// read as the current layout.
    ///
    /// # Errors
    ///
    /// Returns [`CorruptionError::InvalidSignature`] for a foreign store and
    /// [`CorruptionError::InvalidHeader`] for out-of-range counts or step.
    pub fn open(allocator: &mut Allocator, storage: &mut Storage, validate: bool) -> Result<Self> {
        let mut header = Self::allocate(allocator, storage);
        let signature = header.signature.load(storage)?.to_string();
        header.version = match version_of(&signature) {
            Some(version) => version,
            None if validate => {
                return Err(CorruptionError::InvalidSignature {
                    path: storage.path().to_string(),
                    found: signature,
                }
                .into());
            }
            None => 2,
        };

        let invalid = |reason: String| CorruptionError::InvalidHeader {
            path: storage.path().to_string(),
            reason,
        };
        let step = header.step.get(storage)?;
        if step <= 0 {
            return Err(invalid(format!("step {step} is not positive")).into());
        }
        let ds_count = header.ds_count.get(storage)?;
        let arc_count = header.arc_count.get(storage)?;
        if ds_count <= 0 || arc_count <= 0 {
            return Err(invalid(format!(
                "datasource count {ds_count} and archive count {arc_count} must be positive"
            ))
            .into());
        }
        let length = storage.backend().length()?;
        let needed = minimum_size(ds_count.unsigned_abs(), arc_count.unsigned_abs());
        if needed > u128::from(length) {
            return Err(invalid(format!(
                "{ds_count} datasources and {arc_count} archives need at least {needed} bytes, store has {length}"
            ))
            .into());
        }
        Ok(header)
    }

    /// The raw signature string.
    pub fn signature(&self) -> &str {
        self.signature.get()
    }

    /// Layout version (1 or 2).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Primary step in seconds.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn step(&self, storage: &Storage) -> Result<i64> {
        self.step.get(storage)
    }

    /// Number of datasources.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn ds_count(&self, storage: &Storage) -> Result<usize> {
        Ok(usize::try_from(self.ds_count.get(storage)?).unwrap_or(0))
    }

    /// Number of archives.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn arc_count(&self, storage: &Storage) -> Result<usize> {
        Ok(usize::try_from(self.arc_count.get(storage)?).unwrap_or(0))
    }

    /// Time of the last accepted sample.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn last_update_time(&self, storage: &Storage) -> Result<i64> {
        self.last_update_time.get(storage)
    }

    pub(crate) fn set_last_update_time(&self, storage: &mut Storage, time: i64) -> Result<()> {
        self.last_update_time.set(storage, time)
    }

    /// Human readable summary.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub fn dump(&self, storage: &Storage) -> Result<String> {
        Ok(format!(
            "== HEADER ==\nsignature:{} lastUpdateTime:{} step:{} dsCount:{} arcCount:{}\n",
            self.signature(),
            self.last_update_time(storage)?,
            self.step(storage)?,
            self.ds_count(storage)?,
            self.arc_count(storage)?
        ))
    }
}

fn count_i32(count: usize) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::consolidate::ConsolFun;
    use crate::schema::DsType;

    fn def(version: u32) -> RrdDef {
        let mut def = RrdDef::new("memory:header", 1_000, 60).unwrap();
        def.set_version(version).unwrap();
        def.add_datasource_with("a", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        def.add_archive_with(ConsolFun::Average, 0.5, 1, 10).unwrap();
        def
    }

    fn storage() -> Storage {
        let mut backend = MemoryBackend::new("header");
        backend.set_length(512).unwrap();
        Storage::new(Box::new(backend))
    }

    #[test]
    fn test_create_then_open() {
        let mut storage = storage();
        let header = Header::create(&mut Allocator::new(), &mut storage, &def(1)).unwrap();
        assert_eq!(header.version(), 1);
        header.set_last_update_time(&mut storage, 1_060).unwrap();

        let mut allocator = Allocator::new();
        let header = Header::open(&mut allocator, &mut storage, true).unwrap();
        assert_eq!(allocator.allocated(), 40 + 8 + 4 + 4 + 8);
        assert_eq!(header.signature(), SIGNATURE_V1);
        assert_eq!(header.step(&storage).unwrap(), 60);
        assert_eq!(header.ds_count(&storage).unwrap(), 1);
        assert_eq!(header.arc_count(&storage).unwrap(), 1);
        assert_eq!(header.last_update_time(&storage).unwrap(), 1_060);
        assert!(header.dump(&storage).unwrap().contains("step:60"));
    }

    #[test]
    fn test_signature_versions() {
        assert_eq!(version_of(SIGNATURE_V1), Some(1));
        assert_eq!(version_of(SIGNATURE_V2), Some(2));
        assert_eq!(version_of(SIGNATURE_LEGACY), Some(1));
        assert_eq!(version_of("RRD4J, version 0.3"), None);
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let mut storage = storage();
        storage.write_string(0, "NOT A DATABASE").unwrap();
        let err = Header::open(&mut Allocator::new(), &mut storage, true).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RrdError::Corruption(CorruptionError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_zero_counts_rejected() {
        let mut storage = storage();
        Header::create(&mut Allocator::new(), &mut storage, &def(2)).unwrap();
        storage.write_i32(48, 0).unwrap();
        let err = Header::open(&mut Allocator::new(), &mut storage, true).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_counts_beyond_store_rejected() {
        let mut storage = storage();
        Header::create(&mut Allocator::new(), &mut storage, &def(2)).unwrap();
        storage.write_i32(48, i32::MAX).unwrap();
        let err = Header::open(&mut Allocator::new(), &mut storage, true).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RrdError::Corruption(CorruptionError::InvalidHeader { .. })
        ));

        storage.write_i32(48, 1).unwrap();
        storage.write_i32(52, i32::MAX).unwrap();
        assert!(Header::open(&mut Allocator::new(), &mut storage, true).is_err());
    }
}
