//! Samples: one timestamp plus one raw value per datasource.
//!
//! A [`Sample`] is obtained from [`crate::RrdDb::create_sample`], starts with
//! every value unknown, and is applied with [`Sample::update`]. Values can
//! also be given in rrdtool's `timestamp:value:value` syntax, where `N` is
//! the current time and `U` an unknown value.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rrdb::{FactoryRegistry, RrdDb};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = FactoryRegistry::default();
//! let db = RrdDb::open("/var/lib/rrd/net.rrd", &registry)?;
//!
//! let mut sample = db.create_sample(1_700_000_300);
//! sample.set_value_by_name("in", 1024.0)?;
//! sample.update()?;
//!
//! db.create_sample(0).set_and_update("1700000600:2048:U")?;
//! # Ok(())
//! # }
//! ```

use crate::consolidate::current_time;
use crate::db::RrdDb;
use crate::error::{LookupError, Result, ValidationError};

/// Pending update of one database.
#[derive(Debug)]
pub struct Sample<'a> {
    db: &'a RrdDb,
    time: i64,
    values: Vec<f64>,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(db: &'a RrdDb, time: i64, ds_count: usize) -> Self {
        Self {
            db,
            time,
            values: vec![f64::NAN; ds_count],
        }
    }

    /// Sample time in seconds.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Moves the sample to `time`.
    pub fn set_time(&mut self, time: i64) -> &mut Self {
        self.time = time;
        self
    }

    /// Values in datasource order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Sets the value of datasource `index`.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::IndexOutOfRange`] beyond the datasource count.
    pub fn set_value(&mut self, index: usize, value: f64) -> Result<&mut Self> {
        let count = self.values.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or(LookupError::IndexOutOfRange {
                kind: "datasource",
                index,
                count,
            })?;
        *slot = value;
        Ok(self)
    }

    /// Sets the value of the named datasource.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::UnknownDatasource`] for an unknown name.
    pub fn set_value_by_name(&mut self, name: &str, value: f64) -> Result<&mut Self> {
        let index = self.db.ds_index(name)?;
        self.set_value(index, value)
    }

    /// Sets the leading values; the rest keep their current value.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ValueCount`] when more values than
    /// datasources are given.
    pub fn set_values(&mut self, values: &[f64]) -> Result<&mut Self> {
        if values.len() > self.values.len() {
            return Err(ValidationError::ValueCount {
                expected: self.values.len(),
                actual: values.len(),
            }
            .into());
        }
        self.values[..values.len()].copy_from_slice(values);
        Ok(self)
    }

    /// Reads `timestamp:value:...` into this sample.
    ///
    /// The timestamp may be `N` for now; a value may be `U` for unknown.
    /// Missing trailing values stay unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Parse`] for a malformed token and
    /// [`ValidationError::ValueCount`] for too many values.
    pub fn parse(&mut self, input: &str) -> Result<&mut Self> {
        let parse_error = |reason: String| ValidationError::Parse {
            input: input.to_string(),
            reason,
        };
        let mut tokens = input.trim().split(':');
        let time = match tokens.next() {
            Some(t) if t.eq_ignore_ascii_case("N") || t.eq_ignore_ascii_case("NOW") => {
                current_time()
            }
            Some(t) => t
                .parse::<i64>()
                .map_err(|e| parse_error(format!("bad timestamp '{t}': {e}")))?,
            None => return Err(parse_error("empty sample".to_string()).into()),
        };
        let values = tokens
            .map(|token| {
                if token.eq_ignore_ascii_case("U") {
                    Ok(f64::NAN)
                } else {
                    token
                        .parse::<f64>()
                        .map_err(|e| parse_error(format!("bad value '{token}': {e}")))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.set_values(&values)?;
        self.time = time;
        Ok(self)
    }

    /// Applies the sample, then resets every value to unknown.
    ///
    /// # Errors
    ///
    /// See [`RrdDb::update`].
    pub fn update(&mut self) -> Result<()> {
        self.db.update(self.time, &self.values)?;
        self.values.fill(f64::NAN);
        Ok(())
    }

    /// [`Sample::parse`] followed by [`Sample::update`].
    ///
    /// # Errors
    ///
    /// See both.
    pub fn set_and_update(&mut self, input: &str) -> Result<()> {
        self.parse(input)?;
        self.update()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::FactoryRegistry;
    use crate::consolidate::ConsolFun;
    use crate::db::RrdDb;
    use crate::schema::{DsType, RrdDef};

    fn db(registry: &FactoryRegistry, name: &str) -> RrdDb {
        let mut def = RrdDef::new(format!("memory:{name}"), 1_000, 60).unwrap();
        def.add_datasource_with("in", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        def.add_datasource_with("out", DsType::Gauge, 120, f64::NAN, f64::NAN)
            .unwrap();
        def.add_archive_with(ConsolFun::Last, 0.5, 1, 10).unwrap();
        RrdDb::create(&def, registry).unwrap()
    }

    #[test]
    fn test_setters() {
        let registry = FactoryRegistry::default();
        let db = db(&registry, "sample-setters");
        let mut sample = db.create_sample(1_060);
        assert!(sample.values().iter().all(|v| v.is_nan()));

        sample.set_value(1, 2.0).unwrap();
        sample.set_value_by_name("in", 1.0).unwrap();
        assert_eq!(sample.values(), &[1.0, 2.0]);
        assert!(sample.set_value(2, 0.0).is_err());
        assert!(sample.set_value_by_name("missing", 0.0).is_err());
        assert!(sample.set_values(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_parse() {
        let registry = FactoryRegistry::default();
        let db = db(&registry, "sample-parse");
        let mut sample = db.create_sample(0);

        sample.parse("1060:5:U").unwrap();
        assert_eq!(sample.time(), 1_060);
        assert_eq!(sample.values()[0], 5.0);
        assert!(sample.values()[1].is_nan());

        sample.parse("1120:7").unwrap();
        assert_eq!(sample.values()[0], 7.0);

        assert!(sample.parse("x:1").is_err());
        assert!(sample.parse("1:abc").is_err());
        assert!(sample.parse("1:1:2:3").is_err());
        assert!(db.create_sample(0).parse("N:1").unwrap().time() > 1_000_000_000);
    }

    #[test]
    fn test_update_resets_values() {
        let registry = FactoryRegistry::default();
        let db = db(&registry, "sample-update");
        let mut sample = db.create_sample(1_060);
        sample.set_values(&[1.0, 2.0]).unwrap();
        sample.update().unwrap();
        assert!(sample.values().iter().all(|v| v.is_nan()));
        assert_eq!(db.last_update_time().unwrap(), 1_060);

        sample.set_time(1_060);
        assert!(sample.update().is_err());
        db.create_sample(0).set_and_update("1120:3:4").unwrap();
        assert_eq!(db.last_datasource_values().unwrap(), vec![3.0, 4.0]);
    }
}
