//! Consolidation functions and timestamp arithmetic.
//!
//! A consolidation function reduces the primary data points (PDPs) that fall
//! into one archive step into a single consolidated data point (CDP):
//!
//! ```text
//! PDP  PDP  PDP  PDP │ PDP  PDP  PDP  PDP │ ...
//! └──────┬────────┘  │ └──────┬────────┘  │
//!    ConsolFun       │    ConsolFun       │
//!        ▼           │        ▼           │
//!       CDP          │       CDP          │
//! ```
//!
//! The NaN-aware helpers in this module treat NaN as "unknown": an unknown
//! operand never wins a min/max and counts as zero in a sum.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::primitive::PersistedEnum;

/// How an archive reduces PDPs into one CDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsolFun {
    /// Mean of the known PDPs.
    Average,
    /// Smallest known PDP.
    Min,
    /// Largest known PDP.
    Max,
    /// Last known PDP.
    Last,
    /// First known PDP.
    First,
    /// Sum of the known PDPs.
    Total,
}

impl ConsolFun {
    /// All functions, in persisted-name order.
    pub const ALL: [Self; 6] = [
        Self::Average,
        Self::Min,
        Self::Max,
        Self::Last,
        Self::First,
        Self::Total,
    ];

    /// The persisted, rrdtool-compatible name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Average => "AVERAGE",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
            Self::First => "FIRST",
            Self::Total => "TOTAL",
        }
    }

    /// Whether the archive receives the per-step total rather than the last
    /// finite rate.
    pub fn uses_total(self) -> bool {
        matches!(self, Self::Average)
    }

    /// Folds one PDP into a running accumulator. NaN PDPs are the caller's
    /// business; this only combines known values.
    pub fn accumulate(self, accum: f64, value: f64) -> f64 {
        match self {
            Self::Min => min(accum, value),
            Self::Max => max(accum, value),
            Self::Average | Self::Total => sum(accum, value),
            Self::First => {
                if accum.is_nan() {
                    value
                } else {
                    accum
                }
            }
            Self::Last => value,
        }
    }

    /// Reduces a series of per-step rates, skipping unknown values.
    ///
    /// `TOTAL` weights every value by `step`, turning a rate column back
    /// into an amount. Returns NaN when no value is known.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rrdb::ConsolFun;
    ///
    /// let values = [1.0, f64::NAN, 3.0];
    /// assert_eq!(ConsolFun::Average.aggregate(&values, 60), 2.0);
    /// assert_eq!(ConsolFun::First.aggregate(&values, 60), 1.0);
    /// assert_eq!(ConsolFun::Total.aggregate(&values, 60), 240.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // step and counts are far below 2^52
    pub fn aggregate(self, values: &[f64], step: i64) -> f64 {
        let mut known = values.iter().copied().filter(|v| !v.is_nan());
        match self {
            Self::First => known.next().unwrap_or(f64::NAN),
            Self::Last => known.last().unwrap_or(f64::NAN),
            Self::Min => known.fold(f64::NAN, min),
            Self::Max => known.fold(f64::NAN, max),
            Self::Average => {
                let (total, count) = known.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if count == 0 {
                    f64::NAN
                } else {
                    total / count as f64
                }
            }
            Self::Total => {
                let (total, count) = known.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if count == 0 {
                    f64::NAN
                } else {
                    total * step as f64
                }
            }
        }
    }
}

impl fmt::Display for ConsolFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConsolFun {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(&s.trim().to_ascii_uppercase()).ok_or_else(|| ValidationError::Parse {
            input: s.to_string(),
            reason: "unknown consolidation function".to_string(),
        })
    }
}

impl PersistedEnum for ConsolFun {
    const KIND: &'static str = "consolidation function";

    fn name(self) -> &'static str {
        ConsolFun::name(self)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cf| cf.name() == name)
    }
}

/// Rounds `timestamp` down to a multiple of `step`.
///
/// Follows the truncating remainder, so negative timestamps round towards
/// zero.
pub fn normalize(timestamp: i64, step: i64) -> i64 {
    timestamp - timestamp % step
}

/// Larger of two values, treating NaN as unknown.
pub fn max(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x.max(y)
    }
}

/// Smaller of two values, treating NaN as unknown.
pub fn min(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x.min(y)
    }
}

/// Sum of two values, treating NaN as zero unless both are NaN.
pub fn sum(x: f64, y: f64) -> f64 {
    if x.is_nan() {
        y
    } else if y.is_nan() {
        x
    } else {
        x + y
    }
}

/// Current wall-clock time in whole seconds, rounded to the nearest second.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from((d.as_millis() + 500) / 1000).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for cf in ConsolFun::ALL {
            assert_eq!(cf.name().parse::<ConsolFun>().unwrap(), cf);
            assert_eq!(<ConsolFun as PersistedEnum>::from_name(cf.name()), Some(cf));
        }
        assert_eq!("average".parse::<ConsolFun>().unwrap(), ConsolFun::Average);
        assert!("MEDIAN".parse::<ConsolFun>().is_err());
        assert_eq!(<ConsolFun as PersistedEnum>::from_name("average"), None);
    }

    #[test]
    fn test_serde_uses_persisted_names() {
        let json = serde_json::to_string(&ConsolFun::Total).unwrap();
        assert_eq!(json, "\"TOTAL\"");
        let cf: ConsolFun = serde_json::from_str("\"FIRST\"").unwrap();
        assert_eq!(cf, ConsolFun::First);
    }

    #[test]
    fn test_nan_aware_helpers() {
        assert_eq!(min(f64::NAN, 2.0), 2.0);
        assert_eq!(max(3.0, f64::NAN), 3.0);
        assert_eq!(sum(f64::NAN, 4.0), 4.0);
        assert!(sum(f64::NAN, f64::NAN).is_nan());
        assert_eq!(min(1.0, 2.0), 1.0);
        assert_eq!(max(1.0, 2.0), 2.0);
    }

    #[test]
    fn test_accumulate() {
        let fold = |cf: ConsolFun, values: &[f64]| {
            values.iter().fold(f64::NAN, |acc, &v| cf.accumulate(acc, v))
        };
        let values = [3.0, 1.0, 5.0, 2.0];
        assert_eq!(fold(ConsolFun::Min, &values), 1.0);
        assert_eq!(fold(ConsolFun::Max, &values), 5.0);
        assert_eq!(fold(ConsolFun::Total, &values), 11.0);
        assert_eq!(fold(ConsolFun::First, &values), 3.0);
        assert_eq!(fold(ConsolFun::Last, &values), 2.0);
        assert!(ConsolFun::Average.uses_total());
        assert!(!ConsolFun::Max.uses_total());
    }

    #[test]
    fn test_aggregate_all_unknown() {
        let values = [f64::NAN, f64::NAN];
        for cf in ConsolFun::ALL {
            assert!(cf.aggregate(&values, 300).is_nan(), "{cf}");
        }
        assert!(ConsolFun::Average.aggregate(&[], 300).is_nan());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(1_000_000_123, 300), 999_999_900);
        assert_eq!(normalize(600, 300), 600);
        assert_eq!(normalize(599, 300), 300);
        assert_eq!(normalize(0, 60), 0);
    }

    #[test]
    fn test_current_time_is_recent() {
        assert!(current_time() > 1_600_000_000);
    }
}
