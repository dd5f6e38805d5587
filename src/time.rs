//! Timestamps with femtosecond resolution.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// A trigger instant: whole seconds plus a femtosecond fraction in `0..FS_PER_SECOND`.
///
/// Ordering is chronological, so a `TimePoint` can key ordered collections directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimePoint {
    secs: i64,
    fs: i64,
}

impl TimePoint {
    pub fn new(secs: i64, fs: i64) -> TimePoint {
        TimePoint {
            secs: secs + fs.div_euclid(FS_PER_SECOND),
            fs: fs.rem_euclid(FS_PER_SECOND),
        }
    }

    pub fn from_femtos(total: i128) -> TimePoint {
        let per_second = FS_PER_SECOND as i128;
        TimePoint {
            secs: total.div_euclid(per_second) as i64,
            fs: total.rem_euclid(per_second) as i64,
        }
    }

    pub fn secs(self) -> i64 {
        self.secs
    }

    pub fn femtos(self) -> i64 {
        self.fs
    }

    pub fn as_femtos(self) -> i128 {
        self.secs as i128 * FS_PER_SECOND as i128 + self.fs as i128
    }

    pub fn offset_by(self, fs: i64) -> TimePoint {
        TimePoint::from_femtos(self.as_femtos() + fs as i128)
    }

    /// Signed distance from `earlier` to `self`, saturated to the `i64` range (about ±2.5 hours).
    pub fn femtos_since(self, earlier: TimePoint) -> i64 {
        let delta = self.as_femtos() - earlier.as_femtos();
        delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:015}", self.secs, self.fs)
    }
}
