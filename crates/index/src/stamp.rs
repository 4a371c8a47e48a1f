//! Logical timestamps used to reconcile updates to the same key.
//!
//! A [`LogicStamp`] is the pair `(seg_time, seg_key_no)`: the wall-clock
//! second at which the record's segment was opened, and the record's ordinal
//! within that segment. Comparison is strictly lexicographic, so two updates
//! to one digest always have a winner no matter which order they arrive in.
//!
//! The stamp never reads the clock itself. Times are handed to it by the
//! segment directory when a slot is granted, and by the snapshot loader on
//! restart.

use std::time::{SystemTime, UNIX_EPOCH};

/// Second-resolution wall-clock value. Only compared after assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KvTime(i64);

impl KvTime {
    /// Serialized width in bytes (a little-endian `i64`).
    pub const SIZE: usize = 8;

    /// The current wall clock, truncated to whole seconds.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self(secs)
    }

    /// Wraps a raw seconds value, e.g. one decoded from a snapshot.
    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// The raw seconds value.
    #[must_use]
    pub fn as_secs(&self) -> i64 {
        self.0
    }
}

/// Monotone ordering tuple for index entries.
///
/// `a < b` iff `a.seg_time < b.seg_time`, or the times are equal and
/// `a.seg_key_no < b.seg_key_no`. The derived ordering over the fields in
/// declaration order is exactly that rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogicStamp {
    /// Time at which the record's segment was opened.
    pub seg_time: KvTime,
    /// Ordinal of the record within its segment.
    pub seg_key_no: i32,
}

impl LogicStamp {
    pub fn new(seg_time: KvTime, seg_key_no: i32) -> Self {
        Self {
            seg_time,
            seg_key_no,
        }
    }
}
