//! Maps segments onto the device and accounts for dead space.
//!
//! Segments occupy a contiguous device region starting at a fixed base:
//! segment `i` lives at `base + i * segment_size`. The directory hands out
//! write slots for the current segment (each grant carries the segment's
//! open time and the record's ordinal, which together form the record's
//! [`LogicStamp`](index::LogicStamp)) and tallies per-segment dead bytes as
//! the index reports superseded records.
//!
//! The tallies are consumed by an external reclaimer; they restart at zero
//! when a store is reopened.

use std::sync::{Mutex, MutexGuard, PoisonError};

use index::{DeadSpaceTracker, HashEntry, KvTime, DATA_HEADER_SIZE};
use thiserror::Error;

/// Every segment has been opened and sealed; no slot can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {0} segments are sealed")]
pub struct OutOfSegments(pub u32);

/// One write slot: which segment, the time that segment was opened, and the
/// record's ordinal within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub seg_id: u32,
    pub seg_time: KvTime,
    pub seq_no: i32,
}

/// Reclamation statistics for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentUsage {
    /// Bytes occupied by records that no longer back a live key.
    pub dead_bytes: u64,
    /// How many such records the segment holds.
    pub dead_records: u32,
}

#[derive(Debug)]
struct DirInner {
    current_id: u32,
    seg_time: KvTime,
    next_seq: i32,
    usage: Vec<SegmentUsage>,
}

/// Segment id ↔ device offset mapping plus dead-space accounting.
///
/// Its mutex is a concurrency domain of its own: the index calls
/// [`modify_death_entry`](DeadSpaceTracker::modify_death_entry) while
/// holding the index lock, and the directory never calls back.
#[derive(Debug)]
pub struct SegmentDirectory {
    base_offset: u64,
    segment_size: u32,
    segment_count: u32,
    inner: Mutex<DirInner>,
}

impl SegmentDirectory {
    /// A directory for `segment_count` segments of `segment_size` bytes
    /// starting at `base_offset`, with `first_seg_id` as the open segment.
    pub fn new(base_offset: u64, segment_size: u32, segment_count: u32, first_seg_id: u32) -> Self {
        debug_assert!(segment_size.is_power_of_two());
        Self {
            base_offset,
            segment_size,
            segment_count,
            inner: Mutex::new(DirInner {
                current_id: first_seg_id,
                seg_time: KvTime::now(),
                next_seq: 0,
                usage: vec![SegmentUsage::default(); segment_count as usize],
            }),
        }
    }

    /// Grants the next slot in the current segment and the stamp parts the
    /// record will carry.
    pub fn allocate_slot(&self) -> SlotGrant {
        let mut inner = self.lock_inner();
        let grant = SlotGrant {
            seg_id: inner.current_id,
            seg_time: inner.seg_time,
            seq_no: inner.next_seq,
        };
        inner.next_seq += 1;
        grant
    }

    /// Seals the current segment and opens the next one. The new segment's
    /// open time never runs backwards, even if the wall clock does.
    ///
    /// # Errors
    ///
    /// [`OutOfSegments`] once the last segment is current.
    pub fn advance(&self) -> Result<u32, OutOfSegments> {
        let mut inner = self.lock_inner();
        if inner.current_id + 1 >= self.segment_count {
            return Err(OutOfSegments(self.segment_count));
        }
        inner.current_id += 1;
        inner.seg_time = KvTime::now().max(inner.seg_time);
        inner.next_seq = 0;
        Ok(inner.current_id)
    }

    /// The segment currently accepting records.
    #[must_use]
    pub fn current_segment(&self) -> u32 {
        self.lock_inner().current_id
    }

    /// Device offset of segment `seg_id`.
    #[must_use]
    pub fn offset_of(&self, seg_id: u32) -> u64 {
        self.base_offset + u64::from(seg_id) * u64::from(self.segment_size)
    }

    /// The segment containing the absolute device offset.
    #[must_use]
    pub fn segment_of(&self, device_offset: u64) -> u32 {
        (device_offset.saturating_sub(self.base_offset) / u64::from(self.segment_size)) as u32
    }

    /// `device_offset` relative to the start of its segment.
    #[must_use]
    pub fn offset_in_segment(&self, device_offset: u64) -> u32 {
        (device_offset.saturating_sub(self.base_offset) % u64::from(self.segment_size)) as u32
    }

    /// Reclamation statistics for `seg_id`. Zero for out-of-range ids.
    #[must_use]
    pub fn usage(&self, seg_id: u32) -> SegmentUsage {
        self.lock_inner()
            .usage
            .get(seg_id as usize)
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Width of a record header on the device.
    #[must_use]
    pub fn header_size(&self) -> usize {
        DATA_HEADER_SIZE
    }

    fn lock_inner(&self) -> MutexGuard<'_, DirInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DeadSpaceTracker for SegmentDirectory {
    /// Tallies the record behind `entry` as dead: its header plus however
    /// many value bytes it carried.
    fn modify_death_entry(&self, entry: &HashEntry) {
        let seg_id = self.segment_of(entry.header_offset());
        let mut inner = self.lock_inner();
        if let Some(usage) = inner.usage.get_mut(seg_id as usize) {
            usage.dead_bytes += DATA_HEADER_SIZE as u64 + u64::from(entry.data_size());
            usage.dead_records += 1;
        }
    }
}
