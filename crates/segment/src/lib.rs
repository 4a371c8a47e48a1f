//! # Segment - Fixed-Size Record Container
//!
//! Values live on the device inside fixed-size, power-of-two segments. Each
//! segment is append-only and holds two streams growing toward each other:
//!
//! ```text
//! offset 0                                                      size
//! ┌──────────────┬──────────────── gap ───────────────┬─────────────┐
//! │ header stream │            (uninitialized)         │ data stream │
//! │   grows up →  │                                    │ ← grows down│
//! └──────────────┴────────────────────────────────────┴─────────────┘
//! ```
//!
//! After N records in a segment of size S:
//!
//! * headers occupy `[0, N * 26)`, each linking to the next via
//!   `next_header_offset` (zero marks the chain end);
//! * values occupy `[S - sum(data_size), S)`, record i's value ending where
//!   record i-1's begins.
//!
//! A record is one [`DataHeader`] plus `data_size` value bytes. Deletion
//! records carry `data_size == 0` and no value bytes at all; they exist
//! only to advance their digest's logical stamp.
//!
//! The [`SegmentDirectory`] (see [`directory`]) maps segment ids to device
//! offsets, grants write slots with their stamps, and tallies dead space for
//! the reclaimer.

pub mod directory;

use index::{DataHeader, DATA_HEADER_SIZE};
use thiserror::Error;

pub use directory::{OutOfSegments, SegmentDirectory, SegmentUsage, SlotGrant};

/// The record does not fit the remaining gap between the two streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("segment full")]
pub struct SegmentFull;

/// An in-memory image of one segment being filled.
///
/// Packing is byte-exact: [`bytes`](Segment::bytes) is precisely what the
/// segment's device region holds once its records are written out.
#[derive(Debug, Clone)]
pub struct Segment {
    id: u32,
    buf: Vec<u8>,
    /// End of the header stream; also the offset the next header would take.
    header_tail: u32,
    /// Start of the data stream; values grow downward from here.
    data_head: u32,
    /// Offset of the most recently appended header, for chain patching.
    last_header: Option<u32>,
    records: u32,
}

impl Segment {
    /// An empty segment with the given id and power-of-two size.
    pub fn new(id: u32, size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            id,
            buf: vec![0u8; size as usize],
            header_tail: 0,
            data_head: size,
            last_header: None,
            records: 0,
        }
    }

    /// Appends one record: the header at the current header-stream offset,
    /// the value ending immediately before the previous record's value.
    ///
    /// The header's `data_size`, `data_offset`, and `next_header_offset` are
    /// finalized here from the packing rule; the previous header's chain
    /// link is patched to point at the new one. Returns the header's offset
    /// within the segment and the finalized header.
    ///
    /// # Errors
    ///
    /// [`SegmentFull`] when the gap is smaller than
    /// `26 + value.len()` bytes. The segment is unchanged.
    pub fn put(
        &mut self,
        mut header: DataHeader,
        value: &[u8],
    ) -> Result<(u32, DataHeader), SegmentFull> {
        debug_assert!(value.len() <= u16::MAX as usize);
        let need = (DATA_HEADER_SIZE + value.len()) as u32;
        if need > self.gap() {
            return Err(SegmentFull);
        }

        let data_offset = self.data_head - value.len() as u32;
        header.data_size = value.len() as u16;
        header.data_offset = data_offset;
        header.next_header_offset = 0;

        self.buf[data_offset as usize..self.data_head as usize].copy_from_slice(value);

        let header_offset = self.header_tail;
        self.buf[header_offset as usize..header_offset as usize + DATA_HEADER_SIZE]
            .copy_from_slice(&header.to_bytes());

        if let Some(prev) = self.last_header {
            // Patch the previous header's next_header_offset in place.
            let link = prev as usize + DATA_HEADER_SIZE - 4;
            self.buf[link..link + 4].copy_from_slice(&header_offset.to_le_bytes());
        }

        self.header_tail += DATA_HEADER_SIZE as u32;
        self.data_head = data_offset;
        self.last_header = Some(header_offset);
        self.records += 1;
        Ok((header_offset, header))
    }

    /// Walks the header chain from the front, yielding
    /// `(header_offset, header)` in insertion order.
    pub fn headers(&self) -> HeaderChain<'_> {
        HeaderChain {
            seg: self,
            next: if self.records > 0 { Some(0) } else { None },
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Bytes between the two streams still available for records.
    #[must_use]
    pub fn gap(&self) -> u32 {
        self.data_head - self.header_tail
    }

    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.records
    }

    /// The full segment image, exactly as it lays out on the device.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The populated prefix of the header stream.
    #[must_use]
    pub fn header_bytes(&self) -> &[u8] {
        &self.buf[..self.header_tail as usize]
    }
}

/// Iterator over a segment's header chain.
pub struct HeaderChain<'a> {
    seg: &'a Segment,
    next: Option<u32>,
}

impl Iterator for HeaderChain<'_> {
    type Item = (u32, DataHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let slot = self
            .seg
            .buf
            .get(offset as usize..offset as usize + DATA_HEADER_SIZE)?;
        let mut raw = [0u8; DATA_HEADER_SIZE];
        raw.copy_from_slice(slot);
        let header = DataHeader::from_bytes(&raw);
        self.next = match header.next_header_offset {
            0 => None,
            next => Some(next),
        };
        Some((offset, header))
    }
}
