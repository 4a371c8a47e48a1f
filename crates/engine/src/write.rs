//! Write path: `put()`, `delete()`, segment sealing, and `flush()`.
//!
//! Every mutation becomes one record in the current segment. The record's
//! bytes are written to the device before the index is touched, so a reader
//! that observes the index entry always finds the value behind it. Whether
//! the mutation actually wins is decided inside `HashIndex::update` by its
//! logical stamp.

use anyhow::{ensure, Result};
use device::BlockDevice;
use fingerprint::Fingerprint;
use index::{DataHeader, HashEntry, HashEntryOnDisk, LogicStamp, DATA_HEADER_SIZE};
use segment::{Segment, SegmentFull};
use tracing::debug;

use crate::{Store, MAX_VALUE_SIZE};

impl<D: BlockDevice> Store<D> {
    /// Inserts or updates a key-value pair.
    ///
    /// An empty value is not representable: a record with zero value bytes
    /// is a deletion on the wire, so `put` rejects it. Use
    /// [`delete`](Store::delete) instead.
    ///
    /// # Errors
    ///
    /// Fails on invalid sizes, when the index is saturated with other keys
    /// (`IndexError::Full`), when every segment is sealed, or on device I/O
    /// errors.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        ensure!(!value.is_empty(), "empty values are not representable; use delete");
        ensure!(
            value.len() <= MAX_VALUE_SIZE,
            "value too large: {} bytes (max {})",
            value.len(),
            MAX_VALUE_SIZE
        );
        ensure!(
            DATA_HEADER_SIZE + value.len() <= self.seg.size() as usize,
            "value of {} bytes cannot fit a {}-byte segment",
            value.len(),
            self.seg.size()
        );

        self.write_record(Fingerprint::of(key), value)
    }

    /// Deletes a key by writing a tombstone record.
    ///
    /// Deleting an absent key succeeds: the tombstone is recorded as dead
    /// space and the index is left untouched.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "key must not be empty");
        self.write_record(Fingerprint::of(key), &[])
    }

    /// Packs one record, persists its bytes, and runs the index update
    /// under the record's slot grant.
    fn write_record(&mut self, digest: Fingerprint, value: &[u8]) -> Result<()> {
        ensure!(
            self.seg.id() < self.directory.segment_count(),
            "device segments exhausted"
        );

        let template = DataHeader::new(digest, value.len() as u16, 0, 0);
        let (header_offset, header) = loop {
            match self.seg.put(template, value) {
                Ok(placed) => break placed,
                // The gap check in put() guarantees the record fits an
                // empty segment, so at most one seal happens here.
                Err(SegmentFull) => self.seal_current()?,
            }
        };

        let seg_base = self.directory.offset_of(self.seg.id());
        self.dev.write_at(self.seg.header_bytes(), seg_base)?;
        if !value.is_empty() {
            self.dev
                .write_at(value, seg_base + u64::from(header.data_offset))?;
        }

        let grant = self.directory.allocate_slot();
        debug_assert_eq!(grant.seg_id, self.seg.id());
        let entry = HashEntry::new(
            HashEntryOnDisk::new(header, seg_base + u64::from(header_offset)),
            LogicStamp::new(grant.seg_time, grant.seq_no),
        );
        self.index.update(entry, &self.directory)?;
        Ok(())
    }

    /// Seals the current segment and opens the next one.
    fn seal_current(&mut self) -> Result<()> {
        let next = self.directory.advance()?;
        debug!("segment {} sealed, opening {}", self.seg.id(), next);
        self.seg = Segment::new(next, self.directory.segment_size());
        Ok(())
    }

    /// Persists the index snapshot and the superblock.
    ///
    /// After a flush the store can be reopened to exactly this state. The
    /// superblock's `next_seg_id` moves past the current segment whenever it
    /// holds records, so a reopened store never appends into a segment that
    /// already has history.
    pub fn flush(&mut self) -> Result<()> {
        self.index.write(&self.dev, &mut self.superblock)?;
        self.superblock.next_seg_id = if self.seg.record_count() > 0 {
            self.seg.id() + 1
        } else {
            self.seg.id()
        };
        self.superblock.write_to(&self.dev)?;
        self.dev.sync()?;
        debug!(
            "flushed index snapshot: {} entries, next segment {}",
            self.index.element_count(),
            self.superblock.next_seg_id
        );
        Ok(())
    }
}
