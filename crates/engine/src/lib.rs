//! # Engine - ShoalKV Storage Engine
//!
//! The central orchestrator that ties the [`fingerprint`], [`index`], and
//! [`segment`] crates into a complete key-value store over one block device.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌───────────────────────────────────────────────────┐
//! │                      STORE                        │
//! │                                                   │
//! │ write.rs → fingerprint → pack into segment        │
//! │              |   (SegmentFull? seal, retry)       │
//! │              v                                    │
//! │         record bytes → device                     │
//! │              |                                    │
//! │              v                                    │
//! │         slot grant → HashIndex::update            │
//! │           (stamp decides, losers reported dead)   │
//! │                                                   │
//! │ read.rs  → HashIndex::get → value bytes ← device  │
//! │ flush()  → index snapshot + superblock → device   │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Device layout
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────────────┐
//! │ superblock   │ index snapshot       │ segments                │
//! │ page 0       │ whole pages          │ segment_size * count    │
//! └──────────────┴──────────────────────┴─────────────────────────┘
//! ```
//!
//! ## Durability
//!
//! Record bytes reach the device on every accepted write. The index itself
//! is persisted only by [`Store::flush`] (and best-effort on drop): after a
//! crash, the store recovers to its last flushed snapshot. Reopening always
//! continues in a fresh segment; the tail of the segment that was open at
//! shutdown is surrendered to keep recovery trivial.

mod read;
mod superblock;
mod write;

use std::fmt;

use anyhow::{ensure, Context, Result};
use device::BlockDevice;
use index::{HashIndex, DATA_HEADER_SIZE};
use segment::{Segment, SegmentDirectory};
use tracing::info;

pub use superblock::{Superblock, SUPERBLOCK_BYTES, SUPERBLOCK_MAGIC, SUPERBLOCK_VERSION};

/// Largest value a record can carry; `data_size` is a `u16` on the wire.
pub const MAX_VALUE_SIZE: usize = u16::MAX as usize;

/// Device offset of the index snapshot region (the page after the
/// superblock).
pub const INDEX_OFFSET: u64 = 4096;

/// Sizing knobs for a new store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How many keys the index is sized for. Rounded up to a power of two.
    pub num_objects: u32,
    /// Segment size in bytes. Must be a power of two.
    pub segment_size: u32,
    /// How many segments the device holds.
    pub segment_count: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            num_objects: 1024,
            segment_size: 1024 * 1024,
            segment_count: 64,
        }
    }
}

impl StoreOptions {
    /// The device capacity these options demand: superblock page, index
    /// region, and the segment area.
    #[must_use]
    pub fn required_capacity(&self) -> u64 {
        let bucket_count = HashIndex::bucket_count_for(self.num_objects);
        INDEX_OFFSET
            + HashIndex::worst_case_size_on_device(bucket_count)
            + u64::from(self.segment_size) * u64::from(self.segment_count)
    }
}

/// A log-structured key-value store over one block device.
///
/// # Write Path
///
/// 1. Fingerprint the key.
/// 2. Pack the record into the current segment; on `SegmentFull`, seal it
///    and retry in the next one.
/// 3. Write the record's header and value bytes to the device.
/// 4. Take a slot grant (segment time + ordinal) and update the index under
///    its lock. The grant's stamp reconciles concurrent updates to the same
///    key; superseded records are reported to the segment directory as dead.
///
/// # Read Path
///
/// Index lookup by fingerprint, then one positioned read for the value.
/// Tombstones read as absent.
///
/// # Recovery
///
/// [`Store::open`] validates the superblock, reloads the index snapshot
/// (verifying its entry total against the superblock), and resumes writing
/// in the first never-used segment.
pub struct Store<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) superblock: Superblock,
    pub(crate) index: HashIndex,
    pub(crate) directory: SegmentDirectory,
    pub(crate) seg: Segment,
}

impl<D: BlockDevice> Store<D> {
    /// Formats `dev` as a fresh store and returns it ready for writes.
    ///
    /// Writes an empty index snapshot and the superblock immediately, so a
    /// created store is a valid device even before the first flush.
    pub fn create(dev: D, opts: &StoreOptions) -> Result<Self> {
        ensure!(opts.num_objects >= 1, "num_objects must be at least 1");
        ensure!(
            opts.segment_size.is_power_of_two(),
            "segment size {} is not a power of two",
            opts.segment_size
        );
        ensure!(
            opts.segment_size as usize > DATA_HEADER_SIZE,
            "segment size {} cannot hold a record header",
            opts.segment_size
        );
        ensure!(opts.segment_count >= 1, "segment count must be at least 1");

        let required = opts.required_capacity();
        ensure!(
            dev.capacity() >= required,
            "device too small: {} bytes, need {}",
            dev.capacity(),
            required
        );

        let index = HashIndex::create(INDEX_OFFSET, opts.num_objects);
        let bucket_count = index.bucket_count();
        let mut superblock = Superblock::new(bucket_count, opts.segment_size, opts.segment_count);
        index
            .write(&dev, &mut superblock)
            .context("writing initial index snapshot")?;
        superblock.write_to(&dev)?;
        dev.sync()?;

        let data_base = INDEX_OFFSET + HashIndex::worst_case_size_on_device(bucket_count);
        let directory = SegmentDirectory::new(data_base, opts.segment_size, opts.segment_count, 0);
        let seg = Segment::new(0, opts.segment_size);

        info!(
            "created store: {} buckets, {} segments of {} bytes",
            bucket_count, opts.segment_count, opts.segment_size
        );

        Ok(Self {
            dev,
            superblock,
            index,
            directory,
            seg,
        })
    }

    /// Opens an existing store, recovering the index from its snapshot.
    ///
    /// # Errors
    ///
    /// Fails when the superblock is missing or torn, when the snapshot
    /// disagrees with the superblock's counters, or on device I/O errors.
    /// The caller may fall back to [`Store::create`] on a fresh device.
    pub fn open(dev: D) -> Result<Self> {
        let superblock = Superblock::read_from(&dev).context("reading superblock")?;

        let data_base =
            INDEX_OFFSET + HashIndex::worst_case_size_on_device(superblock.bucket_count);
        let segment_area = u64::from(superblock.segment_size) * u64::from(superblock.segment_count);
        ensure!(
            dev.capacity() >= data_base + segment_area,
            "device shrunk below the superblock's geometry"
        );

        let index = HashIndex::load(&dev, INDEX_OFFSET, superblock.bucket_count, &superblock)
            .context("loading index snapshot")?;

        let directory = SegmentDirectory::new(
            data_base,
            superblock.segment_size,
            superblock.segment_count,
            superblock.next_seg_id,
        );
        let seg = Segment::new(superblock.next_seg_id, superblock.segment_size);

        info!(
            "opened store: {} entries, resuming at segment {}",
            index.element_count(),
            superblock.next_seg_id
        );

        Ok(Self {
            dev,
            superblock,
            index,
            directory,
            seg,
        })
    }

    /// Number of resident index entries, tombstones included.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        self.index.element_count()
    }

    /// Logical footprint of all live entries (header + value bytes each).
    #[must_use]
    pub fn data_theory_size(&self) -> u64 {
        self.index.data_theory_size()
    }

    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        self.index.bucket_count()
    }

    #[must_use]
    pub fn segment_size(&self) -> u32 {
        self.directory.segment_size()
    }

    /// The segment currently accepting records.
    #[must_use]
    pub fn current_segment(&self) -> u32 {
        self.seg.id()
    }
}

impl<D: BlockDevice> fmt::Debug for Store<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("bucket_count", &self.index.bucket_count())
            .field("element_count", &self.index.element_count())
            .field("data_theory_size", &self.index.data_theory_size())
            .field("segment_size", &self.directory.segment_size())
            .field("segment_count", &self.directory.segment_count())
            .field("current_segment", &self.seg.id())
            .finish()
    }
}

/// Best-effort flush on drop.
///
/// Drop cannot propagate errors, so a failed flush is silently ignored; the
/// store still recovers to its previous snapshot on the next open.
impl<D: BlockDevice> Drop for Store<D> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests;
