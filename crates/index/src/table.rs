//! The persistent hash index and its on-device snapshot.
//!
//! ## Snapshot layout (at the index's start offset, little-endian)
//!
//! ```text
//! [timestamp: i64]                          seconds the snapshot was taken
//! [counts: i32 * bucket_count]              chain length of each bucket
//! [entries: 34 bytes * sum(counts)]         each bucket's chain, in order
//! [zeroes ...]                              padding to the region boundary
//! ```
//!
//! Bucket order and within-bucket chain order are preserved, so a write
//! followed by a load reproduces the table bucket-for-bucket.

use std::sync::{Mutex, MutexGuard, PoisonError};

use byteorder::{LittleEndian, WriteBytesExt};
use device::{BlockDevice, DeviceError};
use fingerprint::Fingerprint;
use thiserror::Error;

use crate::bucket::LinkedBucket;
use crate::entry::{HashEntry, HashEntryOnDisk, HASH_ENTRY_DISK_SIZE};
use crate::stamp::{KvTime, LogicStamp};

const PAGE_SIZE: u64 = 4096;

/// Errors surfaced by the index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The bucket array is saturated; a new key cannot be inserted. No side
    /// effects; the caller may retry after reclamation.
    #[error("hash index full ({0} buckets)")]
    Full(u32),

    /// A loaded snapshot disagrees with itself or with the superblock.
    /// Fatal to the load; the caller may fall back to creating a fresh index.
    #[error("corrupt index: {0}")]
    Corrupt(String),

    /// Device I/O failed. In-memory state is unchanged on a read failure and
    /// undefined on a write failure; retry the write end to end.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Device(DeviceError::Io(err))
    }
}

/// Sink for records whose device slots no longer back a live key.
///
/// The segment directory implements this to tally per-segment dead bytes for
/// the reclaimer. Calls arrive while the index mutex is held, so
/// implementations must not call back into the index.
pub trait DeadSpaceTracker {
    /// Records that `entry`'s slot has been superseded.
    fn modify_death_entry(&self, entry: &HashEntry);
}

/// The two superblock counters the index owns.
///
/// Read when a snapshot is loaded, written when one is persisted. How the
/// record itself reaches stable storage is the collaborator's concern.
pub trait SuperblockState {
    fn element_num(&self) -> u32;
    fn set_element_num(&mut self, element_num: u32);
    fn data_theory_size(&self) -> u64;
    fn set_data_theory_size(&mut self, data_theory_size: u64);
}

/// State guarded by the index mutex: the bucket array and both counters.
#[derive(Debug)]
struct Core {
    buckets: Vec<LinkedBucket>,
    element_count: u32,
    data_theory_size: u64,
}

impl Core {
    fn bucket_of(&self, digest: &Fingerprint) -> usize {
        (digest.bucket_hash() % self.buckets.len() as u64) as usize
    }
}

/// The in-memory hash index: fingerprint → entry, with a device-resident
/// snapshot.
///
/// # Structure
///
/// Open addressing by bucket with a collision chain per bucket. The bucket
/// count is the smallest power of two ≥ the requested capacity and never
/// changes afterwards. A digest lives in exactly one chain, the one selected
/// by `bucket_hash(digest) mod bucket_count`.
///
/// # Capacity
///
/// When `element_count == bucket_count`, inserts of **new** digests fail
/// with [`IndexError::Full`]; updates to resident digests always succeed.
/// Tombstones stay resident until the reclaimer removes them, and count
/// toward capacity while they do.
///
/// # Concurrency
///
/// One mutex guards the bucket array and the two counters. [`write`]
/// serializes the snapshot under the lock but performs device I/O after
/// releasing it.
///
/// [`write`]: HashIndex::write
#[derive(Debug)]
pub struct HashIndex {
    bucket_count: u32,
    start_offset: u64,
    core: Mutex<Core>,
}

impl HashIndex {
    /// The bucket count a table sized for `num_objects` keys will use: the
    /// smallest power of two ≥ `max(1, num_objects)`.
    #[must_use]
    pub fn bucket_count_for(num_objects: u32) -> u32 {
        num_objects.max(1).next_power_of_two()
    }

    /// Sizes a new, empty index for `num_objects` keys. No device I/O.
    pub fn create(start_offset: u64, num_objects: u32) -> Self {
        let bucket_count = Self::bucket_count_for(num_objects);
        Self {
            bucket_count,
            start_offset,
            core: Mutex::new(Core {
                buckets: vec![LinkedBucket::new(); bucket_count as usize],
                element_count: 0,
                data_theory_size: 0,
            }),
        }
    }

    /// Rebuilds the index from the snapshot at `start_offset`.
    ///
    /// Every loaded entry is stamped `(snapshot_time, 0)`, so any write
    /// accepted after the restart outranks it.
    ///
    /// # Errors
    ///
    /// [`IndexError::Corrupt`] when the snapshot's entry total disagrees
    /// with the superblock's `element_num`, or the count table is malformed.
    /// [`IndexError::Device`] on short reads or I/O failure, leaving no
    /// partially built index behind.
    pub fn load(
        dev: &dyn BlockDevice,
        start_offset: u64,
        bucket_count: u32,
        superblock: &dyn SuperblockState,
    ) -> Result<Self, IndexError> {
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(IndexError::Corrupt(format!(
                "bucket count {bucket_count} is not a power of two"
            )));
        }

        let mut offset = start_offset;

        let mut time_buf = [0u8; KvTime::SIZE];
        dev.read_at(&mut time_buf, offset)?;
        let snapshot_time = KvTime::from_secs(i64::from_le_bytes(time_buf));
        offset += KvTime::SIZE as u64;

        let mut counts_buf = vec![0u8; 4 * bucket_count as usize];
        dev.read_at(&mut counts_buf, offset)?;
        offset += counts_buf.len() as u64;

        let mut total: u64 = 0;
        for chunk in counts_buf.chunks_exact(4) {
            let count = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if count < 0 {
                return Err(IndexError::Corrupt(format!(
                    "negative chain length {count} in count table"
                )));
            }
            total += count as u64;
        }
        // element_count can never exceed bucket_count, so neither can a
        // well-formed snapshot's entry total.
        if total > u64::from(bucket_count) {
            return Err(IndexError::Corrupt(format!(
                "count table claims {total} entries for {bucket_count} buckets"
            )));
        }

        let mut entries_buf = vec![0u8; HASH_ENTRY_DISK_SIZE * total as usize];
        dev.read_at(&mut entries_buf, offset)?;

        let mut buckets = vec![LinkedBucket::new(); bucket_count as usize];
        let mut data_theory_size = 0u64;
        let stamp = LogicStamp::new(snapshot_time, 0);
        let mut cursor = &entries_buf[..];
        for _ in 0..total {
            let on_disk = HashEntryOnDisk::read_from(&mut cursor)?;
            let entry = HashEntry::new(on_disk, stamp);
            data_theory_size += entry.live_bytes();
            let idx = (entry.digest().bucket_hash() % u64::from(bucket_count)) as usize;
            buckets[idx].put(entry);
        }

        let element_count: u32 = buckets.iter().map(|b| b.len() as u32).sum();
        if element_count != superblock.element_num() {
            return Err(IndexError::Corrupt(format!(
                "snapshot holds {element_count} entries but superblock records {}",
                superblock.element_num()
            )));
        }

        Ok(Self {
            bucket_count,
            start_offset,
            core: Mutex::new(Core {
                buckets,
                element_count,
                data_theory_size,
            }),
        })
    }

    /// Persists the snapshot and publishes the counters to the superblock.
    ///
    /// The serialization is produced under the index mutex; the device write
    /// happens after the lock is released, so concurrent updates are never
    /// blocked on I/O. The image is equivalent to some serialization of all
    /// updates that completed before this call returned.
    pub fn write(
        &self,
        dev: &dyn BlockDevice,
        superblock: &mut dyn SuperblockState,
    ) -> Result<(), IndexError> {
        let (image, element_count, data_theory_size) = {
            let core = self.lock_core();
            let exact = KvTime::SIZE as u64
                + 4 * u64::from(self.bucket_count)
                + HASH_ENTRY_DISK_SIZE as u64 * u64::from(core.element_count);
            let image_len =
                round_up_to_page(exact).max(Self::reserved_size_on_device(self.bucket_count));

            let mut image = Vec::with_capacity(image_len as usize);
            image.write_i64::<LittleEndian>(KvTime::now().as_secs())?;
            for bucket in &core.buckets {
                image.write_i32::<LittleEndian>(bucket.len() as i32)?;
            }
            for bucket in &core.buckets {
                for entry in bucket.iter() {
                    entry.on_disk.write_to(&mut image)?;
                }
            }
            image.resize(image_len as usize, 0); // deterministic zero tail
            (image, core.element_count, core.data_theory_size)
        };

        dev.write_at(&image, self.start_offset)?;
        superblock.set_element_num(element_count);
        superblock.set_data_theory_size(data_theory_size);
        Ok(())
    }

    /// Applies one accepted write to the index. The core mutation.
    ///
    /// `entry` is the candidate produced for the newly written record; its
    /// stamp decides the outcome against any resident entry for the same
    /// digest. Superseded or stale slots are reported to `deaths`.
    ///
    /// # Errors
    ///
    /// [`IndexError::Full`] when `entry` is a new digest carrying a value
    /// and the table is saturated. Stale writes and tombstones for absent
    /// digests succeed silently.
    pub fn update(
        &self,
        entry: HashEntry,
        deaths: &dyn DeadSpaceTracker,
    ) -> Result<(), IndexError> {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let idx = core.bucket_of(entry.digest());

        if let Some(existing) = core.buckets[idx].get_mut(entry.digest()) {
            if entry.stamp < existing.stamp {
                // Stale write: the record it produced is dead on arrival.
                deaths.modify_death_entry(&entry);
                return Ok(());
            }
            deaths.modify_death_entry(existing);
            let reclaimed = existing.live_bytes();
            let added = entry.live_bytes();
            *existing = entry;
            core.data_theory_size = core.data_theory_size - reclaimed + added;
            return Ok(());
        }

        if entry.is_tombstone() {
            // Deleting an absent key is not an error; the tombstone record
            // itself is immediately reclaimable.
            deaths.modify_death_entry(&entry);
            return Ok(());
        }

        if core.element_count == self.bucket_count {
            return Err(IndexError::Full(self.bucket_count));
        }

        core.data_theory_size += entry.live_bytes();
        core.element_count += 1;
        core.buckets[idx].put(entry);
        Ok(())
    }

    /// Copies out the entry for `digest`, if one is resident. A tombstone is
    /// returned as an entry with `data_size == 0`.
    pub fn get(&self, digest: &Fingerprint) -> Option<HashEntry> {
        let core = self.lock_core();
        core.buckets[core.bucket_of(digest)].find(digest).cloned()
    }

    /// Reclaimer hook: removes `entry` from its chain, but only if the
    /// resident entry is a tombstone from the same segment time. Returns
    /// whether a removal happened.
    pub fn remove_entry(&self, entry: &HashEntry) -> bool {
        let mut guard = self.lock_core();
        let core = &mut *guard;
        let idx = core.bucket_of(entry.digest());

        let matches = core.buckets[idx]
            .find(entry.digest())
            .map(|resident| {
                resident.is_tombstone() && resident.stamp.seg_time == entry.stamp.seg_time
            })
            .unwrap_or(false);
        if !matches {
            return false;
        }

        core.buckets[idx].remove(entry.digest());
        core.element_count -= 1;
        // A tombstone contributes nothing to data_theory_size.
        true
    }

    /// Reclaimer hook: true iff the resident entry for `entry`'s digest
    /// still points at the same header slot. Used to decide whether a copied
    /// record is current.
    pub fn is_same_in_mem(&self, entry: &HashEntry) -> bool {
        let core = self.lock_core();
        core.buckets[core.bucket_of(entry.digest())]
            .find(entry.digest())
            .map(|resident| resident.header_offset() == entry.header_offset())
            .unwrap_or(false)
    }

    /// Visits every resident entry as `(bucket_index, entry)`, in bucket
    /// order then chain order, under the index mutex.
    pub fn for_each(&self, mut f: impl FnMut(usize, &HashEntry)) {
        let core = self.lock_core();
        for (idx, bucket) in core.buckets.iter().enumerate() {
            for entry in bucket.iter() {
                f(idx, entry);
            }
        }
    }

    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    #[must_use]
    pub fn element_count(&self) -> u32 {
        self.lock_core().element_count
    }

    #[must_use]
    pub fn data_theory_size(&self) -> u64 {
        self.lock_core().data_theory_size
    }

    /// The on-device reservation advertised for a snapshot:
    /// `round_up(timestamp + 34 * bucket_count, page)`.
    ///
    /// For bucket counts whose full count table plus a saturated entry array
    /// would not fit this figure, [`worst_case_size_on_device`] gives the
    /// safe reservation.
    ///
    /// [`worst_case_size_on_device`]: HashIndex::worst_case_size_on_device
    #[must_use]
    pub fn reserved_size_on_device(bucket_count: u32) -> u64 {
        round_up_to_page(
            KvTime::SIZE as u64 + HASH_ENTRY_DISK_SIZE as u64 * u64::from(bucket_count),
        )
    }

    /// Whole-page size of the largest snapshot this index can emit: the
    /// timestamp, the full count table, and one entry per bucket.
    #[must_use]
    pub fn worst_case_size_on_device(bucket_count: u32) -> u64 {
        round_up_to_page(
            KvTime::SIZE as u64
                + (4 + HASH_ENTRY_DISK_SIZE as u64) * u64::from(bucket_count),
        )
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        // A poisoned lock only means a panic elsewhere; the guarded state is
        // still internally consistent, so recover the guard.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn round_up_to_page(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}
