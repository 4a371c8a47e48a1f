//! # Superblock - Persistent Store Metadata
//!
//! A single small record at device offset 0 describing the store's geometry
//! and the two counters the index owns.
//!
//! ## Wire format (little-endian)
//!
//! ```text
//! [magic: u32][version: u16][bucket_count: u32][segment_size: u32]
//! [segment_count: u32][next_seg_id: u32][element_num: u32]
//! [data_theory_size: u64][crc32: u32]
//! ```
//!
//! The CRC32 covers every preceding byte. A device whose first bytes fail
//! the magic or checksum test is not a ShoalKV store; `open` refuses it and
//! the caller may fall back to `create`.

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use device::BlockDevice;
use index::SuperblockState;

/// ASCII "SHOL".
pub const SUPERBLOCK_MAGIC: u32 = 0x5348_4F4C;
/// Current superblock format version.
pub const SUPERBLOCK_VERSION: u16 = 1;
/// Serialized width of the record.
pub const SUPERBLOCK_BYTES: usize = 4 + 2 + 4 + 4 + 4 + 4 + 4 + 8 + 4;

/// The store's persistent metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub bucket_count: u32,
    pub segment_size: u32,
    pub segment_count: u32,
    /// First segment id that has never accepted a record; writes continue
    /// here after a reopen.
    pub next_seg_id: u32,
    element_num: u32,
    data_theory_size: u64,
}

impl Superblock {
    /// A fresh superblock for a just-created store.
    pub fn new(bucket_count: u32, segment_size: u32, segment_count: u32) -> Self {
        Self {
            bucket_count,
            segment_size,
            segment_count,
            next_seg_id: 0,
            element_num: 0,
            data_theory_size: 0,
        }
    }

    /// Serializes the record and writes it at device offset 0.
    pub fn write_to(&self, dev: &dyn BlockDevice) -> Result<()> {
        let mut buf = Vec::with_capacity(SUPERBLOCK_BYTES);
        buf.write_u32::<LittleEndian>(SUPERBLOCK_MAGIC)?;
        buf.write_u16::<LittleEndian>(SUPERBLOCK_VERSION)?;
        buf.write_u32::<LittleEndian>(self.bucket_count)?;
        buf.write_u32::<LittleEndian>(self.segment_size)?;
        buf.write_u32::<LittleEndian>(self.segment_count)?;
        buf.write_u32::<LittleEndian>(self.next_seg_id)?;
        buf.write_u32::<LittleEndian>(self.element_num)?;
        buf.write_u64::<LittleEndian>(self.data_theory_size)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;

        dev.write_at(&buf, 0)?;
        Ok(())
    }

    /// Reads and validates the record at device offset 0.
    ///
    /// # Errors
    ///
    /// Fails when the magic is wrong (not a ShoalKV device), the CRC does
    /// not match (torn or corrupted record), or the version is unknown.
    pub fn read_from(dev: &dyn BlockDevice) -> Result<Self> {
        let mut buf = [0u8; SUPERBLOCK_BYTES];
        dev.read_at(&mut buf, 0)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf[..SUPERBLOCK_BYTES - 4]);
        let computed = hasher.finalize();

        let mut r = &buf[..];
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != SUPERBLOCK_MAGIC {
            bail!("not a shoalkv device (magic {magic:#010x})");
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != SUPERBLOCK_VERSION {
            bail!("unsupported superblock version {version}");
        }
        let bucket_count = r.read_u32::<LittleEndian>()?;
        let segment_size = r.read_u32::<LittleEndian>()?;
        let segment_count = r.read_u32::<LittleEndian>()?;
        let next_seg_id = r.read_u32::<LittleEndian>()?;
        let element_num = r.read_u32::<LittleEndian>()?;
        let data_theory_size = r.read_u64::<LittleEndian>()?;
        let stored_crc = r.read_u32::<LittleEndian>()?;

        if stored_crc != computed {
            bail!(
                "superblock checksum mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"
            );
        }

        Ok(Self {
            bucket_count,
            segment_size,
            segment_count,
            next_seg_id,
            element_num,
            data_theory_size,
        })
    }
}

impl SuperblockState for Superblock {
    fn element_num(&self) -> u32 {
        self.element_num
    }

    fn set_element_num(&mut self, element_num: u32) {
        self.element_num = element_num;
    }

    fn data_theory_size(&self) -> u64 {
        self.data_theory_size
    }

    fn set_data_theory_size(&mut self, data_theory_size: u64) {
        self.data_theory_size = data_theory_size;
    }
}
