//! Record headers and index entries, in-memory and on-device forms.
//!
//! ## Wire formats (all little-endian, packed)
//!
//! ```text
//! DataHeader (26 bytes):
//!   [key_digest: 16][data_size: u16][data_offset: u32][next_header_offset: u32]
//!
//! HashEntryOnDisk (34 bytes):
//!   [DataHeader: 26][header_offset: u64]
//! ```
//!
//! `data_offset` and `next_header_offset` are relative to the record's
//! segment; `header_offset` is the absolute device offset of the header.
//! Both structs are serialized field-by-field; the in-memory layout is
//! never written raw.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fingerprint::{Fingerprint, FINGERPRINT_SIZE};

use crate::stamp::LogicStamp;

/// Serialized width of a [`DataHeader`].
pub const DATA_HEADER_SIZE: usize = FINGERPRINT_SIZE + 2 + 4 + 4; // 26

/// Serialized width of a [`HashEntryOnDisk`].
pub const HASH_ENTRY_DISK_SIZE: usize = DATA_HEADER_SIZE + 8; // 34

/// The fixed header preceding every record in a segment's header stream.
///
/// A `data_size` of zero marks a deletion record (tombstone): no value bytes
/// exist and the header's only purpose is to advance its digest's
/// [`LogicStamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub key_digest: Fingerprint,
    pub data_size: u16,
    pub data_offset: u32,
    pub next_header_offset: u32,
}

impl DataHeader {
    pub fn new(
        key_digest: Fingerprint,
        data_size: u16,
        data_offset: u32,
        next_header_offset: u32,
    ) -> Self {
        Self {
            key_digest,
            data_size,
            data_offset,
            next_header_offset,
        }
    }

    /// Serializes the header, little-endian, field by field.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.key_digest.as_bytes())?;
        w.write_u16::<LittleEndian>(self.data_size)?;
        w.write_u32::<LittleEndian>(self.data_offset)?;
        w.write_u32::<LittleEndian>(self.next_header_offset)?;
        Ok(())
    }

    /// Encodes the header into its fixed wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[..FINGERPRINT_SIZE].copy_from_slice(self.key_digest.as_bytes());
        buf[16..18].copy_from_slice(&self.data_size.to_le_bytes());
        buf[18..22].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[22..26].copy_from_slice(&self.next_header_offset.to_le_bytes());
        buf
    }

    /// Decodes a header from its fixed wire form.
    #[must_use]
    pub fn from_bytes(buf: &[u8; DATA_HEADER_SIZE]) -> Self {
        let mut digest = [0u8; FINGERPRINT_SIZE];
        digest.copy_from_slice(&buf[..FINGERPRINT_SIZE]);
        Self {
            key_digest: Fingerprint::from_bytes(digest),
            data_size: u16::from_le_bytes([buf[16], buf[17]]),
            data_offset: u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]),
            next_header_offset: u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]),
        }
    }

    /// Decodes a header from its wire form.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut digest = [0u8; FINGERPRINT_SIZE];
        r.read_exact(&mut digest)?;
        let data_size = r.read_u16::<LittleEndian>()?;
        let data_offset = r.read_u32::<LittleEndian>()?;
        let next_header_offset = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            key_digest: Fingerprint::from_bytes(digest),
            data_size,
            data_offset,
            next_header_offset,
        })
    }
}

/// The persisted form of an index entry: a record header plus the absolute
/// device offset that header lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashEntryOnDisk {
    pub header: DataHeader,
    pub header_offset: u64,
}

impl HashEntryOnDisk {
    pub fn new(header: DataHeader, header_offset: u64) -> Self {
        Self {
            header,
            header_offset,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.write_to(w)?;
        w.write_u64::<LittleEndian>(self.header_offset)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let header = DataHeader::read_from(r)?;
        let header_offset = r.read_u64::<LittleEndian>()?;
        Ok(Self {
            header,
            header_offset,
        })
    }
}

/// An in-memory index entry: the on-device part, the logical stamp that
/// orders it against other updates to the same digest, and an opaque handle
/// reserved for an external read cache.
///
/// The cache hint is preserved across copies but is not persisted, never
/// interpreted here, and resets to zero on load.
///
/// Equality considers the key digest only: two entries for the same key are
/// "equal" no matter which record they point at.
#[derive(Debug, Clone)]
pub struct HashEntry {
    pub on_disk: HashEntryOnDisk,
    pub stamp: LogicStamp,
    pub cache_hint: u64,
}

impl HashEntry {
    pub fn new(on_disk: HashEntryOnDisk, stamp: LogicStamp) -> Self {
        Self {
            on_disk,
            stamp,
            cache_hint: 0,
        }
    }

    #[must_use]
    pub fn digest(&self) -> &Fingerprint {
        &self.on_disk.header.key_digest
    }

    #[must_use]
    pub fn data_size(&self) -> u16 {
        self.on_disk.header.data_size
    }

    #[must_use]
    pub fn data_offset(&self) -> u32 {
        self.on_disk.header.data_offset
    }

    #[must_use]
    pub fn header_offset(&self) -> u64 {
        self.on_disk.header_offset
    }

    /// True for deletion records (`data_size == 0`).
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.on_disk.header.data_size == 0
    }

    /// The entry's contribution to `data_theory_size`: zero for a tombstone,
    /// otherwise header plus value bytes.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        if self.is_tombstone() {
            0
        } else {
            DATA_HEADER_SIZE as u64 + u64::from(self.on_disk.header.data_size)
        }
    }
}

impl PartialEq for HashEntry {
    fn eq(&self, other: &Self) -> bool {
        self.digest() == other.digest()
    }
}

impl Eq for HashEntry {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::KvTime;

    #[test]
    fn wire_widths_are_fixed() {
        assert_eq!(DATA_HEADER_SIZE, 26);
        assert_eq!(HASH_ENTRY_DISK_SIZE, 34);

        let on_disk = HashEntryOnDisk::new(
            DataHeader::new(Fingerprint::of(b"k"), 7, 1000, 26),
            0xDEAD_BEEF,
        );
        let mut buf = Vec::new();
        on_disk.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HASH_ENTRY_DISK_SIZE);
    }

    #[test]
    fn on_disk_round_trip_is_field_exact() {
        let on_disk = HashEntryOnDisk::new(
            DataHeader::new(Fingerprint::of(b"key"), 512, 0xAABB, 52),
            1 << 40,
        );

        let mut buf = Vec::new();
        on_disk.write_to(&mut buf).unwrap();
        let decoded = HashEntryOnDisk::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded, on_disk);

        // Spot-check the little-endian placement of data_size right after
        // the digest.
        assert_eq!(&buf[16..18], &512u16.to_le_bytes());
    }

    #[test]
    fn entry_equality_is_digest_only() {
        let digest = Fingerprint::of(b"same");
        let a = HashEntry::new(
            HashEntryOnDisk::new(DataHeader::new(digest, 1, 10, 0), 100),
            LogicStamp::new(KvTime::from_secs(1), 0),
        );
        let b = HashEntry::new(
            HashEntryOnDisk::new(DataHeader::new(digest, 99, 7000, 26), 9999),
            LogicStamp::new(KvTime::from_secs(5), 3),
        );
        assert_eq!(a, b);

        let c = HashEntry::new(
            HashEntryOnDisk::new(DataHeader::new(Fingerprint::of(b"other"), 1, 10, 0), 100),
            a.stamp,
        );
        assert_ne!(a, c);
    }

    #[test]
    fn live_bytes_contribution() {
        let digest = Fingerprint::of(b"k");
        let live = HashEntry::new(
            HashEntryOnDisk::new(DataHeader::new(digest, 10, 0, 0), 0),
            LogicStamp::default(),
        );
        assert_eq!(live.live_bytes(), 36);

        let tombstone = HashEntry::new(
            HashEntryOnDisk::new(DataHeader::new(digest, 0, 0, 0), 0),
            LogicStamp::default(),
        );
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.live_bytes(), 0);
    }
}
