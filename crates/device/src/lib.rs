//! # Device - Block-Device Abstraction
//!
//! Positioned read/write over a byte-addressed device, the contract the rest
//! of ShoalKV is written against.
//!
//! Both operations are **full-length**: a read or write that moves fewer
//! bytes than requested is an error, never a partial success. This mirrors
//! the `pread`/`pwrite` discipline the store expects from a raw device.
//!
//! Two implementations are provided:
//!
//! * [`FileDevice`] - backed by a regular file or a raw device node, using
//!   the platform's positioned I/O so concurrent readers never fight over a
//!   shared cursor.
//! * [`MemDevice`] - a fixed-size in-memory buffer for tests and tooling.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

/// Errors surfaced by device I/O.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// An underlying I/O error, including short transfers reported by the OS.
    #[error("device io: {0}")]
    Io(#[from] io::Error),

    /// The requested range does not lie inside the device.
    #[error("device range out of bounds: {len} bytes at offset {offset} (capacity {capacity})")]
    OutOfBounds {
        /// Requested start offset.
        offset: u64,
        /// Requested transfer length.
        len: usize,
        /// Total device capacity in bytes.
        capacity: u64,
    },
}

/// A byte-addressed device with positioned, full-length reads and writes.
pub trait BlockDevice: Send + Sync {
    /// Fills `buf` from the device starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), DeviceError>;

    /// Writes all of `buf` to the device starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), DeviceError>;

    /// Forces written data down to stable storage.
    fn sync(&self) -> Result<(), DeviceError>;

    /// Total capacity in bytes.
    fn capacity(&self) -> u64;
}

/// A device backed by a regular file or a raw device node.
///
/// Uses `pread`/`pwrite` (via [`std::os::unix::fs::FileExt`]), so calls carry
/// their own offset and the kernel file cursor is never shared state.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    capacity: u64,
}

impl FileDevice {
    /// Creates (or truncates) a file-backed device of `capacity` bytes.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self { file, capacity })
    }

    /// Opens an existing device file. Capacity is taken from the file length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len();
        Ok(Self { file, capacity })
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), DeviceError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), DeviceError> {
        use std::os::unix::fs::FileExt;
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), DeviceError> {
        use std::os::unix::fs::FileExt;
        self.check_range(offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), DeviceError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A fixed-size in-memory device.
///
/// Behaves exactly like [`FileDevice`] at the contract level (bounds-checked,
/// full-length transfers) without touching the filesystem. Tests use it to
/// exercise snapshot round-trips and corruption handling byte-for-byte.
#[derive(Debug)]
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    capacity: u64,
}

impl MemDevice {
    /// Creates a zero-filled in-memory device of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; capacity as usize]),
            capacity,
        }
    }

    /// Copies out the raw contents. Test helper.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), DeviceError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                len,
                capacity: self.capacity,
            }),
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), DeviceError> {
        self.check_range(offset, buf.len())?;
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), DeviceError> {
        self.check_range(offset, buf.len())?;
        let mut bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}
