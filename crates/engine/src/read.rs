//! Read path: `get()`.
//!
//! A point lookup is one index probe plus, for a live entry, one positioned
//! device read. Tombstones and absent digests both read as `None`.

use anyhow::Result;
use device::BlockDevice;
use fingerprint::Fingerprint;

use crate::Store;

impl<D: BlockDevice> Store<D> {
    /// Looks up a key, returning its value if the key is live.
    ///
    /// A resident tombstone reads as absent, exactly like a key that was
    /// never written.
    ///
    /// # Errors
    ///
    /// Returns an error only on device I/O failure.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let digest = Fingerprint::of(key);
        let Some(entry) = self.index.get(&digest) else {
            return Ok(None);
        };
        if entry.is_tombstone() {
            return Ok(None);
        }

        let seg_base = self
            .directory
            .offset_of(self.directory.segment_of(entry.header_offset()));
        let mut value = vec![0u8; entry.data_size() as usize];
        self.dev
            .read_at(&mut value, seg_base + u64::from(entry.data_offset()))?;
        Ok(Some(value))
    }

    /// True if a live value exists for `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index
            .get(&Fingerprint::of(key))
            .map(|e| !e.is_tombstone())
            .unwrap_or(false)
    }
}
