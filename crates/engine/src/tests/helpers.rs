use device::MemDevice;
use fingerprint::Fingerprint;

use crate::{Store, StoreOptions};

/// A geometry small enough to exercise sealing and saturation quickly.
pub fn small_options() -> StoreOptions {
    StoreOptions {
        num_objects: 8,
        segment_size: 4096,
        segment_count: 8,
    }
}

pub fn mem_store_with(opts: &StoreOptions) -> Store<MemDevice> {
    let dev = MemDevice::new(opts.required_capacity());
    Store::create(dev, opts).expect("create store")
}

pub fn mem_store() -> Store<MemDevice> {
    mem_store_with(&small_options())
}

/// Keys whose fingerprints land in pairwise-distinct buckets mod
/// `bucket_count`.
pub fn keys_with_distinct_buckets(bucket_count: u64, want: usize) -> Vec<String> {
    let mut seen = vec![false; bucket_count as usize];
    let mut keys = Vec::new();
    let mut i = 0u32;
    while keys.len() < want {
        let key = format!("key{i}");
        let idx = (Fingerprint::of(key.as_bytes()).bucket_hash() % bucket_count) as usize;
        if !seen[idx] {
            seen[idx] = true;
            keys.push(key);
        }
        i += 1;
    }
    keys
}
