use std::sync::{Arc, Mutex};

use device::{BlockDevice, MemDevice};
use fingerprint::Fingerprint;

use crate::entry::{DataHeader, HashEntry, HashEntryOnDisk, DATA_HEADER_SIZE};
use crate::stamp::{KvTime, LogicStamp};
use crate::table::{DeadSpaceTracker, HashIndex, IndexError, SuperblockState};

/// Records every death-entry report as `(header_offset, data_size)`.
#[derive(Default)]
struct DeathLog(Mutex<Vec<(u64, u16)>>);

impl DeadSpaceTracker for DeathLog {
    fn modify_death_entry(&self, entry: &HashEntry) {
        self.0
            .lock()
            .unwrap()
            .push((entry.header_offset(), entry.data_size()));
    }
}

impl DeathLog {
    fn calls(&self) -> Vec<(u64, u16)> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Counters {
    element_num: u32,
    data_theory_size: u64,
}

impl SuperblockState for Counters {
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

fn stamp(secs: i64, no: i32) -> LogicStamp {
    LogicStamp::new(KvTime::from_secs(secs), no)
}

fn entry(key: &[u8], data_size: u16, header_offset: u64, stamp: LogicStamp) -> HashEntry {
    HashEntry::new(
        HashEntryOnDisk::new(
            DataHeader::new(Fingerprint::of(key), data_size, 0, 0),
            header_offset,
        ),
        stamp,
    )
}

fn dump(index: &HashIndex) -> Vec<(usize, HashEntryOnDisk)> {
    let mut out = Vec::new();
    index.for_each(|idx, e| out.push((idx, e.on_disk)));
    out
}

/// Keys whose digests land in `want` pairwise-distinct buckets.
fn keys_with_distinct_buckets(bucket_count: u64, want: usize) -> Vec<String> {
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

/// Two distinct keys colliding into the same bucket.
fn two_keys_same_bucket(bucket_count: u64) -> (String, String) {
    let mut by_bucket: Vec<Option<String>> = vec![None; bucket_count as usize];
    for i in 0.. {
        let key = format!("collide{i}");
        let idx = (Fingerprint::of(key.as_bytes()).bucket_hash() % bucket_count) as usize;
        match &by_bucket[idx] {
            Some(first) => return (first.clone(), key),
            None => by_bucket[idx] = Some(key),
        }
    }
    unreachable!()
}

// --------------------- Scenarios S1-S6 ---------------------

#[test]
fn first_put_sizes_table_and_counters() {
    let index = HashIndex::create(0, 5);
    assert_eq!(index.bucket_count(), 8);

    let deaths = DeathLog::default();
    index.update(entry(b"a", 1, 100, stamp(10, 0)), &deaths).unwrap();

    assert_eq!(index.element_count(), 1);
    assert_eq!(index.data_theory_size(), 27);
    assert!(deaths.calls().is_empty());

    let digest = Fingerprint::of(b"a");
    let expected_bucket = (digest.bucket_hash() % 8) as usize;
    let entries = dump(&index);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, expected_bucket);
    assert_eq!(entries[0].1.header.data_size, 1);
}

#[test]
fn newer_reput_replaces_and_reports_old_slot() {
    let index = HashIndex::create(0, 5);
    let deaths = DeathLog::default();

    index.update(entry(b"a", 1, 100, stamp(10, 0)), &deaths).unwrap();
    index.update(entry(b"a", 2, 200, stamp(10, 1)), &deaths).unwrap();

    assert_eq!(index.element_count(), 1);
    assert_eq!(index.data_theory_size(), 28);
    // The superseded slot at offset 100 was reported dead.
    assert_eq!(deaths.calls(), vec![(100, 1)]);
    assert_eq!(index.get(&Fingerprint::of(b"a")).unwrap().data_size(), 2);
}

#[test]
fn stale_put_is_ignored_and_its_slot_dies() {
    let index = HashIndex::create(0, 5);
    let deaths = DeathLog::default();

    index.update(entry(b"a", 1, 100, stamp(10, 0)), &deaths).unwrap();
    index.update(entry(b"a", 2, 200, stamp(10, 1)), &deaths).unwrap();
    // Strictly lesser stamp: the write loses, its own record is dead.
    index.update(entry(b"a", 1, 300, stamp(10, 0)), &deaths).unwrap();

    assert_eq!(index.element_count(), 1);
    assert_eq!(index.data_theory_size(), 28);
    assert_eq!(deaths.calls(), vec![(100, 1), (300, 1)]);

    let resident = index.get(&Fingerprint::of(b"a")).unwrap();
    assert_eq!(resident.data_size(), 2);
    assert_eq!(resident.header_offset(), 200);
}

#[test]
fn tombstone_supersedes_but_stays_resident() {
    let index = HashIndex::create(0, 5);
    let deaths = DeathLog::default();

    index.update(entry(b"a", 2, 200, stamp(10, 1)), &deaths).unwrap();
    index.update(entry(b"a", 0, 400, stamp(11, 0)), &deaths).unwrap();

    assert_eq!(index.element_count(), 1);
    assert_eq!(index.data_theory_size(), 0);

    let resident = index.get(&Fingerprint::of(b"a")).unwrap();
    assert!(resident.is_tombstone());
    assert_eq!(resident.data_size(), 0);
}

#[test]
fn snapshot_round_trip_restores_tombstone_state() {
    let index = HashIndex::create(4096, 5);
    let deaths = DeathLog::default();
    index.update(entry(b"a", 2, 200, stamp(10, 1)), &deaths).unwrap();
    index.update(entry(b"a", 0, 400, stamp(11, 0)), &deaths).unwrap();

    let dev = MemDevice::new(64 * 1024);
    let mut sb = Counters::default();
    index.write(&dev, &mut sb).unwrap();
    assert_eq!(sb.element_num, 1);
    assert_eq!(sb.data_theory_size, 0);

    let loaded = HashIndex::load(&dev, 4096, 8, &sb).unwrap();
    assert_eq!(loaded.element_count(), 1);
    assert_eq!(loaded.data_theory_size(), 0);
    assert_eq!(dump(&loaded), dump(&index));
}

#[test]
fn saturated_table_rejects_new_keys_only() {
    let index = HashIndex::create(0, 8);
    assert_eq!(index.bucket_count(), 8);
    let deaths = DeathLog::default();

    let keys = keys_with_distinct_buckets(8, 8);
    for (i, key) in keys.iter().enumerate() {
        index
            .update(entry(key.as_bytes(), 1, i as u64 * 100, stamp(10, i as i32)), &deaths)
            .unwrap();
    }
    assert_eq!(index.element_count(), 8);

    let overflow = index.update(entry(b"one-too-many", 1, 900, stamp(11, 0)), &deaths);
    assert!(matches!(overflow, Err(IndexError::Full(8))));
    assert_eq!(index.element_count(), 8);

    // Replacing a resident digest still succeeds at full capacity.
    index
        .update(entry(keys[0].as_bytes(), 3, 1000, stamp(12, 0)), &deaths)
        .unwrap();
    assert_eq!(index.element_count(), 8);
    assert_eq!(
        index.get(&Fingerprint::of(keys[0].as_bytes())).unwrap().data_size(),
        3
    );
}

// --------------------- Universal invariants ---------------------

#[test]
fn every_digest_lives_in_its_hash_bucket() {
    let index = HashIndex::create(0, 64);
    let deaths = DeathLog::default();

    for i in 0..50u32 {
        let key = format!("partition{i}");
        index
            .update(entry(key.as_bytes(), 4, u64::from(i) * 30, stamp(10, i as i32)), &deaths)
            .unwrap();
    }

    let mut seen = 0;
    index.for_each(|idx, e| {
        assert_eq!(idx as u64, e.digest().bucket_hash() % 64);
        seen += 1;
    });
    assert_eq!(seen, 50);
}

#[test]
fn counters_match_chain_contents() {
    let index = HashIndex::create(0, 16);
    let deaths = DeathLog::default();

    // Mixed traffic: fresh puts, re-puts, tombstones, a resurrection.
    for i in 0..12u32 {
        let key = format!("mix{i}");
        index
            .update(entry(key.as_bytes(), (i % 5 + 1) as u16, u64::from(i) * 40, stamp(10, i as i32)), &deaths)
            .unwrap();
    }
    index.update(entry(b"mix3", 9, 2000, stamp(11, 0)), &deaths).unwrap();
    index.update(entry(b"mix7", 0, 2100, stamp(11, 1)), &deaths).unwrap();
    index.update(entry(b"mix7", 6, 2200, stamp(11, 2)), &deaths).unwrap();
    index.update(entry(b"mix9", 0, 2300, stamp(11, 3)), &deaths).unwrap();

    let mut count = 0u32;
    let mut live = 0u64;
    index.for_each(|_, e| {
        count += 1;
        live += e.live_bytes();
    });
    assert_eq!(index.element_count(), count);
    assert_eq!(index.data_theory_size(), live);
}

#[test]
fn larger_stamp_wins_regardless_of_arrival_order() {
    let older = entry(b"ordered", 3, 100, stamp(10, 2));
    let newer = entry(b"ordered", 5, 200, stamp(10, 7));

    let forward = HashIndex::create(0, 4);
    let deaths = DeathLog::default();
    forward.update(older.clone(), &deaths).unwrap();
    forward.update(newer.clone(), &deaths).unwrap();

    let reversed = HashIndex::create(0, 4);
    reversed.update(newer.clone(), &deaths).unwrap();
    reversed.update(older.clone(), &deaths).unwrap();

    assert_eq!(dump(&forward), dump(&reversed));
    let resident = forward.get(&Fingerprint::of(b"ordered")).unwrap();
    assert_eq!(resident.header_offset(), 200);
    assert_eq!(resident.data_size(), 5);
    assert_eq!(forward.data_theory_size(), reversed.data_theory_size());
}

#[test]
fn replaying_an_update_changes_nothing() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();
    let put = entry(b"twice", 5, 100, stamp(10, 0));

    index.update(put.clone(), &deaths).unwrap();
    let before = dump(&index);
    let size_before = index.data_theory_size();

    // Equal stamps mean the replay "wins" and replaces in place; the death
    // report targets the now-stale first copy of the same slot.
    index.update(put, &deaths).unwrap();
    assert_eq!(dump(&index), before);
    assert_eq!(index.data_theory_size(), size_before);
    assert_eq!(index.element_count(), 1);
    assert_eq!(deaths.calls(), vec![(100, 5)]);
}

#[test]
fn snapshot_round_trip_preserves_chains_and_counters() {
    let index = HashIndex::create(0, 16);
    let deaths = DeathLog::default();

    let (first, second) = two_keys_same_bucket(16);
    index.update(entry(first.as_bytes(), 3, 100, stamp(10, 0)), &deaths).unwrap();
    index.update(entry(second.as_bytes(), 4, 200, stamp(10, 1)), &deaths).unwrap();
    index.update(entry(b"solo", 5, 300, stamp(10, 2)), &deaths).unwrap();
    index.update(entry(b"gone", 2, 400, stamp(10, 3)), &deaths).unwrap();
    index.update(entry(b"gone", 0, 500, stamp(10, 4)), &deaths).unwrap();

    let dev = MemDevice::new(64 * 1024);
    let mut sb = Counters::default();
    index.write(&dev, &mut sb).unwrap();

    let loaded = HashIndex::load(&dev, 0, 16, &sb).unwrap();
    assert_eq!(dump(&loaded), dump(&index));
    assert_eq!(loaded.element_count(), index.element_count());
    assert_eq!(loaded.data_theory_size(), index.data_theory_size());

    // Loaded entries carry the snapshot time and a zero ordinal.
    loaded.for_each(|_, e| {
        assert!(e.stamp.seg_time.as_secs() > 0);
        assert_eq!(e.stamp.seg_key_no, 0);
        assert_eq!(e.cache_hint, 0);
    });
}

// --------------------- Update protocol edges ---------------------

#[test]
fn tombstone_for_absent_key_is_recorded_not_inserted() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();

    index.update(entry(b"ghost", 0, 700, stamp(10, 0)), &deaths).unwrap();

    assert_eq!(index.element_count(), 0);
    assert_eq!(index.data_theory_size(), 0);
    assert!(index.get(&Fingerprint::of(b"ghost")).is_none());
    assert_eq!(deaths.calls(), vec![(700, 0)]);
}

#[test]
fn tombstone_for_absent_key_bypasses_capacity() {
    let index = HashIndex::create(0, 2);
    let deaths = DeathLog::default();

    for key in keys_with_distinct_buckets(2, 2) {
        index.update(entry(key.as_bytes(), 1, 0, stamp(10, 0)), &deaths).unwrap();
    }
    assert_eq!(index.element_count(), 2);

    // The table is saturated, but an absent-key delete never inserts.
    index.update(entry(b"not-here", 0, 50, stamp(11, 0)), &deaths).unwrap();
    assert_eq!(index.element_count(), 2);
}

#[test]
fn resurrection_after_delete_restores_accounting() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();

    index.update(entry(b"back", 4, 100, stamp(10, 0)), &deaths).unwrap();
    index.update(entry(b"back", 0, 200, stamp(10, 1)), &deaths).unwrap();
    assert_eq!(index.data_theory_size(), 0);

    index.update(entry(b"back", 6, 300, stamp(10, 2)), &deaths).unwrap();
    assert_eq!(index.element_count(), 1);
    assert_eq!(index.data_theory_size(), DATA_HEADER_SIZE as u64 + 6);
}

// --------------------- Reclaimer hooks ---------------------

#[test]
fn remove_entry_takes_only_matching_tombstones() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();

    index.update(entry(b"live", 3, 100, stamp(10, 0)), &deaths).unwrap();
    index.update(entry(b"dead", 2, 200, stamp(10, 1)), &deaths).unwrap();
    index.update(entry(b"dead", 0, 300, stamp(20, 0)), &deaths).unwrap();

    // A live entry is never removed.
    assert!(!index.remove_entry(&entry(b"live", 0, 100, stamp(10, 0))));
    // A tombstone from a different segment time is not the one the
    // reclaimer saw.
    assert!(!index.remove_entry(&entry(b"dead", 0, 300, stamp(21, 0))));
    assert_eq!(index.element_count(), 2);

    assert!(index.remove_entry(&entry(b"dead", 0, 300, stamp(20, 5))));
    assert_eq!(index.element_count(), 1);
    assert!(index.get(&Fingerprint::of(b"dead")).is_none());
}

#[test]
fn is_same_in_mem_tracks_the_resident_slot() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();

    index.update(entry(b"k", 3, 100, stamp(10, 0)), &deaths).unwrap();
    assert!(index.is_same_in_mem(&entry(b"k", 3, 100, stamp(10, 0))));

    index.update(entry(b"k", 3, 500, stamp(10, 1)), &deaths).unwrap();
    assert!(!index.is_same_in_mem(&entry(b"k", 3, 100, stamp(10, 0))));
    assert!(index.is_same_in_mem(&entry(b"k", 3, 500, stamp(10, 1))));

    assert!(!index.is_same_in_mem(&entry(b"absent", 3, 100, stamp(10, 0))));
}

// --------------------- Snapshot I/O failure modes ---------------------

#[test]
fn load_rejects_superblock_mismatch() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();
    index.update(entry(b"a", 1, 100, stamp(10, 0)), &deaths).unwrap();

    let dev = MemDevice::new(64 * 1024);
    let mut sb = Counters::default();
    index.write(&dev, &mut sb).unwrap();

    sb.element_num = 7;
    let err = HashIndex::load(&dev, 0, 4, &sb).unwrap_err();
    assert!(matches!(err, IndexError::Corrupt(_)));
}

#[test]
fn load_rejects_negative_chain_length() {
    let dev = MemDevice::new(64 * 1024);
    // Timestamp, then a count table whose first slot is -1.
    dev.write_at(&1_000_000i64.to_le_bytes(), 0).unwrap();
    dev.write_at(&(-1i32).to_le_bytes(), 8).unwrap();

    let sb = Counters::default();
    let err = HashIndex::load(&dev, 0, 4, &sb).unwrap_err();
    assert!(matches!(err, IndexError::Corrupt(_)));
}

#[test]
fn load_rejects_bad_bucket_count() {
    let dev = MemDevice::new(4096);
    let sb = Counters::default();
    assert!(matches!(
        HashIndex::load(&dev, 0, 0, &sb),
        Err(IndexError::Corrupt(_))
    ));
    assert!(matches!(
        HashIndex::load(&dev, 0, 6, &sb),
        Err(IndexError::Corrupt(_))
    ));
}

#[test]
fn load_propagates_short_reads() {
    // Device too small for even the count table.
    let dev = MemDevice::new(16);
    let sb = Counters::default();
    assert!(matches!(
        HashIndex::load(&dev, 0, 8, &sb),
        Err(IndexError::Device(_))
    ));
}

// --------------------- Sizing ---------------------

#[test]
fn snapshot_sizing_formulas() {
    // 8 + 34 * 8 = 280 -> one page.
    assert_eq!(HashIndex::reserved_size_on_device(8), 4096);
    // 8 + 34 * 1024 = 34824 -> nine pages.
    assert_eq!(HashIndex::reserved_size_on_device(1024), 36864);
    // Worst case adds the count table: 8 + 38 * 1024 = 38920 -> ten pages.
    assert_eq!(HashIndex::worst_case_size_on_device(1024), 40960);
    assert_eq!(HashIndex::worst_case_size_on_device(8), 4096);
}

#[test]
fn written_image_is_zero_padded_to_its_region() {
    let index = HashIndex::create(0, 4);
    let deaths = DeathLog::default();
    index.update(entry(b"a", 1, 100, stamp(10, 0)), &deaths).unwrap();

    let dev = MemDevice::new(8192);
    let mut sb = Counters::default();
    index.write(&dev, &mut sb).unwrap();

    let bytes = dev.snapshot();
    // One timestamp, four counts, one entry; everything after is zero.
    let used = 8 + 4 * 4 + 34;
    assert!(bytes[used..4096].iter().all(|&b| b == 0));
}

// --------------------- Concurrency ---------------------

#[test]
fn concurrent_updates_converge_on_the_largest_stamp() {
    let index = Arc::new(HashIndex::create(0, 16));
    let deaths = Arc::new(DeathLog::default());

    std::thread::scope(|scope| {
        for no in 0..8i32 {
            let index = Arc::clone(&index);
            let deaths = Arc::clone(&deaths);
            scope.spawn(move || {
                index
                    .update(
                        entry(b"contended", (no + 1) as u16, u64::from(no as u32) * 100, stamp(50, no)),
                        &*deaths,
                    )
                    .unwrap();
            });
        }
    });

    let resident = index.get(&Fingerprint::of(b"contended")).unwrap();
    assert_eq!(resident.stamp, stamp(50, 7));
    assert_eq!(resident.data_size(), 8);
    assert_eq!(index.element_count(), 1);
    // Seven losers, each reported dead exactly once.
    assert_eq!(deaths.calls().len(), 7);
}
