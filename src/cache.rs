//! Bounded evaluation cache.
//!
//! Maps position fingerprints to network evaluation records. Sharded to
//! keep lock contention low at batch sizes in the 32-512 range: each shard
//! is a mutex-protected map with approximate LRU eviction (a lazy queue of
//! access stamps; stale queue entries are skipped at eviction time).
//!
//! Records are handed out as `Arc` clones taken under the shard lock, so a
//! reader can never observe a torn entry. Lookups verify the stored full
//! position against the probe, so a fingerprint collision can never return
//! a foreign record.

use crate::eval::EvalRecord;
use crate::position::VerifyKey;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SHARD_COUNT: usize = 16;

pub struct EvalCache {
    shards: Vec<Mutex<Shard>>,
    capacity: AtomicUsize,
}

struct Shard {
    map: HashMap<u64, Entry>,
    queue: VecDeque<(u64, u64)>,
    clock: u64,
}

struct Entry {
    record: Arc<EvalRecord>,
    stamp: u64,
}

impl EvalCache {
    pub fn new(capacity: usize) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::new(),
                    queue: VecDeque::new(),
                    clock: 0,
                })
            })
            .collect();
        EvalCache {
            shards,
            capacity: AtomicUsize::new(capacity.max(SHARD_COUNT)),
        }
    }

    /// Returns the stored record only if the stored position matches the
    /// probe exactly. Touches the entry for LRU purposes.
    pub fn lookup(&self, fingerprint: u64, key: &VerifyKey) -> Option<Arc<EvalRecord>> {
        let mut shard = self.shard(fingerprint).lock().unwrap();
        shard.clock += 1;
        let stamp = shard.clock;
        let entry = shard.map.get_mut(&fingerprint)?;
        if entry.record.verify != *key {
            return None;
        }
        entry.stamp = stamp;
        let record = entry.record.clone();
        shard.queue.push_back((fingerprint, stamp));
        Some(record)
    }

    /// Inserts or refreshes a record; evicts approximately-least-recently
    /// used entries when the shard exceeds its share of the capacity.
    pub fn insert(&self, fingerprint: u64, record: Arc<EvalRecord>) {
        let per_shard = self.per_shard_capacity();
        let mut shard = self.shard(fingerprint).lock().unwrap();
        shard.clock += 1;
        let stamp = shard.clock;
        shard.map.insert(fingerprint, Entry { record, stamp });
        shard.queue.push_back((fingerprint, stamp));
        while shard.map.len() > per_shard {
            if !shard.evict_one() {
                break;
            }
        }
        if shard.queue.len() > 8 * per_shard + 64 {
            shard.compact();
        }
    }

    /// Reconfigure the capacity. Shrinking drops excess entries
    /// synchronously before returning.
    pub fn set_capacity(&self, entries: usize) {
        self.capacity
            .store(entries.max(SHARD_COUNT), Ordering::Relaxed);
        let per_shard = self.per_shard_capacity();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            while shard.map.len() > per_shard {
                if !shard.evict_one() {
                    break;
                }
            }
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            shard.map.clear();
            shard.queue.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().map.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Cache occupancy in permille, for `info ... hashfull` reporting.
    pub fn fullness_permille(&self) -> u32 {
        let cap = self.capacity();
        if cap == 0 {
            return 0;
        }
        ((self.len() * 1000) / cap).min(1000) as u32
    }

    fn per_shard_capacity(&self) -> usize {
        (self.capacity.load(Ordering::Relaxed) / SHARD_COUNT).max(1)
    }

    fn shard(&self, fingerprint: u64) -> &Mutex<Shard> {
        // High bits: the low bits feed the shard maps' hashing.
        let idx = (fingerprint >> 59) as usize % SHARD_COUNT;
        &self.shards[idx]
    }
}

impl Shard {
    /// Pop queue entries until one still matches its map stamp, then evict
    /// it. Stale queue entries (touched since queued) are discarded.
    fn evict_one(&mut self) -> bool {
        while let Some((fp, stamp)) = self.queue.pop_front() {
            match self.map.get(&fp) {
                Some(entry) if entry.stamp == stamp => {
                    self.map.remove(&fp);
                    return true;
                }
                _ => continue,
            }
        }
        false
    }

    /// Drop queue entries that no longer match their map stamp. Bounds the
    /// queue under lookup-heavy workloads.
    fn compact(&mut self) {
        let map = &self.map;
        self.queue
            .retain(|(fp, stamp)| matches!(map.get(fp), Some(e) if e.stamp == *stamp));
    }
}
