// Package keytable provides the shard: one independently locked
// open-addressing table of packed entries.
//
// Open addressing with linear probing. A single hashing of the incoming key
// serves insertion, search and deletion; rehashing recovers per-entry hashes
// from the packed metadata while the table is small enough (the fast regime)
// and from the record's cached hash once it is not. Deletion restores the
// probe invariant by backshifting displaced entries instead of leaving
// tombstones, so the load factor stays an honest predictor of probe length.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;

use super::entry::{Entry, METADATA_MASK};
use super::handle::Handle;
use super::layout::Layout;
use super::stats::{LongStats, Stats};
use super::table::KeyTable;

/// Smallest slot count a shard ever uses.
pub(crate) const MIN_CAPACITY: usize = 4;

// Capacity bound of the fast regime: below it the packed 19 metadata bits
// reconstruct every probe hash without touching the record. Non-const so
// unit tests can lower it.
static MAX_FAST_TABLE_SIZE: AtomicUsize = AtomicUsize::new((METADATA_MASK + 1) as usize);

/// Lowers (or restores) the fast-regime capacity bound. Unit test hook,
/// never called by production code.
pub fn set_max_fast_table_size(size: usize) {
    assert!(size >= MIN_CAPACITY && size as u64 <= METADATA_MASK + 1);
    MAX_FAST_TABLE_SIZE.store(size, Ordering::Relaxed);
}

#[inline]
pub(crate) fn max_fast_table_size() -> usize {
    MAX_FAST_TABLE_SIZE.load(Ordering::Relaxed)
}

/// Shard state guarded by the mutex.
pub(crate) struct ShardData {
    capacity: usize,
    size: usize,
    bytes: usize,
    handles: usize,
    max_search: usize,
    rehashes: u32,
    entries: *mut Entry,
}

// The raw entry array and the records it points at are only touched while
// holding the mutex around this struct.
unsafe impl Send for ShardData {}

/// One independently locked segment of the table.
pub(crate) struct Shard {
    id: usize,
    pub(crate) data: Mutex<ShardData>,
}

impl ShardData {
    #[inline]
    fn entry(&self, ix: usize) -> Entry {
        debug_assert!(ix < self.capacity);
        unsafe { *self.entries.add(ix) }
    }

    #[inline]
    fn set_entry(&mut self, ix: usize, e: Entry) {
        debug_assert!(ix < self.capacity);
        unsafe { *self.entries.add(ix) = e }
    }

    #[inline]
    fn load_factor(&self) -> f64 {
        self.size as f64 / self.capacity as f64
    }

    #[inline]
    fn hash_index(&self, hash: u64) -> usize {
        (hash % self.capacity as u64) as usize
    }

    #[inline]
    fn next_index(&self, ix: usize) -> usize {
        let ix = ix + 1;
        if ix >= self.capacity {
            0
        } else {
            ix
        }
    }

    /// Recovers the probe hash of a live entry. In the fast regime the
    /// packed metadata suffices and the record's cache line stays cold;
    /// beyond it the record's cached hash is fetched.
    fn entry_hash(&self, e: Entry) -> u64 {
        if self.capacity < max_fast_table_size() {
            debug_assert_eq!(
                unsafe { e.layout() }.original_hash() & METADATA_MASK,
                e.metadata()
            );
            e.metadata()
        } else {
            let hash = unsafe { e.layout() }.original_hash();
            assert_eq!(hash & METADATA_MASK, e.metadata());
            hash
        }
    }

    /// Increments (with wraparound) to get from `from` to `to`.
    fn forward_distance(&self, from: usize, to: usize) -> usize {
        let result = if from <= to {
            to - from
        } else {
            (to + self.capacity) - from
        };
        debug_assert!(result < self.capacity);
        result
    }

    /// Installs a fresh zeroed slot array of at least [`MIN_CAPACITY`] slots.
    /// The previous array, if any, is the caller's to redistribute and free.
    fn make_table(&mut self, cfg: &Config, new_capacity: usize) {
        let new_capacity = new_capacity.max(MIN_CAPACITY);
        assert_ne!(new_capacity, self.capacity);
        self.capacity = new_capacity;
        let raw = (cfg.alloc)(new_capacity * std::mem::size_of::<Entry>());
        assert!(!raw.is_null(), "allocator returned null");
        self.entries = raw as *mut Entry;
        unsafe { std::ptr::write_bytes(self.entries, 0, new_capacity) };
    }

    /// Synchronous rehash to `new_capacity` slots. Entry words move as-is:
    /// refcounts are untouched and record identity is preserved.
    fn resize(&mut self, cfg: &Config, new_capacity: usize, shard_id: usize) {
        let started = (cfg.clock)();
        let new_capacity = new_capacity.max(MIN_CAPACITY);
        if new_capacity == self.capacity {
            return;
        }
        assert!(new_capacity >= self.size, "table would not fit its entries");
        self.rehashes += 1;
        let old_entries = self.entries;
        let old_capacity = self.capacity;
        self.make_table(cfg, new_capacity);
        for i in 0..old_capacity {
            let e = unsafe { *old_entries.add(i) };
            if !e.is_set() {
                continue;
            }
            debug_assert!(unsafe { e.layout() }.ref_count() > 0);
            let mut ix = self.hash_index(self.entry_hash(e));
            let mut placed = false;
            for searches in 0..self.capacity {
                if !self.entry(ix).is_set() {
                    self.set_entry(ix, e);
                    self.max_search = self.max_search.max(searches);
                    placed = true;
                    break;
                }
                ix = self.next_index(ix);
            }
            assert!(placed, "rehash found no empty slot");
        }
        (cfg.free)(old_entries as *mut u8);
        let duration = (cfg.clock)().saturating_sub(started).max(1);
        let keys_per_second = (self.size as u64 / duration) * 1000;
        info!(
            shard = shard_id,
            "Keytable Resize to {} completed in {} ms ({} / sec)",
            self.capacity,
            duration,
            keys_per_second
        );
    }
}

impl Shard {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            data: Mutex::new(ShardData {
                capacity: 0,
                size: 0,
                bytes: 0,
                handles: 0,
                max_search: 0,
                rehashes: 0,
                entries: std::ptr::null_mut(),
            }),
        }
    }

    /// First sizing of the slot array, done once at table construction.
    pub(crate) fn init(&self, cfg: &Config) {
        self.data.lock().make_table(cfg, MIN_CAPACITY);
    }

    /// Upserts a string, returning its record with the refcount already
    /// covering the handle about to be constructed.
    pub(crate) fn insert(
        &self,
        t: &KeyTable,
        hash: u64,
        bytes: &[u8],
        noescape: bool,
    ) -> *mut Layout {
        let mut data = self.data.lock();
        let factors = t.factors();
        while data.load_factor() > factors.max_load {
            let grown = data.capacity + std::cmp::max((data.capacity as f64 * factors.grow) as usize, 1);
            let prev = data.capacity;
            data.resize(&t.cfg, grown, self.id);
            if prev < max_fast_table_size() && data.capacity >= max_fast_table_size() {
                warn!(
                    shard = self.id,
                    capacity = data.capacity,
                    "Fast keytable shard size exceeded, increase the shard count to improve performance"
                );
            }
        }
        let mut ix = data.hash_index(hash);
        let metadata = hash & METADATA_MASK;
        for searches in 0..data.capacity {
            let entry = data.entry(ix);
            if !entry.is_set() {
                data.handles += 1;
                data.size += 1;
                data.bytes += bytes.len();
                data.max_search = data.max_search.max(searches);
                let p = Layout::make(t.cfg.alloc, bytes, hash, noescape);
                data.set_entry(ix, Entry::new(p, metadata));
                return p;
            }
            // Metadata early-out keeps misses off the record's cache line.
            if entry.metadata() == metadata {
                let layout = unsafe { entry.layout() };
                if layout.length() == bytes.len() && layout.payload() == bytes {
                    data.max_search = data.max_search.max(searches);
                    data.handles += 1;
                    if layout.incr_ref() {
                        t.stuck_keys.fetch_add(1, Ordering::Relaxed);
                    }
                    return entry.ptr();
                }
            }
            ix = data.next_index(ix);
        }
        panic!("probe limit exhausted inserting into shard {}", self.id);
    }

    /// Takes another reference on the record behind an existing handle.
    pub(crate) fn clone_handle(&self, t: &KeyTable, h: &Handle) -> *mut Layout {
        let mut data = self.data.lock();
        data.handles += 1;
        if h.layout().incr_ref() {
            t.stuck_keys.fetch_add(1, Ordering::Relaxed);
        }
        h.as_layout_ptr() as *mut Layout
    }

    /// Releases one reference. When the count reaches zero the record is
    /// freed, its slot emptied, and the probe invariant restored: no empty
    /// slot may lie between any live key and its native slot.
    pub(crate) fn destroy_handle(&self, t: &KeyTable, h: &mut Handle, hash: u64) {
        let mut data = self.data.lock();
        data.handles -= 1;
        if h.layout().decr_ref() > 0 {
            h.clear();
            return;
        }
        let target = h.as_layout_ptr();
        let mut ix = data.hash_index(hash);
        let mut searches = 0;
        while searches < data.capacity {
            let entry = data.entry(ix);
            if entry.is_set() && entry.ptr() as *const Layout == target {
                assert_eq!(entry.metadata(), hash & METADATA_MASK);
                let layout = unsafe { entry.layout() };
                assert_eq!(layout.ref_count(), 0);
                assert!(data.size > 0);
                let len = layout.length();
                assert!(data.bytes >= len);
                data.bytes -= len;
                data.size -= 1;
                unsafe {
                    Layout::poison_hash(entry.ptr());
                }
                (t.cfg.free)(entry.ptr() as *mut u8);
                h.clear();
                data.set_entry(ix, Entry::empty());
                // Scan forward until the next empty slot, moving any key
                // whose native slot is forward-farther from its current slot
                // than from the hole down into the hole.
                let mut empty_ix = ix;
                ix = data.next_index(ix);
                while data.entry(ix).is_set() {
                    debug_assert!(!data.entry(empty_ix).is_set());
                    debug_assert_ne!(empty_ix, ix);
                    searches += 1;
                    let moving = data.entry(ix);
                    let native = data.hash_index(data.entry_hash(moving));
                    if data.forward_distance(native, ix) > data.forward_distance(native, empty_ix)
                    {
                        data.set_entry(empty_ix, moving);
                        data.set_entry(ix, Entry::empty());
                        empty_ix = ix;
                    }
                    ix = data.next_index(ix);
                }
                data.max_search = data.max_search.max(searches);
                let factors = t.factors();
                if data.load_factor() < factors.min_load && data.capacity > MIN_CAPACITY {
                    let reduction =
                        std::cmp::max((data.capacity as f64 * factors.shrink) as usize, 1);
                    let shrunk = data.capacity - reduction;
                    data.resize(&t.cfg, shrunk, self.id);
                }
                return;
            }
            ix = data.next_index(ix);
            searches += 1;
        }
        panic!("destroyed handle not found in shard {}", self.id);
    }

    /// Structural validation over a quiesced shard. Returns an empty string
    /// on success, a diagnostic otherwise. Test harness support.
    pub(crate) fn validate(&self, t: &KeyTable) -> String {
        let data = self.data.lock();
        let mut this_refs = 0usize;
        let mut this_size = 0usize;
        let mut this_bytes = 0usize;
        for i in 0..data.capacity {
            let e = data.entry(i);
            if !e.is_set() {
                continue;
            }
            let layout = unsafe { e.layout() };
            this_size += 1;
            this_refs += layout.ref_count() as usize;
            this_bytes += layout.length();
            let orig_hash = (t.cfg.hash)(layout.payload());
            let correct_metadata = orig_hash & METADATA_MASK;
            if e.metadata() != correct_metadata {
                return format!(
                    "Found bad metadata in slot {} Metadata:{} Where it should be: {} Hash:{} TableSize:{}",
                    i,
                    e.metadata(),
                    correct_metadata,
                    orig_hash,
                    data.capacity
                );
            }
            // The invariant: every slot on the forward path from this key's
            // native slot to its current slot must be occupied.
            let native = data.hash_index(data.entry_hash(e));
            let mut ix = native;
            while ix != i {
                if !data.entry(ix).is_set() {
                    return format!(
                        "Found invalid empty location at slot {} While validating key in slot {} From NativeSlot:{} TableSize:{}",
                        ix, i, native, data.capacity
                    );
                }
                ix = data.next_index(ix);
            }
        }
        // Summed refcounts only match the handle count while nothing is stuck.
        let stuck = t.stuck_keys.load(Ordering::Relaxed);
        if this_size != data.size
            || (stuck == 0 && this_refs != data.handles)
            || this_bytes != data.bytes
        {
            return format!(
                "Count mismatch for shard: {} Capacity:{} Handles:{} sum(refcounts):{} Size:{} this_size:{} Bytes:{} this_bytes:{}",
                self.id,
                data.capacity,
                data.handles,
                this_refs,
                data.size,
                this_size,
                data.bytes,
                this_bytes
            );
        }
        String::new()
    }

    /// Checks every live record's refcount against a caller-supplied census,
    /// consuming matched entries from the map. Test harness support.
    pub(crate) fn validate_counts(&self, counts: &mut HashMap<*const Layout, usize>) -> String {
        let data = self.data.lock();
        let mut result = String::new();
        for i in 0..data.capacity {
            let e = data.entry(i);
            if !e.is_set() {
                continue;
            }
            let layout = unsafe { e.layout() };
            let key = e.ptr() as *const Layout;
            let expected = counts.get(&key).copied().unwrap_or(0);
            if expected != layout.ref_count() as usize {
                result += &format!(
                    "Found bad count for key: {} Found: {} Expected:{}\n",
                    String::from_utf8_lossy(layout.payload()),
                    layout.ref_count(),
                    expected
                );
            } else {
                counts.remove(&key);
            }
        }
        result
    }

    /// Adds this shard's numbers to the running totals, then resets the
    /// since-last-read counters.
    pub(crate) fn collect_stats(&self, s: &mut Stats) {
        let mut data = self.data.lock();
        s.size += data.size;
        s.bytes += data.bytes;
        s.handles += data.handles;
        s.max_table_size = s.max_table_size.max(data.capacity);
        s.min_table_size = s.min_table_size.min(data.capacity);
        s.total_table += data.capacity;
        s.rehashes += data.rehashes;
        s.max_search = s.max_search.max(data.max_search);
        data.max_search = 0;
        data.rehashes = 0;
    }

    /// Merges this shard's occupied-run lengths into the histogram, keeping
    /// only the `top_n` largest lengths.
    pub(crate) fn collect_long_stats(&self, s: &mut LongStats, top_n: usize) {
        let data = self.data.lock();
        let mut run = 0usize;
        for i in 0..data.capacity {
            if data.entry(i).is_set() {
                run += 1;
            } else if run != 0 {
                Self::record_run(s, run, top_n);
                run = 0;
            }
        }
        // A run touching the end of the array still counts.
        if run != 0 {
            Self::record_run(s, run, top_n);
        }
    }

    fn record_run(s: &mut LongStats, run: usize, top_n: usize) {
        *s.runs.entry(run).or_insert(0) += 1;
        while s.runs.len() > top_n {
            s.runs.pop_first();
        }
    }

    /// Tears the shard down with the table. Every surviving record must be
    /// stuck; anything else means a leaked live handle.
    pub(crate) fn destroy(&self, cfg: &Config) {
        let mut data = self.data.lock();
        for i in 0..data.capacity {
            let e = data.entry(i);
            if e.is_set() {
                assert!(unsafe { e.layout() }.is_stuck(), "live key survived table teardown");
                (cfg.free)(e.ptr() as *mut u8);
                data.set_entry(i, Entry::empty());
            }
        }
        (cfg.free)(data.entries as *mut u8);
        data.entries = std::ptr::null_mut();
        data.capacity = 0;
    }
}
