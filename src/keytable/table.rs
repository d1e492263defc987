// Package keytable provides the sharded dispatcher.
//
// The table hashes each incoming string once. The high bits of the hash pick
// the shard and the low bits drive the probe index inside it, so intra-shard
// clustering stays statistically independent of shard assignment. Each shard
// serializes its own operations behind a coarse mutex; operations on
// distinct shards run in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::{Config, Factors, FactorsError};

use super::handle::{Handle, MAX_HASHCODE};
use super::layout::Layout;
use super::shard::Shard;
use super::stats::{LongStats, Stats};

/// Sharded, reference-counted string interning table.
///
/// Callers exchange byte strings for [`Handle`]s; identical strings share one
/// stored record and one refcount. Handles must be released back through
/// [`destroy_handle`](KeyTable::destroy_handle); the table asserts at drop
/// that nothing live remains (records with a saturated refcount are the
/// accepted exception and are reclaimed with the table).
pub struct KeyTable {
    pub(crate) cfg: Config,
    // Written only while every shard mutex is held, so a shard operation
    // holding its own lock always sees a stable snapshot.
    pub(crate) factors: RwLock<Factors>,
    // Incremented under the owning shard's mutex; readers may lag slightly.
    pub(crate) stuck_keys: AtomicU64,
    shards: Vec<Shard>,
}

impl KeyTable {
    /// Builds a table with `cfg.num_shards` shards, each starting at the
    /// minimum capacity.
    pub fn new(cfg: Config) -> Self {
        assert!(cfg.num_shards > 0, "table needs at least one shard");
        let factors = Factors::default();
        assert!(factors.validate().is_ok());
        let shards = (0..cfg.num_shards).map(Shard::new).collect();
        let table = Self {
            cfg,
            factors: RwLock::new(factors),
            stuck_keys: AtomicU64::new(0),
            shards,
        };
        for shard in &table.shards {
            shard.init(&table.cfg);
        }
        table
    }

    /// The shard owning a hash. High bits: the low ones are already spent as
    /// the probe index inside the shard.
    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[((hash >> 40) % self.shards.len() as u64) as usize]
    }

    /// Upserts a string and returns a handle owning one reference to it.
    pub fn make_handle(&self, bytes: &[u8], noescape: bool) -> Handle {
        let hash = (self.cfg.hash)(bytes);
        let layout = self.shard_for(hash).insert(self, hash, bytes, noescape);
        Handle::new(layout, hash & MAX_HASHCODE)
    }

    /// Takes an additional reference on an existing handle's string. The
    /// handle does not cache the full hash, so the payload is rehashed to
    /// find the shard.
    pub fn clone_handle(&self, h: &Handle) -> Handle {
        if h.is_empty() {
            return Handle::empty();
        }
        let hash = (self.cfg.hash)(h.text());
        let layout = self.shard_for(hash).clone_handle(self, h);
        Handle::new(layout, hash & MAX_HASHCODE)
    }

    /// Releases a handle's reference and empties it. Releasing an empty
    /// handle is a no-op.
    pub fn destroy_handle(&self, h: &mut Handle) {
        if h.is_empty() {
            return;
        }
        let hash = (self.cfg.hash)(h.text());
        assert!(!h.layout().is_poisoned(), "handle points at a freed key");
        assert_eq!(
            hash,
            h.layout().original_hash(),
            "payload hash does not match the record"
        );
        self.shard_for(hash).destroy_handle(self, h, hash);
    }

    /// Replaces the load factors, atomically with respect to every shard.
    /// Shard locks are taken in index order.
    pub fn set_factors(&self, f: Factors) -> Result<(), FactorsError> {
        f.validate()?;
        let guards: Vec<_> = self.shards.iter().map(|s| s.data.lock()).collect();
        *self.factors.write() = f;
        drop(guards);
        Ok(())
    }

    /// Current load factors.
    pub fn factors(&self) -> Factors {
        *self.factors.read()
    }

    /// Validates a factor configuration without applying it.
    pub fn is_valid_factors(f: &Factors) -> Result<(), FactorsError> {
        f.validate()
    }

    /// Aggregates shard statistics. Resets each shard's since-last-read
    /// counters as a side effect; callers rely on that windowing.
    pub fn get_stats(&self) -> Stats {
        let mut s = Stats::new(self.stuck_keys.load(Ordering::Relaxed), self.factors());
        for shard in &self.shards {
            shard.collect_stats(&mut s);
        }
        s
    }

    /// Merges the occupied-run histograms of every shard, trimmed to the
    /// `top_n` largest run lengths.
    pub fn get_long_stats(&self, top_n: usize) -> LongStats {
        let mut s = LongStats::default();
        for shard in &self.shards {
            shard.collect_long_stats(&mut s, top_n);
        }
        s
    }

    /// Structural validation of every shard. Empty string means no failure.
    pub fn validate(&self) -> String {
        let mut result = String::new();
        for shard in &self.shards {
            result += &shard.validate(self);
        }
        result
    }

    /// Validates structure, then checks every live record's refcount against
    /// the supplied census. Matched entries are consumed from the map;
    /// whatever remains afterwards was expected but never found.
    pub fn validate_counts(&self, counts: &mut HashMap<*const Layout, usize>) -> String {
        let mut result = self.validate();
        if !result.is_empty() {
            return result;
        }
        for shard in &self.shards {
            result += &shard.validate_counts(counts);
        }
        if !result.is_empty() {
            return result;
        }
        for (layout, count) in counts.iter() {
            result += &format!(
                "Lingering Handle found: {} Count:{}\n",
                String::from_utf8_lossy(unsafe { (**layout).payload() }),
                count
            );
        }
        result
    }

    /// Number of shards, fixed at construction.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

impl Drop for KeyTable {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.destroy(&self.cfg);
        }
    }
}
