// Package config provides table configuration: host hooks and load factors.

use std::time::{SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh3::xxh3_64;

/// Allocator hook. Must return 8-byte aligned memory (addresses below 2^48)
/// or the packed entry representation cannot carry its metadata bits.
pub type AllocFn = fn(usize) -> *mut u8;

/// Deallocator hook. Receives pointers previously returned by the paired
/// [`AllocFn`].
pub type FreeFn = fn(*mut u8);

/// Hash hook. Must be deterministic and produce entropy in both the low bits
/// (intra-shard probe index) and bits 40+ (shard selection).
pub type HashFn = fn(&[u8]) -> u64;

/// Clock hook, milliseconds. Only used to time rehashes for the log notice.
pub type ClockFn = fn() -> u64;

fn default_alloc(size: usize) -> *mut u8 {
    unsafe { libc::malloc(size) as *mut u8 }
}

fn default_free(ptr: *mut u8) {
    unsafe { libc::free(ptr as *mut libc::c_void) }
}

fn default_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

fn default_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Table construction parameters. The hooks default to libc malloc/free,
/// xxh3 and the system clock; all of them stay replaceable so a host process
/// can route allocation and hashing through its own machinery.
#[derive(Clone, Copy)]
pub struct Config {
    pub alloc: AllocFn,
    pub free: FreeFn,
    pub hash: HashFn,
    pub clock: ClockFn,
    /// Number of independently locked shards. Fixed for the table lifetime.
    pub num_shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alloc: default_alloc,
            free: default_free,
            hash: default_hash,
            clock: default_clock,
            num_shards: 16,
        }
    }
}

/// Load-factor configuration shared by every shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factors {
    /// Shrink the table when load drops below this.
    pub min_load: f64,
    /// Grow the table when load rises above this.
    pub max_load: f64,
    /// Fraction of the current capacity added on grow.
    pub grow: f64,
    /// Fraction of the current capacity removed on shrink.
    pub shrink: f64,
}

impl Default for Factors {
    fn default() -> Self {
        Self {
            min_load: 0.25,
            max_load: 0.85,
            grow: 1.0,
            shrink: 0.5,
        }
    }
}

/// Rejected load-factor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FactorsError {
    #[error("min_load <= 0.0")]
    MinLoadNotPositive,
    #[error("max_load > 1.0")]
    MaxLoadAboveOne,
    #[error("min_load >= max_load")]
    MinLoadAboveMaxLoad,
    #[error("grow <= 0.0")]
    GrowNotPositive,
    #[error("shrink <= 0.0")]
    ShrinkNotPositive,
    #[error("shrink too large, a shrunk table could not hold its entries")]
    ShrinkTooLarge,
}

impl Factors {
    /// Checks that the factors describe a table that can always rehash
    /// successfully. The shrink bound guarantees that after a shrink the
    /// remaining entries still fit under `min_load`.
    pub fn validate(&self) -> Result<(), FactorsError> {
        if self.min_load <= 0.0 {
            return Err(FactorsError::MinLoadNotPositive);
        }
        if self.max_load > 1.0 {
            return Err(FactorsError::MaxLoadAboveOne);
        }
        if self.min_load >= self.max_load {
            return Err(FactorsError::MinLoadAboveMaxLoad);
        }
        if self.grow <= 0.0 {
            return Err(FactorsError::GrowNotPositive);
        }
        if self.shrink <= 0.0 {
            return Err(FactorsError::ShrinkNotPositive);
        }
        if self.shrink > 1.0 - self.min_load {
            return Err(FactorsError::ShrinkTooLarge);
        }
        Ok(())
    }
}
