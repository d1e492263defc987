// Package keytable provides shared unit-test support.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{span, Event, Level, Metadata};

use crate::config::Config;

use super::layout::{set_max_ref_count, MAX_REF_COUNT};
use super::shard::set_max_fast_table_size;

// Serializes tests that lower the process-global caps (or that would be
// disturbed by another test lowering them mid-run).
static HOOK_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn hook_lock() -> MutexGuard<'static, ()> {
    HOOK_LOCK.lock()
}

/// Routes table logs to stderr when RUST_LOG is set. Only the first caller
/// installs the subscriber.
pub(crate) fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Lowers the refcount cap for the guard's lifetime, restoring the default
/// (and releasing the hook lock) on drop.
pub(crate) struct RefCountCapGuard {
    _lock: MutexGuard<'static, ()>,
}

impl RefCountCapGuard {
    pub(crate) fn lower(max: u32) -> Self {
        let lock = hook_lock();
        set_max_ref_count(max);
        Self { _lock: lock }
    }
}

impl Drop for RefCountCapGuard {
    fn drop(&mut self) {
        set_max_ref_count(MAX_REF_COUNT);
    }
}

/// Lowers the fast-regime capacity bound for the guard's lifetime.
pub(crate) struct FastSizeGuard {
    _lock: MutexGuard<'static, ()>,
}

impl FastSizeGuard {
    pub(crate) fn lower(size: usize) -> Self {
        let lock = hook_lock();
        set_max_fast_table_size(size);
        Self { _lock: lock }
    }
}

impl Drop for FastSizeGuard {
    fn drop(&mut self) {
        set_max_fast_table_size(1 << 19);
    }
}

/// Single-shard configuration, so every operation lands in shard 0.
pub(crate) fn single_shard() -> Config {
    Config {
        num_shards: 1,
        ..Config::default()
    }
}

fn zero_hash(_bytes: &[u8]) -> u64 {
    0
}

/// Single shard plus a hasher mapping every string to hash 0, forcing all
/// keys into one collision chain at slot 0.
pub(crate) fn colliding() -> Config {
    Config {
        num_shards: 1,
        hash: zero_hash,
        ..Config::default()
    }
}

fn const3_hash(_bytes: &[u8]) -> u64 {
    3
}

/// Single shard with every key hashing to 3, so probes start at the last
/// slot of the minimum table and wrap.
pub(crate) fn colliding_at_tail() -> Config {
    Config {
        num_shards: 1,
        hash: const3_hash,
        ..Config::default()
    }
}

/// Minimal subscriber counting WARN events emitted on the current thread.
pub(crate) struct WarnCounter(pub(crate) Arc<AtomicUsize>);

impl tracing::Subscriber for WarnCounter {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
        span::Id::from_u64(1)
    }

    fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

    fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

    fn event(&self, event: &Event<'_>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enter(&self, _span: &span::Id) {}

    fn exit(&self, _span: &span::Id) {}
}
