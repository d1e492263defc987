// Package keytable implements a sharded, reference-counted string interning
// table. Callers exchange byte strings for compact handles; identical
// strings share one stored copy and one reference count. Built for
// multi-threaded processes where key strings are long-lived and reused at
// high rates, such as object field names in an in-memory document store.

pub mod config;
pub mod keytable;

// Re-export main types
pub use config::{Config, Factors, FactorsError};
pub use keytable::{Handle, KeyTable, Layout, LongStats, Stats, MAX_HASHCODE, MAX_REF_COUNT};
