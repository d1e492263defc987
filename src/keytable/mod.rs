// Package keytable implements the sharded, reference-counted string
// interning table.

pub mod entry;
pub mod handle;
pub mod layout;
pub mod shard;
pub mod stats;
pub mod table;

// Re-export main types
pub use handle::{Handle, MAX_HASHCODE};
pub use layout::{Layout, MAX_REF_COUNT};
pub use stats::{LongStats, Stats};
pub use table::KeyTable;

// Unit test hooks
pub use layout::set_max_ref_count;
pub use shard::set_max_fast_table_size;

#[cfg(test)]
pub(crate) mod testutil;
