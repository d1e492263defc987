// Package keytable provides the client-held handle.

use std::fmt;

use super::entry::{Entry, METADATA_MASK};
use super::layout::Layout;

/// Widest hashcode a handle carries: the original hash truncated to 19 bits,
/// a cheap tie-breaker for clients that sort or bucket handles.
pub const MAX_HASHCODE: u64 = METADATA_MASK;

/// A value owning exactly one reference to an interned string.
///
/// Handles are move-owned: there is no `Clone`, duplication goes through
/// [`KeyTable::clone_handle`](super::KeyTable::clone_handle) so the refcount
/// stays conserved, and release goes through
/// [`KeyTable::destroy_handle`](super::KeyTable::destroy_handle). Dropping a
/// non-empty handle without destroying it leaks its reference; the table does
/// not track handles individually.
///
/// Internally the same packed word as a table slot, with the metadata bits
/// holding the hashcode instead of the probe tag.
#[derive(PartialEq, Eq)]
pub struct Handle {
    word: Entry,
}

// The payload is immutable and refcount updates go through the owning
// shard's mutex, so a handle may cross threads freely.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    /// The empty handle. Owns nothing.
    pub fn empty() -> Self {
        Self { word: Entry::empty() }
    }

    pub(crate) fn new(layout: *mut Layout, hashcode: u64) -> Self {
        Self { word: Entry::new(layout, hashcode) }
    }

    pub fn is_empty(&self) -> bool {
        !self.word.is_set()
    }

    pub(crate) fn layout(&self) -> &Layout {
        assert!(!self.is_empty(), "empty handle dereferenced");
        unsafe { self.word.layout() }
    }

    /// The interned bytes. Valid for as long as this handle owns its
    /// reference.
    pub fn text(&self) -> &[u8] {
        self.layout().payload()
    }

    pub fn len(&self) -> usize {
        self.layout().length()
    }

    /// The original hash truncated to [`MAX_HASHCODE`] bits.
    pub fn hashcode(&self) -> u64 {
        self.word.metadata()
    }

    /// The opaque flag the string was interned with.
    pub fn noescape(&self) -> bool {
        self.layout().noescape()
    }

    /// Forgets the underlying string without releasing the reference.
    /// Destroy uses this once the refcount has been settled; anyone else
    /// calling it leaks the reference.
    pub fn clear(&mut self) {
        self.word.clear();
    }

    /// Identity of the shared record, for census maps and interning checks.
    /// Null for the empty handle.
    pub fn as_layout_ptr(&self) -> *const Layout {
        if self.is_empty() {
            std::ptr::null()
        } else {
            self.word.ptr()
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "Handle(<empty>)")
        } else {
            write!(f, "Handle({:?})", String::from_utf8_lossy(self.text()))
        }
    }
}
