//! Heap strings and the short-string interning table.

use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;

use std::hash::BuildHasher;

use super::GcRef;

/// Strings at or below this length are interned.
pub const SHORT_STR_LIMIT: usize = 40;

/// Whether a string is interned (short) or owned outright (long).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrKind {
    /// Interned in the global string table; equal content implies equal
    /// handle.
    Short,
    /// Not interned; compared by handle.
    Long,
}

/// A heap string: immutable UTF-8 text plus its cached hash.
#[derive(Debug, Clone)]
pub struct Str {
    pub(crate) text: Box<str>,
    pub(crate) kind: StrKind,
    pub(crate) hash: u64,
}

impl Str {
    /// The string contents.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Interning class of this string.
    pub fn kind(&self) -> StrKind {
        self.kind
    }
}

/// The short-string interning table: content hash to the interned handles
/// sharing it.
///
/// Entries are weakly held. The sweep phase removes a dying string here
/// before freeing its slot, and sweep-end shrinks the bucket storage when
/// utilization drops below a quarter.
#[derive(Default)]
pub(crate) struct StringTable {
    buckets: HashMap<u64, Vec<GcRef>>,
    len: usize,
    hasher: DefaultHashBuilder,
}

impl StringTable {
    pub(crate) fn hash_of(&self, text: &str) -> u64 {
        self.hasher.hash_one(text)
    }

    /// Find an interned string by content, given its hash and a resolver
    /// from handle to stored text.
    pub(crate) fn find<'a>(
        &self,
        hash: u64,
        text: &str,
        resolve: impl Fn(GcRef) -> &'a str,
    ) -> Option<GcRef> {
        self.buckets
            .get(&hash)?
            .iter()
            .copied()
            .find(|&r| resolve(r) == text)
    }

    pub(crate) fn insert(&mut self, hash: u64, string: GcRef) {
        self.buckets.entry(hash).or_default().push(string);
        self.len += 1;
    }

    /// Remove a dying string; called from the sweep path only.
    pub(crate) fn remove(&mut self, hash: u64, string: GcRef) {
        if let Some(bucket) = self.buckets.get_mut(&hash) {
            if let Some(at) = bucket.iter().position(|&r| r == string) {
                bucket.swap_remove(at);
                self.len -= 1;
            }
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }

    /// Number of interned strings.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Shrink bucket storage when under a quarter utilized.
    pub(crate) fn shrink_if_sparse(&mut self) {
        if self.len < self.buckets.capacity() / 4 {
            self.buckets.shrink_to_fit();
        }
    }
}
