//! `revtree` is an embeddable, append-only, copy-on-write B+Tree storage
//! engine with MVCC (spec.md §1-§2): single writer, many lock-free
//! readers, each reader pinned to a stable `(revision, root)` snapshot.
//!
//! The crate is organized bottom-up: [`file`] and [`paged_file`] give a
//! page-IO abstraction over a raw byte store, [`alloc`] manages free
//! pages within it, [`page`] is the on-disk Leaf/Node layout, [`btree`]
//! implements the copy-on-write tree algorithms and cursors over that
//! layout, and [`record_manager`] ties a registry of named trees plus
//! MVCC bookkeeping ([`mvcc`]) together behind [`RecordManager`].

mod alloc;
mod btree;
mod cache;
mod codec;
mod error;
mod file;
mod mvcc;
mod page;
mod paged_file;
mod record_manager;

pub use btree::cursor::TupleCursor;
pub use btree::DeleteTarget;
pub use codec::{BytesCodec, Codec, StringCodec, U64Codec};
pub use error::{Error, Result};
pub use file::{File, MemoryFile, OsFile};
pub use record_manager::{RecordManager, Snapshot, WriteTxn};

use std::time::Duration;

/// Tunable engine parameters (spec.md §6). `page_size` and
/// `branching_factor` are fixed for the lifetime of a file: they are
/// only read from an existing header, never renegotiated on reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Size in bytes of one page-IO block. Must be a power of two, at
    /// least 32.
    pub page_size: u32,
    /// Maximum children per node / entries per leaf before a split.
    /// Must be a power of two, at least 2.
    pub branching_factor: u32,
    /// Maximum number of page records the shared LRU cache holds.
    pub cache_capacity: usize,
    /// Advisory size hint for batching staged writes before `commit`
    /// flushes them; the engine does not currently buffer writes across
    /// transactions, so today this only sizes internal `Vec`
    /// preallocation.
    pub write_buffer_size: usize,
    /// When set, `commit` records each superseded tree root in the
    /// internal `revision-tree` and routes freed pages through the
    /// `copied-pages-tree` instead of the free list, so `get_at` and
    /// `reclaim_revisions` can see past revisions.
    pub keep_revisions: bool,
    /// How long a reader snapshot may live before `sweep_expired_snapshots`
    /// is allowed to close it.
    pub read_timeout: Duration,
    /// Duplicate-value count at which an inline value array promotes to
    /// a nested sub-tree.
    pub v_up: usize,
    /// Duplicate-value count at which a sub-tree demotes back to an
    /// inline array.
    pub v_low: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 512,
            branching_factor: 16,
            cache_capacity: 1000,
            write_buffer_size: 64 * 1024,
            keep_revisions: false,
            read_timeout: Duration::from_secs(10),
            v_up: 8,
            v_low: 1,
        }
    }
}

impl EngineOptions {
    /// Rejects option combinations the on-disk format or the tree
    /// algorithms can't support (spec.md §6).
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 32 || !self.page_size.is_power_of_two() {
            return Err(Error::IllegalArgument("page_size must be a power of two >= 32"));
        }
        if self.branching_factor < 2 || !self.branching_factor.is_power_of_two() {
            return Err(Error::IllegalArgument("branching_factor must be a power of two >= 2"));
        }
        if self.v_low >= self.v_up {
            return Err(Error::IllegalArgument("v_low must be less than v_up"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        EngineOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let opts = EngineOptions { page_size: 500, ..EngineOptions::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_v_low_not_below_v_up() {
        let opts = EngineOptions { v_up: 4, v_low: 4, ..EngineOptions::default() };
        assert!(opts.validate().is_err());
    }
}
