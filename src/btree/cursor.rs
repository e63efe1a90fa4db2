//! `TupleCursor`: an ordered walk over a tree's `(key, value)` tuples
//! (spec.md §4.6), including the `BEFORE_FIRST`/`AFTER_LAST` sentinel
//! positions and duplicate-skipping `next_key`/`prev_key`.
//!
//! Holds a root-to-leaf path (`stack`) rather than materializing the
//! whole tree, so a scan over a large tree costs O(height) memory, not
//! O(size).

use super::{materialize_values, read_page};
use crate::cache::Cache;
use crate::codec::Codec;
use crate::error::Result;
use crate::file::File;
use crate::page::{KeyHolder, Page, PageBody, ValueHolder, NO_PAGE};
use crate::paged_file::PagedFile;
use bytes::Bytes;

struct Frame<K, V> {
    page: Page<K, V>,
    index: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    AfterLast,
    At,
}

pub struct TupleCursor<'a, F, K, V, KC, VC> {
    paged_file: &'a PagedFile<F>,
    cache: &'a Cache<u64, Bytes>,
    kc: &'a KC,
    vc: &'a VC,
    root: u64,
    stack: Vec<Frame<K, V>>,
    dup_index: usize,
    position: Position,
}

fn push_leftmost<F, K, V, KC, VC>(
    stack: &mut Vec<Frame<K, V>>,
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    kc: &KC,
    vc: &VC,
    mut offset: u64,
) -> Result<()>
where
    F: File,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    while offset != NO_PAGE {
        let page: Page<K, V> = read_page(paged_file, cache, &[], kc, vc, offset)?;
        let next = match &page.body {
            PageBody::Node(n) => Some(n.children[0].first_page),
            PageBody::Leaf(_) => None,
        };
        let is_leaf = page.is_leaf();
        stack.push(Frame { page, index: 0 });
        match next {
            Some(o) => offset = o,
            None => break,
        }
        if is_leaf {
            break;
        }
    }
    Ok(())
}

fn push_rightmost<F, K, V, KC, VC>(
    stack: &mut Vec<Frame<K, V>>,
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    kc: &KC,
    vc: &VC,
    mut offset: u64,
) -> Result<()>
where
    F: File,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    while offset != NO_PAGE {
        let page: Page<K, V> = read_page(paged_file, cache, &[], kc, vc, offset)?;
        let (last_index, next) = match &page.body {
            PageBody::Leaf(l) => (l.entries.len().saturating_sub(1), None),
            PageBody::Node(n) => {
                let last = n.children.len() - 1;
                (last, Some(n.children[last].first_page))
            }
        };
        let is_leaf = page.is_leaf();
        stack.push(Frame { page, index: last_index });
        match next {
            Some(o) => offset = o,
            None => break,
        }
        if is_leaf {
            break;
        }
    }
    Ok(())
}

impl<'a, F, K, V, KC, VC> TupleCursor<'a, F, K, V, KC, VC>
where
    F: File,
    K: Clone,
    V: Clone,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    pub fn new(paged_file: &'a PagedFile<F>, cache: &'a Cache<u64, Bytes>, kc: &'a KC, vc: &'a VC, root: u64) -> Self {
        Self {
            paged_file,
            cache,
            kc,
            vc,
            root,
            stack: Vec::new(),
            dup_index: 0,
            position: Position::BeforeFirst,
        }
    }

    pub fn before_first(&mut self) {
        self.stack.clear();
        self.dup_index = 0;
        self.position = Position::BeforeFirst;
    }

    pub fn after_last(&mut self) {
        self.stack.clear();
        self.dup_index = 0;
        self.position = Position::AfterLast;
    }

    pub fn has_next(&self) -> bool {
        self.position != Position::AfterLast
    }

    pub fn has_prev(&self) -> bool {
        self.position != Position::BeforeFirst
    }

    fn current_entry(&self) -> Option<&(KeyHolder<K>, ValueHolder<V>)> {
        let frame = self.stack.last()?;
        match &frame.page.body {
            PageBody::Leaf(leaf) => leaf.entries.get(frame.index),
            PageBody::Node(_) => None,
        }
    }

    fn current_values_len(&self) -> Result<usize> {
        match self.current_entry() {
            Some((_, holder)) => Ok(materialize_values(self.paged_file, self.cache, &[], self.vc, holder)?.len()),
            None => Ok(0),
        }
    }

    fn advance_entry(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(false);
            };
            match &top.page.body {
                PageBody::Leaf(leaf) => {
                    if top.index + 1 < leaf.entries.len() {
                        top.index += 1;
                        return Ok(true);
                    }
                    self.stack.pop();
                }
                PageBody::Node(node) => {
                    if top.index + 1 < node.children.len() {
                        top.index += 1;
                        let child_offset = node.children[top.index].first_page;
                        push_leftmost(&mut self.stack, self.paged_file, self.cache, self.kc, self.vc, child_offset)?;
                        return Ok(true);
                    }
                    self.stack.pop();
                }
            }
        }
    }

    fn retreat_entry(&mut self) -> Result<bool> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(false);
            };
            let is_node = matches!(top.page.body, PageBody::Node(_));
            if top.index > 0 {
                top.index -= 1;
                if is_node {
                    let child_offset = match &top.page.body {
                        PageBody::Node(n) => n.children[top.index].first_page,
                        PageBody::Leaf(_) => unreachable!(),
                    };
                    push_rightmost(&mut self.stack, self.paged_file, self.cache, self.kc, self.vc, child_offset)?;
                }
                return Ok(true);
            }
            self.stack.pop();
        }
    }

    fn current_tuple(&self) -> Result<Option<(K, V)>> {
        let Some((kh, holder)) = self.current_entry() else {
            return Ok(None);
        };
        let key = kh.decode(self.kc)?;
        let values = materialize_values(self.paged_file, self.cache, &[], self.vc, holder)?;
        Ok(values.get(self.dup_index).cloned().map(|v| (key.clone(), v)))
    }

    /// The next `(key, value)` tuple, or `None` once past the last entry
    /// (moves the cursor to `AFTER_LAST`).
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        match self.position {
            Position::BeforeFirst => {
                push_leftmost(&mut self.stack, self.paged_file, self.cache, self.kc, self.vc, self.root)?;
                self.dup_index = 0;
                if self.current_entry().is_none() {
                    self.position = Position::AfterLast;
                    return Ok(None);
                }
                self.position = Position::At;
            }
            Position::AfterLast => return Ok(None),
            Position::At => {
                let values_len = self.current_values_len()?;
                if self.dup_index + 1 < values_len {
                    self.dup_index += 1;
                } else {
                    self.dup_index = 0;
                    if !self.advance_entry()? {
                        self.position = Position::AfterLast;
                        return Ok(None);
                    }
                }
            }
        }
        self.current_tuple()
    }

    /// The previous `(key, value)` tuple, or `None` once past the first
    /// entry (moves the cursor to `BEFORE_FIRST`).
    pub fn prev(&mut self) -> Result<Option<(K, V)>> {
        match self.position {
            Position::AfterLast => {
                push_rightmost(&mut self.stack, self.paged_file, self.cache, self.kc, self.vc, self.root)?;
                if self.current_entry().is_none() {
                    self.position = Position::BeforeFirst;
                    return Ok(None);
                }
                self.dup_index = self.current_values_len()?.saturating_sub(1);
                self.position = Position::At;
            }
            Position::BeforeFirst => return Ok(None),
            Position::At => {
                if self.dup_index > 0 {
                    self.dup_index -= 1;
                } else if self.retreat_entry()? {
                    self.dup_index = self.current_values_len()?.saturating_sub(1);
                } else {
                    self.position = Position::BeforeFirst;
                    return Ok(None);
                }
            }
        }
        self.current_tuple()
    }

    /// Like `next`, but skips any remaining duplicates of the current key.
    pub fn next_key(&mut self) -> Result<Option<(K, V)>> {
        match self.position {
            Position::BeforeFirst => return self.next(),
            Position::AfterLast => return Ok(None),
            Position::At => {
                self.dup_index = 0;
                if !self.advance_entry()? {
                    self.position = Position::AfterLast;
                    return Ok(None);
                }
            }
        }
        self.current_tuple()
    }

    /// Like `prev`, but skips to the previous distinct key.
    pub fn prev_key(&mut self) -> Result<Option<(K, V)>> {
        match self.position {
            Position::AfterLast => return self.prev(),
            Position::BeforeFirst => return Ok(None),
            Position::At => {
                if !self.retreat_entry()? {
                    self.position = Position::BeforeFirst;
                    return Ok(None);
                }
                self.dup_index = 0;
            }
        }
        self.current_tuple()
    }

    /// Cursors are read-only: mutation happens through `WriteTxn::insert`/
    /// `delete` on the tree that owns the snapshot this cursor walks, not
    /// on the cursor itself (spec.md §7: "Unsupported-operation: cursor
    /// `remove`").
    pub fn remove(&mut self) -> Result<()> {
        Err(crate::error::Error::UnsupportedOperation("cursor remove"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FreeListAllocator;
    use crate::btree::{tree_insert, PendingPage, TreeCtx};
    use crate::codec::U64Codec;
    use crate::file::MemoryFile;

    fn build_tree(pairs: &[(u64, u64)], allow_duplicates: bool) -> (PagedFile<MemoryFile>, Cache<u64, Bytes>, u64) {
        let pf = PagedFile::new(MemoryFile::new(), 512);
        let cache = Cache::new(64);
        let mut allocator = FreeListAllocator::new(NO_PAGE, NO_PAGE, 512);
        let mut pending = Vec::new();
        let mut freed = Vec::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = TreeCtx {
                paged_file: &pf,
                page_cache: &cache,
                allocator: &mut allocator,
                pending: &mut pending,
                freed: &mut freed,
                kc: &kc,
                vc: &vc,
                branching_factor: 4,
                allow_duplicates,
                v_up: 3,
                v_low: 1,
                revision: 1,
            };
            for &(k, v) in pairs {
                root = tree_insert(&mut ctx, root, k, v).unwrap();
            }
        }
        for p in pending.drain(..) {
            pf.write_record(&p.offsets, &p.bytes).unwrap();
        }
        (pf, cache, root)
    }

    #[test]
    fn walks_ascending_and_descending() {
        let pairs: Vec<(u64, u64)> = (0..30).map(|k| (k, k * 2)).collect();
        let (pf, cache, root) = build_tree(&pairs, false);
        let kc = U64Codec;
        let vc = U64Codec;

        let mut cursor = TupleCursor::new(&pf, &cache, &kc, &vc, root);
        for k in 0..30u64 {
            let (key, value) = cursor.next().unwrap().unwrap();
            assert_eq!((key, value), (k, k * 2));
        }
        assert!(cursor.next().unwrap().is_none());
        assert!(!cursor.has_next());

        for k in (0..30u64).rev() {
            let (key, value) = cursor.prev().unwrap().unwrap();
            assert_eq!((key, value), (k, k * 2));
        }
        assert!(cursor.prev().unwrap().is_none());
        assert!(!cursor.has_prev());
    }

    #[test]
    fn next_key_skips_duplicates() {
        let pairs = vec![(1u64, 10u64), (1, 20), (1, 30), (2, 99)];
        let (pf, cache, root) = build_tree(&pairs, true);
        let kc = U64Codec;
        let vc = U64Codec;

        let mut cursor = TupleCursor::new(&pf, &cache, &kc, &vc, root);
        let (k, _) = cursor.next().unwrap().unwrap();
        assert_eq!(k, 1);
        let (k, v) = cursor.next_key().unwrap().unwrap();
        assert_eq!((k, v), (2, 99));
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn remove_is_unsupported() {
        let (pf, cache, root) = build_tree(&[(1u64, 1u64)], false);
        let kc = U64Codec;
        let vc = U64Codec;
        let mut cursor = TupleCursor::new(&pf, &cache, &kc, &vc, root);
        assert!(matches!(cursor.remove(), Err(crate::error::Error::UnsupportedOperation(_))));
    }
}
