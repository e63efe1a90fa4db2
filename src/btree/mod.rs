//! Copy-on-write B+Tree algorithms (spec.md §4.6): recursive search,
//! insert with leaf/node splitting, delete with borrow-or-merge
//! rebalancing, and the inline-array/sub-tree promotion and demotion that
//! back duplicate values (I5).
//!
//! Grounded on `src/tree/node.rs`'s recursive `insert_internal`/
//! `split_leaf`/`split_internal`/`split_root` shape, generalized so every
//! mutated page is rewritten at a freshly allocated offset instead of
//! mutated in place, and extended with the deletion half the teacher never
//! implemented.
//!
//! Every page visited on a mutating path is staged into the caller's
//! write-ahead buffer (`TreeCtx::pending`) immediately; nothing is written
//! to the file until `RecordManager::commit` flushes that buffer in one
//! pass and flips the header (spec.md §4.7).

pub mod cursor;

use crate::alloc::FreeListAllocator;
use crate::cache::Cache;
use crate::codec::{Codec, UnitCodec};
use crate::error::Result;
use crate::file::File;
use crate::page::{decode_page, encode_page, ChildRef, KeyHolder, LeafPage, NodePage, Page, PageBody, ValueHolder, NO_PAGE};
use crate::paged_file::PagedFile;
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// A page staged for the next commit: chain offsets plus the encoded
/// record bytes, keyed implicitly by `offsets[0]`.
pub(crate) struct PendingPage {
    pub offsets: Vec<u64>,
    pub bytes: Vec<u8>,
}

/// Everything one B+Tree operation needs: durable file and cache access,
/// a live allocator, and the write-ahead staging buffers a caller
/// (`RecordManager`) later flushes. Duplicate-value sub-trees reuse this
/// same context with a different `(KC, VC)` pair — see `promote_to_subtree`.
pub(crate) struct TreeCtx<'a, F, KC, VC> {
    pub paged_file: &'a PagedFile<F>,
    pub page_cache: &'a Cache<u64, Bytes>,
    pub allocator: &'a mut FreeListAllocator,
    pub pending: &'a mut Vec<PendingPage>,
    pub freed: &'a mut Vec<u64>,
    pub kc: &'a KC,
    pub vc: &'a VC,
    pub branching_factor: usize,
    pub allow_duplicates: bool,
    pub v_up: usize,
    pub v_low: usize,
    pub revision: u64,
}

impl<'a, F: File, K, V, KC, VC> TreeCtx<'a, F, KC, VC>
where
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    fn read_page(&self, offset: u64) -> Result<Page<K, V>> {
        read_page(self.paged_file, self.page_cache, self.pending.as_slice(), self.kc, self.vc, offset)
    }

    /// Encodes and allocates `page`, pushing it onto the write-ahead
    /// buffer. Returns a `ChildRef` a parent node can store directly.
    fn stage(&mut self, page: &Page<K, V>) -> Result<ChildRef> {
        let encoded = encode_page(page, self.kc, self.vc);
        let offsets = self
            .allocator
            .allocate_chain(self.paged_file, encoded.len())?;
        let first = offsets[0];
        let last = *offsets.last().unwrap();
        self.pending.push(PendingPage { offsets, bytes: encoded });
        Ok(ChildRef {
            first_page: first,
            last_page: last,
        })
    }

    /// Marks a page's old offset as garbage. Whether that means an
    /// immediate free-list return or a `copied-pages-tree` entry is a
    /// `RecordManager`-level retention-policy decision (spec.md §4.2).
    fn retire(&mut self, offset: u64) {
        if offset != NO_PAGE {
            self.freed.push(offset);
        }
    }
}

/// Reads and decodes the page at `offset`, going through the shared
/// cache. Free function (rather than a `TreeCtx` method) so read-only
/// callers — `get`, cursors — don't need a live allocator just to read.
///
/// `pending` is a transaction's not-yet-flushed write-ahead buffer; a page
/// staged there is checked first, since a writer may read back a page it
/// staged earlier in the same transaction before `commit` ever touches the
/// file. It is never inserted into the shared `cache`: an aborted
/// transaction's offsets can be reallocated, and a stale cached body would
/// then be handed to an unrelated reader.
pub(crate) fn read_page<F, K, V, KC, VC>(
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    pending: &[PendingPage],
    kc: &KC,
    vc: &VC,
    offset: u64,
) -> Result<Page<K, V>>
where
    F: File,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if let Some(p) = pending.iter().find(|p| p.offsets[0] == offset) {
        return decode_page(offset, Bytes::copy_from_slice(&p.bytes), kc, vc);
    }

    let bytes = match cache.get(&offset) {
        Some(b) => b,
        None => {
            let b = paged_file.read_record(offset)?;
            cache.insert(offset, b.clone());
            b
        }
    };
    decode_page(offset, bytes, kc, vc)
}

fn child_index<K, KC: Codec<Item = K>>(keys: &[KeyHolder<K>], target: &K, kc: &KC) -> Result<usize> {
    for (i, kh) in keys.iter().enumerate() {
        let k = kh.decode(kc)?;
        if kc.compare(target, &k) == Ordering::Less {
            return Ok(i);
        }
    }
    Ok(keys.len())
}

/// Returns `(index, exact_match)`: the position at which `target` sits or
/// should be inserted.
fn leaf_search<K, V, KC: Codec<Item = K>>(
    entries: &[(KeyHolder<K>, ValueHolder<V>)],
    target: &K,
    kc: &KC,
) -> Result<(usize, bool)> {
    for (i, (kh, _)) in entries.iter().enumerate() {
        let k = kh.decode(kc)?;
        match kc.compare(target, &k) {
            Ordering::Less => return Ok((i, false)),
            Ordering::Equal => return Ok((i, true)),
            Ordering::Greater => continue,
        }
    }
    Ok((entries.len(), false))
}

/// The full multiset of values stored at a single key, materialized from
/// either the inline array or by walking the duplicate sub-tree in order.
fn materialize_values<F, V, VC>(
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    pending: &[PendingPage],
    vc: &VC,
    holder: &ValueHolder<V>,
) -> Result<Vec<V>>
where
    F: File,
    V: Clone,
    VC: Codec<Item = V>,
{
    match holder {
        ValueHolder::Inline(vs) => Ok(vs.clone()),
        ValueHolder::SubTree { root, .. } => {
            let mut out = Vec::new();
            collect_ascending(paged_file, cache, pending, vc, *root, &mut out)?;
            Ok(out)
        }
    }
}

fn read_subtree_page<F, V, VC>(
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    pending: &[PendingPage],
    vc: &VC,
    offset: u64,
) -> Result<Page<V, ()>>
where
    F: File,
    VC: Codec<Item = V>,
{
    read_page(paged_file, cache, pending, vc, &UnitCodec, offset)
}

fn collect_ascending<F, V, VC>(
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    pending: &[PendingPage],
    vc: &VC,
    root: u64,
    out: &mut Vec<V>,
) -> Result<()>
where
    F: File,
    V: Clone,
    VC: Codec<Item = V>,
{
    if root == NO_PAGE {
        return Ok(());
    }
    let page = read_subtree_page(paged_file, cache, pending, vc, root)?;
    match &page.body {
        PageBody::Leaf(leaf) => {
            for (k, _) in &leaf.entries {
                out.push(k.decode(vc)?);
            }
        }
        PageBody::Node(node) => {
            for child in &node.children {
                collect_ascending(paged_file, cache, pending, vc, child.first_page, out)?;
            }
        }
    }
    Ok(())
}

/// Retires every page belonging to a duplicate-value sub-tree, used when
/// a key is deleted outright or a sub-tree demotes back to inline.
fn free_subtree<F, K, V, KC, VC>(ctx: &mut TreeCtx<'_, F, KC, VC>, root: u64) -> Result<()>
where
    F: File,
    V: Clone,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if root == NO_PAGE {
        return Ok(());
    }
    let page = read_subtree_page(ctx.paged_file, ctx.page_cache, ctx.pending.as_slice(), ctx.vc, root)?;
    if let PageBody::Node(node) = &page.body {
        for child in &node.children {
            free_subtree(ctx, child.first_page)?;
        }
    }
    ctx.retire(root);
    Ok(())
}

/// Looks up a key, returning the full multiset of values stored at it (a
/// single-element vec for trees that don't allow duplicates). `pending` is
/// a live transaction's write-ahead buffer, or `&[]` for a read-only
/// snapshot that never has one.
pub(crate) fn tree_get<F, K, V, KC, VC>(
    paged_file: &PagedFile<F>,
    cache: &Cache<u64, Bytes>,
    pending: &[PendingPage],
    kc: &KC,
    vc: &VC,
    root: u64,
    key: &K,
) -> Result<Option<Vec<V>>>
where
    F: File,
    V: Clone,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if root == NO_PAGE {
        return Ok(None);
    }
    let page: Page<K, V> = read_page(paged_file, cache, pending, kc, vc, root)?;
    match &page.body {
        PageBody::Leaf(leaf) => {
            let (idx, found) = leaf_search(&leaf.entries, key, kc)?;
            if !found {
                Ok(None)
            } else {
                Ok(Some(materialize_values(paged_file, cache, pending, vc, &leaf.entries[idx].1)?))
            }
        }
        PageBody::Node(node) => {
            let idx = child_index(&node.keys, key, kc)?;
            tree_get(paged_file, cache, pending, kc, vc, node.children[idx].first_page, key)
        }
    }
}

/// Outcome of a single-level insert: either the child was rewritten in
/// place, or it split and the parent must absorb a new separator + sibling.
pub(crate) enum Modified<K> {
    Single(ChildRef),
    Split(ChildRef, KeyHolder<K>, ChildRef),
}

fn grow_root<F, K, V, KC, VC>(ctx: &mut TreeCtx<'_, F, KC, VC>, outcome: Modified<K>) -> Result<u64>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    match outcome {
        Modified::Single(cref) => Ok(cref.first_page),
        Modified::Split(left, pivot, right) => {
            let mut root_page: Page<K, V> = Page::new_node(ctx.revision);
            root_page.body = PageBody::Node(NodePage {
                keys: vec![pivot],
                children: vec![left, right],
            });
            Ok(ctx.stage(&root_page)?.first_page)
        }
    }
}

/// Inserts `(key, value)` starting from `root`, growing the tree's height
/// if the root itself splits. Non-duplicate trees overwrite the existing
/// value on a key match (upsert semantics); duplicate trees append.
pub(crate) fn tree_insert<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    root: u64,
    key: K,
    value: V,
) -> Result<u64>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let outcome = insert(ctx, root, key, value)?;
    grow_root(ctx, outcome)
}

fn insert<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    root: u64,
    key: K,
    value: V,
) -> Result<Modified<K>>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if root == NO_PAGE {
        let mut page: Page<K, V> = Page::new_leaf(ctx.revision);
        page.as_leaf_mut()
            .entries
            .push((KeyHolder::decoded(key), ValueHolder::single(value)));
        return Ok(Modified::Single(ctx.stage(&page)?));
    }

    let page = ctx.read_page(root)?;
    match page.body {
        PageBody::Leaf(mut leaf) => {
            let (idx, found) = leaf_search(&leaf.entries, &key, ctx.kc)?;
            if found {
                if ctx.allow_duplicates {
                    insert_duplicate(ctx, &mut leaf.entries[idx].1, value)?;
                } else {
                    leaf.entries[idx].1 = ValueHolder::single(value);
                }
            } else {
                leaf.entries
                    .insert(idx, (KeyHolder::decoded(key), ValueHolder::single(value)));
            }

            ctx.retire(root);

            if leaf.entries.len() <= ctx.branching_factor {
                let mut np: Page<K, V> = Page::new_leaf(ctx.revision);
                np.body = PageBody::Leaf(leaf);
                Ok(Modified::Single(ctx.stage(&np)?))
            } else {
                // Leaf split pivot: first key of the right half. Left half
                // keeps the ceiling share so a full leaf of B+1 entries
                // splits ⌈(B+1)/2⌉/⌊(B+1)/2⌋ (spec.md §4.6).
                let mid = (leaf.entries.len() + 1) / 2;
                let right_entries = leaf.entries.split_off(mid);
                let pivot = right_entries[0].0.clone();

                let mut left_page: Page<K, V> = Page::new_leaf(ctx.revision);
                left_page.body = PageBody::Leaf(LeafPage { entries: leaf.entries });
                let mut right_page: Page<K, V> = Page::new_leaf(ctx.revision);
                right_page.body = PageBody::Leaf(LeafPage { entries: right_entries });

                let left_ref = ctx.stage(&left_page)?;
                let right_ref = ctx.stage(&right_page)?;
                Ok(Modified::Split(left_ref, pivot, right_ref))
            }
        }
        PageBody::Node(mut node) => {
            let idx = child_index(&node.keys, &key, ctx.kc)?;
            let child_offset = node.children[idx].first_page;
            let outcome = insert(ctx, child_offset, key, value)?;

            ctx.retire(root);
            match outcome {
                Modified::Single(cref) => {
                    node.children[idx] = cref;
                    let mut np: Page<K, V> = Page::new_node(ctx.revision);
                    np.body = PageBody::Node(node);
                    Ok(Modified::Single(ctx.stage(&np)?))
                }
                Modified::Split(left, pivot, right) => {
                    node.children[idx] = left;
                    node.children.insert(idx + 1, right);
                    node.keys.insert(idx, pivot);

                    if node.keys.len() <= ctx.branching_factor {
                        let mut np: Page<K, V> = Page::new_node(ctx.revision);
                        np.body = PageBody::Node(node);
                        Ok(Modified::Single(ctx.stage(&np)?))
                    } else {
                        // Node split: promote the middle key, drop it from both halves.
                        let mid = node.keys.len() / 2;
                        let promoted = node.keys[mid].clone();
                        let right_keys = node.keys.split_off(mid + 1);
                        node.keys.truncate(mid);
                        let right_children = node.children.split_off(mid + 1);

                        let mut left_page: Page<K, V> = Page::new_node(ctx.revision);
                        left_page.body = PageBody::Node(NodePage {
                            keys: node.keys,
                            children: node.children,
                        });
                        let mut right_page: Page<K, V> = Page::new_node(ctx.revision);
                        right_page.body = PageBody::Node(NodePage {
                            keys: right_keys,
                            children: right_children,
                        });

                        let left_ref = ctx.stage(&left_page)?;
                        let right_ref = ctx.stage(&right_page)?;
                        Ok(Modified::Split(left_ref, promoted, right_ref))
                    }
                }
            }
        }
    }
}

/// Builds a fresh duplicate-value sub-tree `BTree<V, ()>` containing
/// `values`, returning its root offset and element count.
fn promote_to_subtree<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    values: Vec<V>,
) -> Result<(u64, usize)>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let count = values.len();
    let unit = UnitCodec;
    let mut sub_ctx = TreeCtx {
        paged_file: ctx.paged_file,
        page_cache: ctx.page_cache,
        allocator: &mut *ctx.allocator,
        pending: &mut *ctx.pending,
        freed: &mut *ctx.freed,
        kc: ctx.vc,
        vc: &unit,
        branching_factor: ctx.branching_factor,
        allow_duplicates: false,
        v_up: ctx.v_up,
        v_low: ctx.v_low,
        revision: ctx.revision,
    };
    let mut root = NO_PAGE;
    for v in values {
        let outcome = insert(&mut sub_ctx, root, v, ())?;
        root = grow_root(&mut sub_ctx, outcome)?;
    }
    Ok((root, count))
}

fn subtree_insert<F, K, V, KC, VC>(ctx: &mut TreeCtx<'_, F, KC, VC>, root: u64, value: V) -> Result<u64>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let unit = UnitCodec;
    let mut sub_ctx = TreeCtx {
        paged_file: ctx.paged_file,
        page_cache: ctx.page_cache,
        allocator: &mut *ctx.allocator,
        pending: &mut *ctx.pending,
        freed: &mut *ctx.freed,
        kc: ctx.vc,
        vc: &unit,
        branching_factor: ctx.branching_factor,
        allow_duplicates: false,
        v_up: ctx.v_up,
        v_low: ctx.v_low,
        revision: ctx.revision,
    };
    let outcome = insert(&mut sub_ctx, root, value, ())?;
    grow_root(&mut sub_ctx, outcome)
}

fn subtree_remove<F, K, V, KC, VC>(ctx: &mut TreeCtx<'_, F, KC, VC>, root: u64, value: &V) -> Result<(u64, bool)>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let unit = UnitCodec;
    let mut sub_ctx = TreeCtx {
        paged_file: ctx.paged_file,
        page_cache: ctx.page_cache,
        allocator: &mut *ctx.allocator,
        pending: &mut *ctx.pending,
        freed: &mut *ctx.freed,
        kc: ctx.vc,
        vc: &unit,
        branching_factor: ctx.branching_factor,
        allow_duplicates: false,
        v_up: ctx.v_up,
        v_low: ctx.v_low,
        revision: ctx.revision,
    };
    tree_delete(&mut sub_ctx, root, value, &DeleteTarget::Key)
}

fn insert_duplicate<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    holder: &mut ValueHolder<V>,
    value: V,
) -> Result<()>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    match holder {
        ValueHolder::Inline(vs) => {
            let mut pos = vs.len();
            for (i, v) in vs.iter().enumerate() {
                if ctx.vc.compare(&value, v) != Ordering::Greater {
                    pos = i;
                    break;
                }
            }
            vs.insert(pos, value);
            if vs.len() > ctx.v_up {
                let values = std::mem::take(vs);
                let (root, count) = promote_to_subtree(ctx, values)?;
                *holder = ValueHolder::SubTree { count, root };
            }
            Ok(())
        }
        ValueHolder::SubTree { root, count } => {
            *root = subtree_insert(ctx, *root, value)?;
            *count += 1;
            Ok(())
        }
    }
}

/// What a delete targets: the whole multiset at a key, or one duplicate
/// occurrence.
pub enum DeleteTarget<'a, V> {
    Key,
    Value(&'a V),
}

enum DeleteOutcome<K> {
    Absent,
    Removed(ChildRef),
    Underflow(ChildRef),
}

fn maybe_shrink_root<F, K, V, KC, VC>(ctx: &mut TreeCtx<'_, F, KC, VC>, mut root: u64) -> Result<u64>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    loop {
        if root == NO_PAGE {
            return Ok(root);
        }
        let page = ctx.read_page(root)?;
        match &page.body {
            PageBody::Leaf(leaf) if leaf.entries.is_empty() => {
                ctx.retire(root);
                return Ok(NO_PAGE);
            }
            PageBody::Node(node) if node.keys.is_empty() => {
                let only_child = node.children[0].first_page;
                ctx.retire(root);
                root = only_child;
                continue;
            }
            _ => return Ok(root),
        }
    }
}

/// Deletes `target` for `key`, returning the new root offset and whether
/// anything was actually removed.
pub(crate) fn tree_delete<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    root: u64,
    key: &K,
    target: &DeleteTarget<V>,
) -> Result<(u64, bool)>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if root == NO_PAGE {
        return Ok((NO_PAGE, false));
    }
    match delete_rec(ctx, root, key, target)? {
        DeleteOutcome::Absent => Ok((root, false)),
        DeleteOutcome::Removed(cref) => Ok((maybe_shrink_root(ctx, cref.first_page)?, true)),
        DeleteOutcome::Underflow(cref) => Ok((maybe_shrink_root(ctx, cref.first_page)?, true)),
    }
}

/// Removes a single occurrence of `value`, returning whether a value was
/// actually removed — distinct from whether the holder still has any
/// values left, which `delete_rec` checks separately via `is_empty()`.
fn remove_one_value<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    holder: &mut ValueHolder<V>,
    value: &V,
) -> Result<bool>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    match holder {
        ValueHolder::Inline(vs) => {
            match vs.iter().position(|v| ctx.vc.compare(v, value) == Ordering::Equal) {
                Some(pos) => {
                    vs.remove(pos);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        ValueHolder::SubTree { root, count } => {
            let (new_root, removed) = subtree_remove(ctx, *root, value)?;
            if !removed {
                *root = new_root;
                return Ok(false);
            }
            *count = count.saturating_sub(1);
            if *count <= ctx.v_low {
                let values = {
                    let mut out = Vec::new();
                    collect_ascending(ctx.paged_file, ctx.page_cache, ctx.pending.as_slice(), ctx.vc, new_root, &mut out)?;
                    out
                };
                free_subtree(ctx, new_root)?;
                *holder = ValueHolder::Inline(values);
            } else {
                *root = new_root;
            }
            Ok(true)
        }
    }
}

fn delete_rec<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    offset: u64,
    key: &K,
    target: &DeleteTarget<V>,
) -> Result<DeleteOutcome<K>>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let page = ctx.read_page(offset)?;
    let min_elems = (ctx.branching_factor / 2).max(1);

    match page.body {
        PageBody::Leaf(mut leaf) => {
            let (idx, found) = leaf_search(&leaf.entries, key, ctx.kc)?;
            if !found {
                return Ok(DeleteOutcome::Absent);
            }

            let remove_entry = match target {
                DeleteTarget::Key => {
                    if let ValueHolder::SubTree { root, .. } = &leaf.entries[idx].1 {
                        free_subtree(ctx, *root)?;
                    }
                    true
                }
                DeleteTarget::Value(v) => {
                    if !remove_one_value(ctx, &mut leaf.entries[idx].1, *v)? {
                        return Ok(DeleteOutcome::Absent);
                    }
                    leaf.entries[idx].1.is_empty()
                }
            };

            if remove_entry {
                leaf.entries.remove(idx);
            }

            ctx.retire(offset);
            let underflow = leaf.entries.len() < min_elems;
            let mut np: Page<K, V> = Page::new_leaf(ctx.revision);
            np.body = PageBody::Leaf(leaf);
            let cref = ctx.stage(&np)?;
            if underflow {
                Ok(DeleteOutcome::Underflow(cref))
            } else {
                Ok(DeleteOutcome::Removed(cref))
            }
        }
        PageBody::Node(mut node) => {
            let idx = child_index(&node.keys, key, ctx.kc)?;
            let child_offset = node.children[idx].first_page;
            let outcome = delete_rec(ctx, child_offset, key, target)?;

            match outcome {
                DeleteOutcome::Absent => Ok(DeleteOutcome::Absent),
                DeleteOutcome::Removed(cref) => {
                    node.children[idx] = cref;
                    ctx.retire(offset);
                    let mut np: Page<K, V> = Page::new_node(ctx.revision);
                    np.body = PageBody::Node(node);
                    Ok(DeleteOutcome::Removed(ctx.stage(&np)?))
                }
                DeleteOutcome::Underflow(cref) => {
                    node.children[idx] = cref;
                    rebalance(ctx, offset, node, idx, min_elems)
                }
            }
        }
    }
}

/// Borrows from or merges with a sibling of the child at `idx`, which the
/// caller has already determined is underflowed. Sibling choice favors the
/// larger sibling; ties go to the previous (left) sibling (spec.md §4.6).
fn rebalance<F, K, V, KC, VC>(
    ctx: &mut TreeCtx<'_, F, KC, VC>,
    old_offset: u64,
    mut node: NodePage<K>,
    idx: usize,
    min_elems: usize,
) -> Result<DeleteOutcome<K>>
where
    F: File,
    K: Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let left_idx = idx.checked_sub(1);
    let right_idx = if idx + 1 < node.children.len() {
        Some(idx + 1)
    } else {
        None
    };

    let left_page: Option<Page<K, V>> = left_idx
        .map(|i| ctx.read_page(node.children[i].first_page))
        .transpose()?;
    let right_page: Option<Page<K, V>> = right_idx
        .map(|i| ctx.read_page(node.children[i].first_page))
        .transpose()?;

    let use_left = match (&left_page, &right_page) {
        (Some(l), Some(r)) => l.len() >= r.len(),
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => unreachable!("an underflowed non-root child always has a sibling"),
    };

    let sib_idx = if use_left { left_idx.unwrap() } else { right_idx.unwrap() };
    let sibling = if use_left { left_page.unwrap() } else { right_page.unwrap() };
    let child = ctx.read_page(node.children[idx].first_page)?;
    let can_borrow = sibling.len() > min_elems;

    ctx.retire(node.children[idx].first_page);
    ctx.retire(node.children[sib_idx].first_page);

    if can_borrow {
        let (new_child, new_sibling, new_separator) = if use_left {
            let sep = node.keys[sib_idx].clone();
            borrow_from_left(ctx.revision, sibling, child, sep)
        } else {
            let sep = node.keys[idx].clone();
            borrow_from_right(ctx.revision, child, sibling, sep)
        };
        let child_cref = ctx.stage(&new_child)?;
        let sibling_cref = ctx.stage(&new_sibling)?;

        if use_left {
            node.children[sib_idx] = sibling_cref;
            node.children[idx] = child_cref;
            node.keys[sib_idx] = new_separator;
        } else {
            node.children[idx] = child_cref;
            node.children[sib_idx] = sibling_cref;
            node.keys[idx] = new_separator;
        }

        ctx.retire(old_offset);
        let mut np: Page<K, V> = Page::new_node(ctx.revision);
        np.body = PageBody::Node(node);
        Ok(DeleteOutcome::Removed(ctx.stage(&np)?))
    } else {
        let separator_idx = if use_left { sib_idx } else { idx };
        let separator = node.keys[separator_idx].clone();
        let merged = if use_left {
            merge_pages(ctx.revision, sibling, child, separator)
        } else {
            merge_pages(ctx.revision, child, sibling, separator)
        };
        let merged_cref = ctx.stage(&merged)?;

        node.keys.remove(separator_idx);
        let drop_idx = if use_left { idx } else { sib_idx };
        node.children.remove(drop_idx);
        let keep_idx = if use_left { sib_idx } else { idx };
        node.children[keep_idx] = merged_cref;

        ctx.retire(old_offset);
        let underflow = node.keys.len() < min_elems;
        let mut np: Page<K, V> = Page::new_node(ctx.revision);
        np.body = PageBody::Node(node);
        let cref = ctx.stage(&np)?;
        if underflow {
            Ok(DeleteOutcome::Underflow(cref))
        } else {
            Ok(DeleteOutcome::Removed(cref))
        }
    }
}

/// Moves the left sibling's last entry/child into the right page.
/// Returns `(new_right_as_child, new_left_as_sibling, new_separator)`.
fn borrow_from_left<K, V>(
    revision: u64,
    mut left: Page<K, V>,
    mut right: Page<K, V>,
    separator: KeyHolder<K>,
) -> (Page<K, V>, Page<K, V>, KeyHolder<K>)
where
    K: Clone,
    V: Clone,
{
    match (&mut left.body, &mut right.body) {
        (PageBody::Leaf(l), PageBody::Leaf(r)) => {
            let moved = l.entries.pop().expect("borrow requires spare capacity");
            let new_sep = moved.0.clone();
            r.entries.insert(0, moved);
            (
                page_with(Page::new_leaf(revision), PageBody::Leaf(r.clone())),
                page_with(Page::new_leaf(revision), PageBody::Leaf(l.clone())),
                new_sep,
            )
        }
        (PageBody::Node(l), PageBody::Node(r)) => {
            let moved_child = l.children.pop().expect("borrow requires spare capacity");
            let moved_key = l.keys.pop().expect("borrow requires spare capacity");
            r.children.insert(0, moved_child);
            r.keys.insert(0, separator);
            (
                page_with(Page::new_node(revision), PageBody::Node(r.clone())),
                page_with(Page::new_node(revision), PageBody::Node(l.clone())),
                moved_key,
            )
        }
        _ => unreachable!("siblings at the same level always share a page kind"),
    }
}

/// Moves the right sibling's first entry/child into the left page.
/// Returns `(new_left_as_child, new_right_as_sibling, new_separator)`.
fn borrow_from_right<K, V>(
    revision: u64,
    mut left: Page<K, V>,
    mut right: Page<K, V>,
    separator: KeyHolder<K>,
) -> (Page<K, V>, Page<K, V>, KeyHolder<K>)
where
    K: Clone,
    V: Clone,
{
    match (&mut left.body, &mut right.body) {
        (PageBody::Leaf(l), PageBody::Leaf(r)) => {
            let moved = r.entries.remove(0);
            let new_sep = r.entries[0].0.clone();
            l.entries.push(moved);
            (
                page_with(Page::new_leaf(revision), PageBody::Leaf(l.clone())),
                page_with(Page::new_leaf(revision), PageBody::Leaf(r.clone())),
                new_sep,
            )
        }
        (PageBody::Node(l), PageBody::Node(r)) => {
            let moved_child = r.children.remove(0);
            let moved_key = r.keys.remove(0);
            l.children.push(moved_child);
            l.keys.push(separator);
            (
                page_with(Page::new_node(revision), PageBody::Node(l.clone())),
                page_with(Page::new_node(revision), PageBody::Node(r.clone())),
                moved_key,
            )
        }
        _ => unreachable!("siblings at the same level always share a page kind"),
    }
}

fn merge_pages<K, V>(revision: u64, left: Page<K, V>, right: Page<K, V>, separator: KeyHolder<K>) -> Page<K, V> {
    match (left.body, right.body) {
        (PageBody::Leaf(mut l), PageBody::Leaf(mut r)) => {
            l.entries.append(&mut r.entries);
            page_with(Page::new_leaf(revision), PageBody::Leaf(l))
        }
        (PageBody::Node(mut l), PageBody::Node(mut r)) => {
            l.keys.push(separator);
            l.keys.append(&mut r.keys);
            l.children.append(&mut r.children);
            page_with(Page::new_node(revision), PageBody::Node(l))
        }
        _ => unreachable!("siblings at the same level always share a page kind"),
    }
}

fn page_with<K, V>(mut page: Page<K, V>, body: PageBody<K, V>) -> Page<K, V> {
    page.body = body;
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FreeListAllocator;
    use crate::codec::U64Codec;
    use crate::file::MemoryFile;

    struct Fixture {
        paged_file: PagedFile<MemoryFile>,
        cache: Cache<u64, Bytes>,
        allocator: FreeListAllocator,
        pending: Vec<PendingPage>,
        freed: Vec<u64>,
    }

    impl Fixture {
        fn new() -> Self {
            let pf = PagedFile::new(MemoryFile::new(), 512);
            Self {
                paged_file: pf,
                cache: Cache::new(64),
                allocator: FreeListAllocator::new(NO_PAGE, NO_PAGE, 512),
                pending: Vec::new(),
                freed: Vec::new(),
            }
        }

        fn ctx<'a>(&'a mut self, kc: &'a U64Codec, vc: &'a U64Codec, allow_duplicates: bool) -> TreeCtx<'a, MemoryFile, U64Codec, U64Codec> {
            TreeCtx {
                paged_file: &self.paged_file,
                page_cache: &self.cache,
                allocator: &mut self.allocator,
                pending: &mut self.pending,
                freed: &mut self.freed,
                kc,
                vc,
                branching_factor: 4,
                allow_duplicates,
                v_up: 3,
                v_low: 1,
                revision: 1,
            }
        }

        fn flush(&mut self) {
            for p in self.pending.drain(..) {
                self.paged_file.write_record(&p.offsets, &p.bytes).unwrap();
            }
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut fx = Fixture::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            for k in 0..20u64 {
                root = tree_insert(&mut ctx, root, k, k * 10).unwrap();
            }
        }
        fx.flush();

        for k in 0..20u64 {
            let got = tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &k).unwrap();
            assert_eq!(got, Some(vec![k * 10]));
        }
        assert_eq!(
            tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &999).unwrap(),
            None
        );
    }

    #[test]
    fn insert_overwrites_without_duplicates() {
        let mut fx = Fixture::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            root = tree_insert(&mut ctx, root, 1, 100).unwrap();
            root = tree_insert(&mut ctx, root, 1, 200).unwrap();
        }
        fx.flush();
        assert_eq!(
            tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &1).unwrap(),
            Some(vec![200])
        );
    }

    #[test]
    fn duplicate_values_promote_to_subtree_and_back() {
        let mut fx = Fixture::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = fx.ctx(&kc, &vc, true);
            for v in [5u64, 1, 4, 2] {
                root = tree_insert(&mut ctx, root, 1, v).unwrap();
            }
        }
        fx.flush();
        let mut got = tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &1).unwrap().unwrap();
        got.sort();
        assert_eq!(got, vec![1, 2, 4, 5]);

        {
            let mut ctx = fx.ctx(&kc, &vc, true);
            let (new_root, found) = tree_delete(&mut ctx, root, &1, &DeleteTarget::Value(&5)).unwrap();
            assert!(found);
            root = new_root;
            let (new_root, found) = tree_delete(&mut ctx, root, &1, &DeleteTarget::Value(&4)).unwrap();
            assert!(found);
            root = new_root;
        }
        fx.flush();
        let mut got = tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &1).unwrap().unwrap();
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn delete_shrinks_tree_and_rebalances() {
        let mut fx = Fixture::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            for k in 0..40u64 {
                root = tree_insert(&mut ctx, root, k, k).unwrap();
            }
        }
        fx.flush();

        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            for k in 0..35u64 {
                let (new_root, found) = tree_delete(&mut ctx, root, &k, &DeleteTarget::Key).unwrap();
                assert!(found, "key {k} should have been present");
                root = new_root;
            }
        }
        fx.flush();

        for k in 0..35u64 {
            assert_eq!(
                tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &k).unwrap(),
                None
            );
        }
        for k in 35..40u64 {
            assert_eq!(
                tree_get(&fx.paged_file, &fx.cache, &[], &kc, &vc, root, &k).unwrap(),
                Some(vec![k])
            );
        }
    }

    #[test]
    fn deleting_everything_empties_the_tree() {
        let mut fx = Fixture::new();
        let kc = U64Codec;
        let vc = U64Codec;
        let mut root = NO_PAGE;
        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            for k in 0..10u64 {
                root = tree_insert(&mut ctx, root, k, k).unwrap();
            }
        }
        fx.flush();

        {
            let mut ctx = fx.ctx(&kc, &vc, false);
            for k in 0..10u64 {
                let (new_root, found) = tree_delete(&mut ctx, root, &k, &DeleteTarget::Key).unwrap();
                assert!(found);
                root = new_root;
            }
        }
        assert_eq!(root, NO_PAGE);
    }
}
