//! The logical page model (spec.md §4.4): `Leaf`/`Node` as a tagged sum
//! type, and the `KeyHolder`/`ValueHolder` lazy wrappers around them.
//!
//! Grounded on `src/tree/node.rs`'s `Node<K, V> { metadata, keys, values,
//! children }`, which distinguished leaves from internal nodes with a
//! boolean `is_leaf` flag; spec.md's Design Notes ask for a proper sum
//! type instead (`PageBody::Leaf`/`PageBody::Node`), which is what's built
//! here.

mod codec;

pub(crate) use codec::{decode_page, encode_page};

use crate::codec::Codec;
use crate::error::{fmt_or_unset, Result};
use std::fmt;

pub(crate) const NO_PAGE: u64 = crate::paged_file::NO_PAGE;

/// A lazily-decoded key: either the domain value, its serialized bytes, or
/// both (once a value has been decoded once it is cheap to re-serialize,
/// but this crate does not cache that round trip — see DESIGN.md).
#[derive(Clone)]
pub(crate) enum KeyHolder<K> {
    Decoded(K),
    Serialized(Vec<u8>),
}

impl<K: Clone> KeyHolder<K> {
    pub fn decoded(k: K) -> Self {
        KeyHolder::Decoded(k)
    }

    pub fn serialized(bytes: Vec<u8>) -> Self {
        KeyHolder::Serialized(bytes)
    }

    pub fn decode<C: Codec<Item = K>>(&self, codec: &C) -> Result<K> {
        match self {
            KeyHolder::Decoded(k) => Ok(k.clone()),
            KeyHolder::Serialized(b) => codec.deserialize(b),
        }
    }

    pub fn to_bytes<C: Codec<Item = K>>(&self, codec: &C) -> Vec<u8> {
        match self {
            KeyHolder::Decoded(k) => codec.serialize(k),
            KeyHolder::Serialized(b) => b.clone(),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyHolder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyHolder::Decoded(k) => fmt_or_unset(Some(k), f),
            KeyHolder::Serialized(_) => write!(f, "<serialized>"),
        }
    }
}

/// A value holder: either an inline array of up to `v_up` values (ordered
/// by the value comparator when duplicates are allowed), or an offset to
/// a sub-tree storing the full multiset (spec.md §3, I5).
#[derive(Debug, Clone)]
pub(crate) enum ValueHolder<V> {
    Inline(Vec<V>),
    SubTree { count: usize, root: u64 },
}

impl<V: Clone> ValueHolder<V> {
    pub fn single(v: V) -> Self {
        ValueHolder::Inline(vec![v])
    }

    pub fn len(&self) -> usize {
        match self {
            ValueHolder::Inline(vs) => vs.len(),
            ValueHolder::SubTree { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_subtree(&self) -> bool {
        matches!(self, ValueHolder::SubTree { .. })
    }

    pub fn as_inline(&self) -> Option<&[V]> {
        match self {
            ValueHolder::Inline(vs) => Some(vs),
            ValueHolder::SubTree { .. } => None,
        }
    }
}

/// A child pointer: the first and last page-IO offsets of the child
/// page's chain (spec.md §4.4's "Node value record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildRef {
    pub first_page: u64,
    pub last_page: u64,
}

impl ChildRef {
    pub fn single(offset: u64) -> Self {
        Self {
            first_page: offset,
            last_page: offset,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct LeafPage<K, V> {
    pub entries: Vec<(KeyHolder<K>, ValueHolder<V>)>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct NodePage<K> {
    pub keys: Vec<KeyHolder<K>>,
    pub children: Vec<ChildRef>,
}

impl<K> NodePage<K> {
    pub fn assert_shape(&self) {
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
    }
}

#[derive(Debug, Clone)]
pub(crate) enum PageBody<K, V> {
    Leaf(LeafPage<K, V>),
    Node(NodePage<K>),
}

/// An in-memory mirror of a logical page. `offset` is `NO_PAGE` until the
/// page has been written during a commit.
#[derive(Debug, Clone)]
pub(crate) struct Page<K, V> {
    pub offset: u64,
    pub revision: u64,
    pub body: PageBody<K, V>,
}

impl<K, V> Page<K, V> {
    pub fn new_leaf(revision: u64) -> Self {
        Self {
            offset: NO_PAGE,
            revision,
            body: PageBody::Leaf(LeafPage::default()),
        }
    }

    pub fn new_node(revision: u64) -> Self {
        Self {
            offset: NO_PAGE,
            revision,
            body: PageBody::Node(NodePage::default()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, PageBody::Leaf(_))
    }

    pub fn as_leaf(&self) -> &LeafPage<K, V> {
        match &self.body {
            PageBody::Leaf(l) => l,
            PageBody::Node(_) => panic!("expected leaf page"),
        }
    }

    pub fn as_leaf_mut(&mut self) -> &mut LeafPage<K, V> {
        match &mut self.body {
            PageBody::Leaf(l) => l,
            PageBody::Node(_) => panic!("expected leaf page"),
        }
    }

    pub fn as_node(&self) -> &NodePage<K> {
        match &self.body {
            PageBody::Node(n) => n,
            PageBody::Leaf(_) => panic!("expected node page"),
        }
    }

    pub fn as_node_mut(&mut self) -> &mut NodePage<K> {
        match &mut self.body {
            PageBody::Node(n) => n,
            PageBody::Leaf(_) => panic!("expected node page"),
        }
    }

    pub fn len(&self) -> usize {
        match &self.body {
            PageBody::Leaf(l) => l.entries.len(),
            PageBody::Node(n) => n.keys.len(),
        }
    }
}
