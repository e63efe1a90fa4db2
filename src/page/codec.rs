//! Byte-exact (de)serialization of a logical page, per spec.md §4.4:
//!
//! ```text
//! 0..8    revision (i64)
//! 8..12   nbElems (i32; negative => Node, non-negative => Leaf)
//! 12..16  serialized-data size (i32)
//! 16..    payload: interleaved value/key records in index order; for
//!         Nodes, one extra value record follows the last key
//! ```

use super::{ChildRef, KeyHolder, LeafPage, NodePage, Page, PageBody, ValueHolder};
use crate::codec::Codec;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes a page's logical body (everything from offset 16 on) plus the
/// 16-byte fixed prelude, returning the full record payload to hand to
/// `PagedFile::write_record`.
pub(crate) fn encode_page<K, V, KC, VC>(
    page: &Page<K, V>,
    kc: &KC,
    vc: &VC,
) -> Vec<u8>
where
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    let mut payload = BytesMut::new();

    let nb_elems: i32 = match &page.body {
        PageBody::Leaf(leaf) => {
            for (key, value) in &leaf.entries {
                encode_value_record(&mut payload, value, vc);
                encode_key_record(&mut payload, key, kc);
            }
            leaf.entries.len() as i32
        }
        PageBody::Node(node) => {
            node.assert_shape();
            for i in 0..node.keys.len() {
                encode_child_record(&mut payload, &node.children[i]);
                encode_key_record(&mut payload, &node.keys[i], kc);
            }
            encode_child_record(&mut payload, &node.children[node.keys.len()]);
            -(node.keys.len() as i32) - 1
        }
    };

    let mut out = BytesMut::with_capacity(16 + payload.len());
    out.put_i64(page.revision as i64);
    out.put_i32(nb_elems);
    out.put_i32(payload.len() as i32);
    out.extend_from_slice(&payload[..]);

    out.to_vec()
}

/// Decodes a page's full record bytes (as returned by
/// `PagedFile::read_record`) back into a `Page`.
pub(crate) fn decode_page<K, V, KC, VC>(
    offset: u64,
    mut bytes: Bytes,
    kc: &KC,
    vc: &VC,
) -> Result<Page<K, V>>
where
    KC: Codec<Item = K>,
    VC: Codec<Item = V>,
{
    if bytes.len() < 16 {
        return Err(Error::corrupt("page record shorter than fixed prelude"));
    }

    let revision = bytes.get_i64() as u64;
    let nb_elems = bytes.get_i32();
    let data_size = bytes.get_i32() as usize;

    if bytes.remaining() < data_size {
        return Err(Error::corrupt(format!(
            "page at {} declares {} payload bytes but only {} remain",
            offset,
            data_size,
            bytes.remaining()
        )));
    }

    let body = if nb_elems >= 0 {
        let mut entries = Vec::with_capacity(nb_elems as usize);
        for _ in 0..nb_elems {
            let value = decode_value_record(&mut bytes, vc)?;
            let key = decode_key_record(&mut bytes)?;
            entries.push((key, value));
        }
        PageBody::Leaf(LeafPage { entries })
    } else {
        let num_keys = (-nb_elems - 1) as usize;
        let mut keys = Vec::with_capacity(num_keys);
        let mut children = Vec::with_capacity(num_keys + 1);
        for _ in 0..num_keys {
            children.push(decode_child_record(&mut bytes)?);
            keys.push(decode_key_record(&mut bytes)?);
        }
        children.push(decode_child_record(&mut bytes)?);
        PageBody::Node(NodePage { keys, children })
    };

    Ok(Page {
        offset,
        revision,
        body,
    })
}

fn encode_key_record<K, KC: Codec<Item = K>>(buf: &mut BytesMut, key: &KeyHolder<K>, kc: &KC) {
    let bytes = key.to_bytes(kc);
    buf.put_u32(bytes.len() as u32);
    buf.extend_from_slice(&bytes);
}

fn decode_key_record<K>(buf: &mut Bytes) -> Result<KeyHolder<K>> {
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::corrupt("key record truncated"));
    }
    let bytes = buf.copy_to_bytes(len).to_vec();
    Ok(KeyHolder::serialized(bytes))
}

fn encode_value_record<V, VC: Codec<Item = V>>(buf: &mut BytesMut, value: &ValueHolder<V>, vc: &VC) {
    match value {
        ValueHolder::Inline(values) => {
            buf.put_i32(values.len() as i32);
            let mut inner = BytesMut::new();
            for v in values {
                let bytes = vc.serialize(v);
                inner.put_u32(bytes.len() as u32);
                inner.extend_from_slice(&bytes);
            }
            buf.put_u32(inner.len() as u32);
            buf.extend_from_slice(&inner);
        }
        ValueHolder::SubTree { count, root } => {
            buf.put_i32(-(*count as i32) - 1);
            buf.put_u64(*root);
        }
    }
}

fn decode_value_record<V, VC: Codec<Item = V>>(buf: &mut Bytes, vc: &VC) -> Result<ValueHolder<V>> {
    let count = buf.get_i32();
    if count >= 0 {
        let inner_len = buf.get_u32() as usize;
        if buf.remaining() < inner_len {
            return Err(Error::corrupt("inline value buffer truncated"));
        }
        let mut inner = buf.copy_to_bytes(inner_len);
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = inner.get_u32() as usize;
            if inner.remaining() < len {
                return Err(Error::corrupt("inline value entry truncated"));
            }
            let bytes = inner.copy_to_bytes(len);
            values.push(vc.deserialize(&bytes)?);
        }
        Ok(ValueHolder::Inline(values))
    } else {
        let count = (-count - 1) as usize;
        let root = buf.get_u64();
        Ok(ValueHolder::SubTree { count, root })
    }
}

fn encode_child_record(buf: &mut BytesMut, child: &ChildRef) {
    buf.put_u64(child.first_page);
    buf.put_u64(child.last_page);
}

fn decode_child_record(buf: &mut Bytes) -> Result<ChildRef> {
    if buf.remaining() < 16 {
        return Err(Error::corrupt("child record truncated"));
    }
    let first_page = buf.get_u64();
    let last_page = buf.get_u64();
    Ok(ChildRef {
        first_page,
        last_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{StringCodec, U64Codec};
    use crate::page::KeyHolder;

    #[test]
    fn leaf_round_trips() {
        let kc = StringCodec;
        let vc = U64Codec;

        let mut page: Page<String, u64> = Page::new_leaf(7);
        page.as_leaf_mut().entries.push((
            KeyHolder::decoded("a".to_string()),
            ValueHolder::single(1),
        ));
        page.as_leaf_mut().entries.push((
            KeyHolder::decoded("b".to_string()),
            ValueHolder::Inline(vec![2, 3]),
        ));

        let encoded = encode_page(&page, &kc, &vc);
        let decoded: Page<String, u64> =
            decode_page(42, Bytes::from(encoded), &kc, &vc).unwrap();

        assert_eq!(decoded.offset, 42);
        assert_eq!(decoded.revision, 7);
        let leaf = decoded.as_leaf();
        assert_eq!(leaf.entries.len(), 2);
        assert_eq!(leaf.entries[0].0.decode(&kc).unwrap(), "a");
        assert_eq!(leaf.entries[1].1.as_inline().unwrap(), &[2, 3]);
    }

    #[test]
    fn node_round_trips() {
        let kc = StringCodec;
        let vc = U64Codec;

        let mut page: Page<String, u64> = Page::new_node(3);
        let node = page.as_node_mut();
        node.keys.push(KeyHolder::decoded("m".to_string()));
        node.children.push(ChildRef::single(100));
        node.children.push(ChildRef::single(200));

        let encoded = encode_page(&page, &kc, &vc);
        let decoded: Page<String, u64> =
            decode_page(55, Bytes::from(encoded), &kc, &vc).unwrap();

        let node = decoded.as_node();
        assert_eq!(node.keys.len(), 1);
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[0].first_page, 100);
        assert_eq!(node.children[1].first_page, 200);
    }

    #[test]
    fn subtree_value_holder_round_trips() {
        let kc = StringCodec;
        let vc = U64Codec;

        let mut page: Page<String, u64> = Page::new_leaf(1);
        page.as_leaf_mut().entries.push((
            KeyHolder::decoded("k".to_string()),
            ValueHolder::SubTree {
                count: 5,
                root: 999,
            },
        ));

        let encoded = encode_page(&page, &kc, &vc);
        let decoded: Page<String, u64> =
            decode_page(1, Bytes::from(encoded), &kc, &vc).unwrap();

        match &decoded.as_leaf().entries[0].1 {
            ValueHolder::SubTree { count, root } => {
                assert_eq!(*count, 5);
                assert_eq!(*root, 999);
            }
            ValueHolder::Inline(_) => panic!("expected subtree"),
        }
    }
}
