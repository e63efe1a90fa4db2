//! The serializer contract (spec.md §4.3) and a handful of minimal
//! reference codecs used by tests and simple callers.
//!
//! Concrete scalar serializers are explicitly out of scope for the core
//! (spec.md §1); `StringCodec`/`BytesCodec`/`U64Codec` below exist only
//! as lightweight, obviously-correct implementations of the contract so
//! the engine is exercisable without a caller supplying their own.

use std::cmp::Ordering;
use std::fmt;

/// A pluggable key or value codec.
///
/// Implementations must be deterministic and total: `compare` has to
/// agree with the ordering implied by repeated `serialize`/`deserialize`
/// round trips, since the B+Tree orders pages by `compare`, not by the
/// byte representation.
pub trait Codec: fmt::Debug + Send + Sync {
    type Item: Clone + fmt::Debug;

    /// A stable identifier persisted in the Tree Header so a reopened
    /// file can be checked against the codec the caller supplies.
    fn name(&self) -> &'static str;

    fn serialize(&self, item: &Self::Item) -> Vec<u8>;

    fn deserialize(&self, bytes: &[u8]) -> crate::error::Result<Self::Item>;

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> Ordering;
}

/// Raw byte strings, ordered lexicographically.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Vec<u8>;

    fn name(&self) -> &'static str {
        "bytes"
    }

    fn serialize(&self, item: &Self::Item) -> Vec<u8> {
        item.clone()
    }

    fn deserialize(&self, bytes: &[u8]) -> crate::error::Result<Self::Item> {
        Ok(bytes.to_vec())
    }

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> Ordering {
        a.cmp(b)
    }
}

/// UTF-8 strings, ordered by byte value (matches spec.md's S1-S3 scenarios
/// which use "the string serializer").
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn name(&self) -> &'static str {
        "string"
    }

    fn serialize(&self, item: &Self::Item) -> Vec<u8> {
        item.as_bytes().to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> crate::error::Result<Self::Item> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| crate::error::Error::SerializerCreation(e.to_string()))
    }

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }
}

/// Fixed-width big-endian `u64`, ordered numerically.
#[derive(Debug, Default, Clone, Copy)]
pub struct U64Codec;

impl Codec for U64Codec {
    type Item = u64;

    fn name(&self) -> &'static str {
        "u64"
    }

    fn serialize(&self, item: &Self::Item) -> Vec<u8> {
        item.to_be_bytes().to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> crate::error::Result<Self::Item> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| crate::error::Error::SerializerCreation("expected 8 bytes".into()))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn compare(&self, a: &Self::Item, b: &Self::Item) -> Ordering {
        a.cmp(b)
    }
}

/// The unit codec: used internally for duplicate-value sub-trees, which
/// are a `BTree<V, ()>` set keyed by the outer tree's value type (spec.md
/// §3, "Sub-tree value holder").
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UnitCodec;

impl Codec for UnitCodec {
    type Item = ();

    fn name(&self) -> &'static str {
        "unit"
    }

    fn serialize(&self, _item: &Self::Item) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&self, _bytes: &[u8]) -> crate::error::Result<Self::Item> {
        Ok(())
    }

    fn compare(&self, _a: &Self::Item, _b: &Self::Item) -> Ordering {
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_codec_round_trips_and_orders() {
        let c = StringCodec;
        let a = "alpha".to_string();
        let encoded = c.serialize(&a);
        assert_eq!(c.deserialize(&encoded).unwrap(), a);
        assert_eq!(c.compare(&"a".to_string(), &"b".to_string()), Ordering::Less);
    }

    #[test]
    fn u64_codec_orders_numerically_not_lexicographically() {
        let c = U64Codec;
        assert_eq!(c.compare(&9, &10), Ordering::Less);
        let encoded = c.serialize(&300);
        assert_eq!(c.deserialize(&encoded).unwrap(), 300);
    }
}
