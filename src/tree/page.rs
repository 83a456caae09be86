//! Tree pages and their encoding.
//!
//! ```text
//! leaf:      count | (key, value)*
//! internal:  count | (key, value, child:u64)*
//! root:      size  | leaf or internal payload
//! ```
//!
//! Counts, sizes and the lengths of keys and values are compressed unsigned
//! integers, child addresses big-endian u64. In an internal page the
//! (key, value) pair of slot `i` is a lower bound of everything below child
//! `i`; slot 0 is a catch-all. Values in internal pages are only non-empty in
//! trees with duplicates, where entries are ordered by the pair.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};

use crate::encoding::varint::{self, Reader};
use crate::error::Result;
use crate::log::loggable::{BOTTOM_ROOT, INTERNAL, INTERNAL_ROOT, LEAF};
use crate::log::Address;
use crate::Error;

pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Leaf(Vec<Entry>),
    Internal(Vec<(Entry, Address)>),
}

/// A page read from the log.
#[derive(Debug)]
pub struct LoadedPage {
    pub address: Address,
    /// Length of the loggable holding the page.
    pub length: u64,
    pub page: Page,
}

/// Index of the first entry not less than `target`.
pub fn lower_bound(duplicates: bool, entries: &[Entry], target: (&[u8], &[u8])) -> usize {
    entries.partition_point(|(key, value)| compare(duplicates, (key, value), target) == Ordering::Less)
}

/// Orders entries by key, or by (key, value) in trees with duplicates.
pub fn compare(duplicates: bool, a: (&[u8], &[u8]), b: (&[u8], &[u8])) -> Ordering {
    match a.0.cmp(b.0) {
        Ordering::Equal if duplicates => a.1.cmp(b.1),
        ordering => ordering,
    }
}

/// Index of the child of an internal page that may hold `target`.
pub fn child_index<C>(duplicates: bool, slots: &[(Entry, C)], target: (&[u8], &[u8])) -> usize {
    // first slot whose bound is greater than the target, minus one
    let upper = slots.partition_point(|((key, value), _)| {
        compare(duplicates, (key, value), target) != Ordering::Greater
    });
    upper.saturating_sub(1)
}

/// Bytes one entry takes in an encoded page, plus the child address of an
/// internal slot.
pub fn encoded_entry_len((key, value): (&[u8], &[u8]), internal: bool) -> usize {
    let child = if internal { 8 } else { 0 };
    varint::encoded_len(key.len() as u64)
        + key.len()
        + varint::encoded_len(value.len() as u64)
        + value.len()
        + child
}

impl Page {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Page::Leaf(entries) => entries.len(),
            Page::Internal(slots) => slots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest entry or bound of the page.
    pub fn first(&self) -> Option<&Entry> {
        match self {
            Page::Leaf(entries) => entries.first(),
            Page::Internal(slots) => slots.first().map(|(bound, _)| bound),
        }
    }

    pub fn type_id(&self, root: bool) -> u8 {
        match (self, root) {
            (Page::Leaf(_), false) => LEAF,
            (Page::Internal(_), false) => INTERNAL,
            (Page::Leaf(_), true) => BOTTOM_ROOT,
            (Page::Internal(_), true) => INTERNAL_ROOT,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Page::Leaf(entries) => {
                varint::write_u64(buf, entries.len() as u64);
                for (key, value) in entries {
                    varint::write_prefixed(buf, key);
                    varint::write_prefixed(buf, value);
                }
            }
            Page::Internal(slots) => {
                varint::write_u64(buf, slots.len() as u64);
                for ((key, value), child) in slots {
                    varint::write_prefixed(buf, key);
                    varint::write_prefixed(buf, value);
                    let mut address = [0u8; 8];
                    BigEndian::write_u64(&mut address, *child);
                    buf.extend_from_slice(&address);
                }
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes a root page, the tree size first.
    pub fn encode_root(&self, size: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        varint::write_u64(&mut buf, size);
        self.encode_into(&mut buf);
        buf
    }

    /// Decodes the data of a loggable of type `type_id`. Returns the page and
    /// for root pages the tree size.
    pub fn decode(address: Address, type_id: u8, data: &[u8]) -> Result<(Page, Option<u64>)> {
        let corrupt = |e: Error| {
            Error::StructureCorruption(format!("Malformed page at address {}: {}", address, e))
        };

        let mut reader = Reader::new(data);
        let size = match type_id {
            BOTTOM_ROOT | INTERNAL_ROOT => Some(reader.read_u64().map_err(corrupt)?),
            LEAF | INTERNAL => None,
            other => {
                return Err(Error::StructureCorruption(format!(
                    "Unexpected page type {} at address {}",
                    other, address
                )))
            }
        };

        let count = reader.read_u64().map_err(corrupt)? as usize;
        let page = if matches!(type_id, LEAF | BOTTOM_ROOT) {
            let mut entries = Vec::with_capacity(count.min(data.len()));
            for _ in 0..count {
                let key = reader.read_prefixed().map_err(corrupt)?.to_vec();
                let value = reader.read_prefixed().map_err(corrupt)?.to_vec();
                entries.push((key, value));
            }
            Page::Leaf(entries)
        } else {
            let mut slots = Vec::with_capacity(count.min(data.len()));
            for _ in 0..count {
                let key = reader.read_prefixed().map_err(corrupt)?.to_vec();
                let value = reader.read_prefixed().map_err(corrupt)?.to_vec();
                let child = BigEndian::read_u64(reader.read_bytes(8).map_err(corrupt)?);
                slots.push(((key, value), child));
            }
            if slots.is_empty() {
                return Err(Error::StructureCorruption(format!(
                    "Internal page without children at address {}",
                    address
                )));
            }
            Page::Internal(slots)
        };

        if !reader.is_empty() {
            return Err(Error::StructureCorruption(format!(
                "Trailing bytes in page at address {}",
                address
            )));
        }
        Ok((page, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> Entry {
        (key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[test]
    fn test_leaf_encoding() {
        let page = Page::Leaf(vec![entry("a", "1"), entry("b", "22")]);
        let (decoded, size) = Page::decode(0, LEAF, &page.encode()).unwrap();
        assert_eq!(decoded, page);
        assert_eq!(size, None);
    }

    #[test]
    fn test_root_carries_size() {
        let page = Page::Internal(vec![(entry("a", ""), 10), (entry("m", ""), 2048)]);
        let (decoded, size) = Page::decode(0, INTERNAL_ROOT, &page.encode_root(1234)).unwrap();
        assert_eq!(decoded, page);
        assert_eq!(size, Some(1234));
    }

    #[test]
    fn test_unexpected_type() {
        let page = Page::Leaf(vec![]);
        assert!(matches!(
            Page::decode(0, 1, &page.encode()),
            Err(Error::StructureCorruption(_))
        ));
    }

    #[test]
    fn test_truncated_page() {
        let page = Page::Leaf(vec![entry("key", "value")]);
        let bytes = page.encode();
        assert!(matches!(
            Page::decode(0, LEAF, &bytes[..bytes.len() - 1]),
            Err(Error::StructureCorruption(_))
        ));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            Page::decode(0, LEAF, &longer),
            Err(Error::StructureCorruption(_))
        ));
    }

    #[test]
    fn test_child_index() {
        let slots = vec![(entry("", ""), 1), (entry("f", ""), 2), (entry("p", ""), 3)];
        assert_eq!(child_index(false, &slots, (b"a", b"")), 0);
        assert_eq!(child_index(false, &slots, (b"f", b"")), 1);
        assert_eq!(child_index(false, &slots, (b"g", b"")), 1);
        assert_eq!(child_index(false, &slots, (b"z", b"")), 2);
    }

    #[test]
    fn test_compare_with_duplicates() {
        assert_eq!(compare(false, (b"k", b"1"), (b"k", b"2")), Ordering::Equal);
        assert_eq!(compare(true, (b"k", b"1"), (b"k", b"2")), Ordering::Less);
        assert_eq!(compare(true, (b"a", b"9"), (b"k", b"0")), Ordering::Less);
    }
}
