//! Leaf pages: sorted key/value items
//!
//! Serialized layout:
//!
//! ```text
//! chkleaf:\n
//! <maximum_size>\n<key_width>\n<item_count>\n<common_prefix>\n
//! <serialised key minus common prefix>\x00<value line count>\n
//! <value lines>...
//! ```
//!
//! The size of the serialized form is tracked incrementally so the map can
//! decide when a leaf has to split without serializing it.

use super::internal::InternalNode;
use super::node::{
    common_prefix, common_prefix_many, decimal_len, parse_count, split_lines, Node, Split,
    LEAF_MAGIC,
};
use super::pager::Pager;
use super::search_key::SearchKeyFunc;
use crate::model::{ChkKey, Key};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A page holding key/value items
#[derive(Clone, Debug)]
pub struct LeafNode {
    items: BTreeMap<Key, Vec<u8>>,
    maximum_size: usize,
    key_width: usize,
    /// Sum of the item line sizes before prefix compression
    raw_size: usize,
    /// Common prefix of the serialised keys, `None` when empty
    common_serialised_prefix: Option<Vec<u8>>,
    /// Common prefix of the search keys, `None` when empty
    search_prefix: Option<Vec<u8>>,
    key: Option<ChkKey>,
    search_key: SearchKeyFunc,
}

impl LeafNode {
    /// Create an empty leaf
    pub fn new(maximum_size: usize, key_width: usize, search_key: SearchKeyFunc) -> Self {
        LeafNode {
            items: BTreeMap::new(),
            maximum_size,
            key_width,
            raw_size: 0,
            common_serialised_prefix: None,
            search_prefix: None,
            key: None,
            search_key,
        }
    }

    /// Build a leaf holding all of `items` at once, without splitting
    pub(crate) fn from_items(
        items: BTreeMap<Key, Vec<u8>>,
        maximum_size: usize,
        key_width: usize,
        search_key: SearchKeyFunc,
    ) -> Self {
        let mut leaf = LeafNode::new(maximum_size, key_width, search_key);
        leaf.raw_size = items.iter().map(|(k, v)| key_value_len(k, v)).sum();
        leaf.items = items;
        leaf.recompute_prefixes();
        leaf
    }

    pub fn key(&self) -> Option<ChkKey> {
        self.key
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn items(&self) -> &BTreeMap<Key, Vec<u8>> {
        &self.items
    }

    pub fn get(&self, key: &Key) -> Option<&[u8]> {
        self.items.get(key).map(Vec::as_slice)
    }

    pub fn search_prefix(&self) -> Option<&[u8]> {
        self.search_prefix.as_deref()
    }

    pub fn search_key_func(&self) -> SearchKeyFunc {
        self.search_key
    }

    pub fn common_serialised_prefix(&self) -> Option<&[u8]> {
        self.common_serialised_prefix.as_deref()
    }

    pub(crate) fn set_maximum_size(&mut self, maximum_size: usize) {
        self.maximum_size = maximum_size;
    }

    /// Exact size of the serialized page
    pub fn current_size(&self) -> usize {
        let (prefix_len, bytes_for_items) = match &self.common_serialised_prefix {
            Some(prefix) => (
                prefix.len(),
                self.raw_size - prefix.len() * self.items.len(),
            ),
            None => (0, 0),
        };
        LEAF_MAGIC.len()
            + 1
            + decimal_len(self.maximum_size)
            + 1
            + decimal_len(self.key_width)
            + 1
            + decimal_len(self.items.len())
            + 1
            + prefix_len
            + 1
            + bytes_for_items
    }

    /// Insert without splitting, keeping sizes and prefixes current.
    ///
    /// `key` must not be present. Returns true if the leaf is now over its
    /// size limit and can be split.
    pub(crate) fn map_no_split(&mut self, key: Key, value: Vec<u8>) -> bool {
        self.raw_size += key_value_len(&key, &value);
        let serialised = key.serialise();
        let search_key = self.search_key.search_key(&key);
        self.items.insert(key, value);

        self.common_serialised_prefix = Some(match self.common_serialised_prefix.take() {
            Some(prefix) => common_prefix(&prefix, &serialised).to_vec(),
            None => serialised,
        });
        let search_prefix = match self.search_prefix.take() {
            Some(prefix) => common_prefix(&prefix, &search_key).to_vec(),
            None => search_key.clone(),
        };
        let needs_split = self.items.len() > 1
            && self.maximum_size > 0
            && self.current_size() > self.maximum_size
            // Colliding search keys cannot be separated, so the leaf grows
            && (search_key != search_prefix || !self.are_search_keys_identical());
        self.search_prefix = Some(search_prefix);
        needs_split
    }

    /// Map `key` to `value`, returning the replacement pages on overflow
    pub(crate) fn map(
        &mut self,
        pager: &Pager<'_>,
        key: Key,
        value: Vec<u8>,
    ) -> Result<Option<Split>> {
        if let Some(old) = self.items.remove(&key) {
            self.raw_size -= key_value_len(&key, &old);
        }
        self.key = None;
        if self.map_no_split(key, value) {
            self.split(pager)
        } else {
            Ok(None)
        }
    }

    /// Distribute the items over new pages, one per value of the search key
    /// byte following the common search prefix.
    ///
    /// Returns `None` when every item would land in the same page.
    pub(crate) fn split(&self, pager: &Pager<'_>) -> Result<Option<Split>> {
        let common = self.search_prefix.clone().unwrap_or_default();
        let split_at = common.len() + 1;

        let mut buckets: BTreeMap<Vec<u8>, Vec<(&Key, &Vec<u8>)>> = BTreeMap::new();
        for (key, value) in &self.items {
            let mut prefix = self.search_key.search_key(key);
            // Short search keys are padded with NULs
            prefix.resize(split_at, 0);
            buckets.entry(prefix).or_default().push((key, value));
        }
        if buckets.len() < 2 {
            return Ok(None);
        }

        debug!(
            items = self.items.len(),
            pages = buckets.len(),
            prefix = %common.escape_ascii(),
            "splitting leaf"
        );
        let mut children = Vec::with_capacity(buckets.len());
        for (prefix, entries) in buckets {
            let mut node = Node::Leaf(LeafNode::new(
                self.maximum_size,
                self.key_width,
                self.search_key,
            ));
            for (key, value) in entries {
                if let Some(split) = node.map(pager, key.clone(), value.clone())? {
                    node = Node::Internal(InternalNode::from_split(split)?);
                }
            }
            children.push((prefix, node));
        }
        Ok(Some(Split {
            prefix: common,
            children,
        }))
    }

    /// Remove `key`, failing without changes if it is not present
    pub(crate) fn unmap(&mut self, key: &Key) -> Result<()> {
        let old = self
            .items
            .remove(key)
            .ok_or_else(|| Error::KeyNotFound(key.clone()))?;
        self.raw_size -= key_value_len(key, &old);
        self.key = None;
        self.recompute_prefixes();
        Ok(())
    }

    /// Items matching `filter`, in key order.
    ///
    /// Filter keys as wide as the map's keys match exactly; shorter ones
    /// match every key that starts with their elements.
    pub(crate) fn matching_items(&self, filter: Option<&[Key]>) -> Vec<(Key, Vec<u8>)> {
        let Some(filter) = filter else {
            return self
                .items
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        };

        let mut matched: BTreeSet<&Key> = BTreeSet::new();
        let mut prefixes: Vec<&Key> = Vec::new();
        for wanted in filter {
            if wanted.len() == self.key_width {
                if let Some((key, _)) = self.items.get_key_value(wanted) {
                    matched.insert(key);
                }
            } else {
                prefixes.push(wanted);
            }
        }
        if !prefixes.is_empty() {
            for key in self.items.keys() {
                if prefixes
                    .iter()
                    .any(|p| key.prefix(p.len()) == p.elements())
                {
                    matched.insert(key);
                }
            }
        }
        matched
            .into_iter()
            .filter_map(|key| self.items.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Serialize the page
    pub fn serialise(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.current_size());
        out.extend_from_slice(LEAF_MAGIC);
        out.push(b'\n');
        out.extend_from_slice(
            format!(
                "{}\n{}\n{}\n",
                self.maximum_size,
                self.key_width,
                self.items.len()
            )
            .as_bytes(),
        );
        let prefix = self.common_serialised_prefix.as_deref().unwrap_or_default();
        out.extend_from_slice(prefix);
        out.push(b'\n');

        for (key, value) in &self.items {
            let mut line = key.serialise();
            line.push(0);
            line.extend_from_slice(value_line_count(value).to_string().as_bytes());
            line.push(b'\n');
            if !line.starts_with(prefix) {
                return Err(Error::Invariant(format!(
                    "item {} does not start with the common prefix {:?}",
                    key,
                    prefix.escape_ascii().to_string()
                )));
            }
            out.extend_from_slice(&line[prefix.len()..]);
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        Ok(out)
    }

    pub(crate) fn save(&mut self, pager: &Pager<'_>) -> Result<ChkKey> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        let bytes = self.serialise()?;
        if bytes.len() != self.current_size() {
            return Err(Error::Invariant(format!(
                "leaf serialized to {} bytes, expected {}",
                bytes.len(),
                self.current_size()
            )));
        }
        let key = pager.write(bytes)?;
        self.key = Some(key);
        Ok(key)
    }

    /// Parse a serialized leaf page
    pub fn deserialise(bytes: &[u8], key: ChkKey, search_key: SearchKeyFunc) -> Result<Self> {
        let mut lines = split_lines(bytes, &key)?.into_iter();
        if lines.next() != Some(LEAF_MAGIC) {
            return Err(Error::Format(format!("{} is not a leaf node", key)));
        }
        let maximum_size = parse_count(lines.next(), "maximum size", &key)?;
        let key_width = parse_count(lines.next(), "key width", &key)?;
        let length = parse_count(lines.next(), "item count", &key)?;
        let prefix = lines
            .next()
            .ok_or_else(|| Error::Format(format!("{} is missing its prefix", key)))?;

        let mut items = BTreeMap::new();
        while let Some(line) = lines.next() {
            let full = [prefix, line].concat();
            let mut elements: Vec<&[u8]> = full.split(|b| *b == 0).collect();
            if elements.len() != key_width + 1 {
                return Err(Error::Format(format!(
                    "{} has an item with {} elements, expected {}",
                    key,
                    elements.len(),
                    key_width + 1
                )));
            }
            let line_count = parse_count(elements.pop(), "value line count", &key)?;
            if line_count == 0 {
                return Err(Error::Format(format!("{} has an empty value", key)));
            }
            let mut value_lines = Vec::with_capacity(line_count);
            for _ in 0..line_count {
                value_lines.push(
                    lines
                        .next()
                        .ok_or_else(|| Error::Format(format!("{} is truncated", key)))?,
                );
            }
            let item_key = Key::new(elements.into_iter().map(<[u8]>::to_vec).collect());
            if items.insert(item_key, value_lines.join(&b'\n')).is_some() {
                return Err(Error::Format(format!("{} repeats a key", key)));
            }
        }
        if items.len() != length {
            return Err(Error::Format(format!(
                "{} declares {} items but holds {}",
                key,
                length,
                items.len()
            )));
        }

        let mut leaf = LeafNode::from_items(items, maximum_size, key_width, search_key);
        if !leaf.is_empty() {
            leaf.common_serialised_prefix = Some(prefix.to_vec());
        }
        if bytes.len() != leaf.current_size() {
            return Err(Error::Format(format!(
                "{} is {} bytes, expected {}",
                key,
                bytes.len(),
                leaf.current_size()
            )));
        }
        leaf.key = Some(key);
        Ok(leaf)
    }

    fn recompute_prefixes(&mut self) {
        self.common_serialised_prefix = common_prefix_many(self.items.keys().map(Key::serialise));
        self.search_prefix =
            common_prefix_many(self.items.keys().map(|k| self.search_key.search_key(k)));
    }

    fn are_search_keys_identical(&self) -> bool {
        let mut keys = self.items.keys().map(|k| self.search_key.search_key(k));
        match keys.next() {
            Some(first) => keys.all(|k| k == first),
            None => true,
        }
    }
}

/// Lines a value occupies once a newline is appended
fn value_line_count(value: &[u8]) -> usize {
    value.iter().filter(|b| **b == b'\n').count() + 1
}

/// Bytes an item adds before prefix compression
fn key_value_len(key: &Key, value: &[u8]) -> usize {
    key.serialise().len() + 1 + decimal_len(value_line_count(value)) + 1 + value.len() + 1
}
