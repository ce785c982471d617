//! Internal pages: routing by search key prefix
//!
//! Serialized layout:
//!
//! ```text
//! chknode:\n
//! <maximum_size>\n<key_width>\n<subtree item count>\n<search_prefix>\n
//! <child prefix minus search prefix>\x00sha1:<hex>\n
//! ```
//!
//! Every child prefix is one byte longer than the node's search prefix.
//! A key is routed by its search key, truncated or NUL-padded to that width.

use super::leaf::LeafNode;
use super::node::{
    common_prefix, parse_count, split_lines, Child, Node, Split, INTERNAL_MAGIC,
};
use super::pager::Pager;
use super::search_key::{prefix_search_key, SearchKeyFunc};
use crate::model::{ChkKey, Key};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use tracing::debug;

/// Children read per store request while checking for a collapse
const REMAP_BATCH_SIZE: usize = 16;

/// A shrunken leaf below this size triggers a collapse check
const INTERESTING_NEW_SIZE: usize = 50;

/// Shrinking a leaf by more than this triggers a collapse check
const INTERESTING_SHRINKAGE_LIMIT: usize = 20;

/// A page routing search key prefixes to child pages
#[derive(Clone, Debug)]
pub struct InternalNode {
    items: BTreeMap<Vec<u8>, Child>,
    /// Length of every child prefix
    node_width: usize,
    search_prefix: Vec<u8>,
    /// Items in the whole subtree
    len: usize,
    maximum_size: usize,
    key_width: usize,
    key: Option<ChkKey>,
    search_key: SearchKeyFunc,
}

impl InternalNode {
    /// Create an internal node with no children
    pub fn new(
        search_prefix: Vec<u8>,
        maximum_size: usize,
        key_width: usize,
        search_key: SearchKeyFunc,
    ) -> Self {
        InternalNode {
            items: BTreeMap::new(),
            node_width: search_prefix.len() + 1,
            search_prefix,
            len: 0,
            maximum_size,
            key_width,
            key: None,
            search_key,
        }
    }

    /// Build the node that replaces an overflowing leaf
    pub(crate) fn from_split(split: Split) -> Result<Self> {
        let (maximum_size, key_width, search_key) = match split.children.first() {
            Some((_, Node::Leaf(leaf))) => {
                (leaf.maximum_size(), leaf.key_width(), leaf.search_key_func())
            }
            Some((_, Node::Internal(node))) => (node.maximum_size, node.key_width, node.search_key),
            None => return Err(Error::Invariant("split produced no pages".into())),
        };
        let mut node = InternalNode::new(split.prefix, maximum_size, key_width, search_key);
        for (prefix, child) in split.children {
            node.add_node(prefix, child)?;
        }
        Ok(node)
    }

    pub fn key(&self) -> Option<ChkKey> {
        self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn maximum_size(&self) -> usize {
        self.maximum_size
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn node_width(&self) -> usize {
        self.node_width
    }

    pub fn search_prefix(&self) -> &[u8] {
        &self.search_prefix
    }

    pub fn search_key_func(&self) -> SearchKeyFunc {
        self.search_key
    }

    /// Child slots by prefix
    pub fn children(&self) -> &BTreeMap<Vec<u8>, Child> {
        &self.items
    }

    /// Content keys of the children; every child must be saved
    pub fn refs(&self) -> Result<Vec<(Vec<u8>, ChkKey)>> {
        self.items
            .iter()
            .map(|(prefix, child)| {
                child
                    .key()
                    .map(|key| (prefix.clone(), key))
                    .ok_or_else(|| Error::Invariant("unsaved nodes have no refs".into()))
            })
            .collect()
    }

    pub(crate) fn set_maximum_size(&mut self, maximum_size: usize) {
        self.maximum_size = maximum_size;
    }

    /// Attach a child page under `prefix`
    pub(crate) fn add_node(&mut self, prefix: Vec<u8>, node: Node) -> Result<()> {
        if !prefix.starts_with(&self.search_prefix) {
            return Err(Error::Invariant(format!(
                "prefix {:?} does not start with {:?}",
                prefix.escape_ascii().to_string(),
                self.search_prefix.escape_ascii().to_string()
            )));
        }
        if prefix.len() != self.node_width {
            return Err(Error::Invariant(format!(
                "prefix {:?} is not {} bytes wide",
                prefix.escape_ascii().to_string(),
                self.node_width
            )));
        }
        self.len += node.len();
        self.items.insert(prefix, node.into());
        self.key = None;
        Ok(())
    }

    /// The child prefix `search_key` routes to
    fn route(&self, search_key: &[u8]) -> Vec<u8> {
        let mut prefix = search_key.to_vec();
        prefix.resize(self.node_width, 0);
        prefix
    }

    fn new_leaf(&self) -> LeafNode {
        LeafNode::new(self.maximum_size, self.key_width, self.search_key)
    }

    /// Child slots that may hold keys matching `filter`, in prefix order
    pub(crate) fn select_children(&self, filter: Option<&[Key]>) -> Vec<&Child> {
        let Some(filter) = filter else {
            return self.items.values().collect();
        };
        let mut selected: BTreeSet<&Vec<u8>> = BTreeSet::new();
        for key in filter {
            let Some(mut prefix) = prefix_search_key(self.search_key, key, self.key_width) else {
                return self.items.values().collect();
            };
            prefix.truncate(self.node_width);
            if prefix.len() == self.node_width {
                if let Some((found, _)) = self.items.get_key_value(&prefix) {
                    selected.insert(found);
                }
            } else {
                selected.extend(self.items.keys().filter(|p| p.starts_with(&prefix)));
            }
        }
        selected
            .into_iter()
            .filter_map(|prefix| self.items.get(prefix))
            .collect()
    }

    /// Map `key` to `value` below this node.
    ///
    /// Returns a node that should replace this one, if any.
    pub(crate) fn map(
        &mut self,
        pager: &Pager<'_>,
        key: Key,
        value: Vec<u8>,
    ) -> Result<Option<Node>> {
        if self.items.is_empty() {
            return Err(Error::Invariant("cannot map into an empty internal node".into()));
        }
        let search_key = self.search_key.search_key(&key);
        if !search_key.starts_with(&self.search_prefix) {
            // The key falls outside this node: hang it below a new parent at
            // the point where the key diverges
            let new_prefix = common_prefix(&self.search_prefix, &search_key).to_vec();
            let slot = self.search_prefix[..new_prefix.len() + 1].to_vec();
            debug!(
                prefix = %new_prefix.escape_ascii(),
                "adding parent above internal node"
            );
            let parent = InternalNode::new(
                new_prefix,
                self.maximum_size,
                self.key_width,
                self.search_key,
            );
            let old = mem::replace(self, parent);
            self.add_node(slot, Node::Internal(old))?;
            return self.map(pager, key, value);
        }

        let slot = self.route(&search_key);
        if !self.items.contains_key(&slot) {
            let leaf = self.new_leaf();
            self.items.insert(slot.clone(), Node::Leaf(leaf).into());
        }
        let child = self.child_mut(pager, &slot)?;
        let old_len = child.len();
        let old_size = child.as_leaf().map(LeafNode::current_size);

        if let Some(split) = child.map(pager, key, value)? {
            // The child overflowed; it becomes an internal node
            let node = InternalNode::from_split(split)?;
            self.len = self.len - old_len + node.len();
            self.key = None;
            self.items.insert(slot, Node::Internal(node).into());
            return Ok(None);
        }

        let new_len = child.len();
        let check_remap = match (old_size, child.as_leaf()) {
            (None, Some(_)) => {
                debug!("checking remap as internal node collapsed to a leaf");
                true
            }
            (Some(old_size), Some(leaf)) => {
                let new_size = leaf.current_size();
                let interesting = (old_size > new_size && new_size < INTERESTING_NEW_SIZE)
                    || old_size > new_size + INTERESTING_SHRINKAGE_LIMIT;
                if interesting {
                    debug!(old_size, new_size, "checking remap as leaf shrank");
                }
                interesting
            }
            _ => false,
        };
        self.len = self.len - old_len + new_len;
        self.key = None;
        if check_remap {
            return Ok(self.check_remap(pager)?.map(Node::Leaf));
        }
        Ok(None)
    }

    /// Remove `key` from below this node.
    ///
    /// Returns a node that should replace this one, if any.
    pub(crate) fn unmap(
        &mut self,
        pager: &Pager<'_>,
        key: &Key,
        check_remap: bool,
    ) -> Result<Option<Node>> {
        if self.items.is_empty() {
            return Err(Error::Invariant("cannot unmap from an empty internal node".into()));
        }
        let slot = self.route(&self.search_key.search_key(key));
        if !self.items.contains_key(&slot) {
            return Err(Error::KeyNotFound(key.clone()));
        }
        let child = self.child_mut(pager, &slot)?;
        child.unmap(pager, key, true)?;
        let child_empty = child.is_empty();
        let child_internal = !child.is_leaf();

        self.len -= 1;
        self.key = None;
        if child_empty {
            self.items.remove(&slot);
        }

        if self.items.len() == 1 {
            // This node is no longer needed
            if let Some(prefix) = self.items.keys().next().cloned() {
                self.child_mut(pager, &prefix)?;
                if let Some(child) = self.items.remove(&prefix) {
                    return child.into_node(pager).map(Some);
                }
            }
        }
        if self.items.is_empty() {
            return Ok(Some(Node::Leaf(self.new_leaf())));
        }
        if child_internal && !child_empty {
            return Ok(None);
        }
        if check_remap {
            return Ok(self.check_remap(pager)?.map(Node::Leaf));
        }
        Ok(None)
    }

    /// Check whether every item below this node fits in a single leaf.
    ///
    /// Resident children are tried first, then cached pages, then the
    /// store in small batches, stopping as soon as the answer is no.
    pub(crate) fn check_remap(&mut self, pager: &Pager<'_>) -> Result<Option<LeafNode>> {
        let mut new_leaf = self.new_leaf();

        let mut stored = Vec::new();
        for (prefix, child) in &self.items {
            match child {
                Child::Loaded(node) => {
                    if !absorb(&mut new_leaf, node) {
                        return Ok(None);
                    }
                }
                Child::Stored(key) => stored.push((prefix.clone(), *key)),
            }
        }

        let mut missing = Vec::new();
        for (prefix, key) in stored {
            match pager.load_cached(&key)? {
                Some(node) => {
                    let fits = absorb(&mut new_leaf, &node);
                    self.items.insert(prefix, node.into());
                    if !fits {
                        return Ok(None);
                    }
                }
                None => missing.push((prefix, key)),
            }
        }

        for batch in missing.chunks(REMAP_BATCH_SIZE) {
            let keys: Vec<ChkKey> = batch.iter().map(|(_, key)| *key).collect();
            let nodes = pager.read_nodes(&keys)?;
            let mut fits = true;
            for ((prefix, _), node) in batch.iter().zip(nodes) {
                fits = fits && absorb(&mut new_leaf, &node);
                self.items.insert(prefix.clone(), node.into());
            }
            if !fits {
                return Ok(None);
            }
        }

        debug!(items = new_leaf.len(), "remap generated a new leaf");
        Ok(Some(new_leaf))
    }

    fn child_mut(&mut self, pager: &Pager<'_>, prefix: &[u8]) -> Result<&mut Node> {
        self.items
            .get_mut(prefix)
            .ok_or_else(|| {
                Error::Invariant(format!(
                    "no child at {:?}",
                    prefix.escape_ascii().to_string()
                ))
            })?
            .node_mut(pager)
    }

    /// Serialize the page; every child must already have a key
    pub fn serialise(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(INTERNAL_MAGIC);
        out.push(b'\n');
        out.extend_from_slice(
            format!("{}\n{}\n{}\n", self.maximum_size, self.key_width, self.len).as_bytes(),
        );
        out.extend_from_slice(&self.search_prefix);
        out.push(b'\n');

        for (prefix, child) in &self.items {
            let key = child.key().ok_or_else(|| {
                Error::Invariant(format!(
                    "child {:?} has not been saved",
                    prefix.escape_ascii().to_string()
                ))
            })?;
            let mut line = prefix.clone();
            line.push(0);
            line.extend_from_slice(key.to_string().as_bytes());
            line.push(b'\n');
            if !line.starts_with(&self.search_prefix) {
                return Err(Error::Invariant(format!(
                    "child {:?} does not start with the search prefix",
                    prefix.escape_ascii().to_string()
                )));
            }
            out.extend_from_slice(&line[self.search_prefix.len()..]);
        }
        Ok(out)
    }

    pub(crate) fn save(&mut self, pager: &Pager<'_>) -> Result<ChkKey> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        for child in self.items.values_mut() {
            if let Child::Loaded(node) = child {
                if node.key().is_none() {
                    node.save(pager)?;
                }
            }
        }
        let key = pager.write(self.serialise()?)?;
        self.key = Some(key);
        Ok(key)
    }

    /// Parse a serialized internal page. Children are left unread.
    pub fn deserialise(bytes: &[u8], key: ChkKey, search_key: SearchKeyFunc) -> Result<Self> {
        let mut lines = split_lines(bytes, &key)?.into_iter();
        if lines.next() != Some(INTERNAL_MAGIC) {
            return Err(Error::Format(format!("{} is not an internal node", key)));
        }
        let maximum_size = parse_count(lines.next(), "maximum size", &key)?;
        let key_width = parse_count(lines.next(), "key width", &key)?;
        let length = parse_count(lines.next(), "item count", &key)?;
        let search_prefix = lines
            .next()
            .ok_or_else(|| Error::Format(format!("{} is missing its prefix", key)))?
            .to_vec();

        let mut node = InternalNode::new(search_prefix, maximum_size, key_width, search_key);
        for line in lines {
            let full = [node.search_prefix.as_slice(), line].concat();
            let split = full
                .iter()
                .rposition(|b| *b == 0)
                .ok_or_else(|| Error::Format(format!("{} has a child without a key", key)))?;
            let (prefix, child_key) = (&full[..split], &full[split + 1..]);
            if prefix.len() != node.node_width {
                return Err(Error::Format(format!(
                    "{} has a child prefix of width {}, expected {}",
                    key,
                    prefix.len(),
                    node.node_width
                )));
            }
            let child_key = ChkKey::parse(child_key)
                .map_err(|e| Error::Format(format!("{} has a bad child key: {}", key, e)))?;
            if node
                .items
                .insert(prefix.to_vec(), Child::Stored(child_key))
                .is_some()
            {
                return Err(Error::Format(format!("{} repeats a child prefix", key)));
            }
        }
        if node.items.is_empty() {
            return Err(Error::Format(format!("{} has no children", key)));
        }
        if length < node.items.len() {
            return Err(Error::Format(format!(
                "{} declares {} items for {} children",
                key,
                length,
                node.items.len()
            )));
        }
        node.len = length;
        node.key = Some(key);
        Ok(node)
    }
}

/// Add every item of `node` to `leaf`. False if `node` is internal or the
/// leaf overflows, in which case the leaf is no longer usable.
fn absorb(leaf: &mut LeafNode, node: &Node) -> bool {
    match node {
        Node::Internal(_) => false,
        Node::Leaf(child) => child
            .items()
            .iter()
            .all(|(key, value)| !leaf.map_no_split(key.clone(), value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::trie::cache::PageCache;

    fn leaf_with(pager: &Pager<'_>, items: &[(&str, &str)]) -> Node {
        let mut node = Node::Leaf(LeafNode::new(0, 1, SearchKeyFunc::Plain));
        for (k, v) in items {
            node.map(pager, Key::from(*k), v.as_bytes().to_vec()).unwrap();
        }
        node
    }

    #[test]
    fn test_add_node_checks_prefix() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(b"a".to_vec(), 0, 1, SearchKeyFunc::Plain);
        let child = leaf_with(&pager, &[("ab", "1")]);

        assert!(matches!(
            node.add_node(b"bb".to_vec(), child.clone()),
            Err(Error::Invariant(_))
        ));
        assert!(matches!(
            node.add_node(b"abc".to_vec(), child.clone()),
            Err(Error::Invariant(_))
        ));
        node.add_node(b"ab".to_vec(), child).unwrap();
        assert_eq!(node.len(), 1);
        assert_eq!(node.node_width(), 2);
    }

    #[test]
    fn test_serialise_and_deserialise() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(b"k".to_vec(), 100, 1, SearchKeyFunc::Plain);
        node.add_node(b"ka".to_vec(), leaf_with(&pager, &[("ka", "1"), ("kab", "2")]))
            .unwrap();
        node.add_node(b"kb".to_vec(), leaf_with(&pager, &[("kb", "3")]))
            .unwrap();
        let key = node.save(&pager).unwrap();

        let bytes = store.get(&key).unwrap();
        assert!(bytes.starts_with(b"chknode:\n100\n1\n3\nk\na\x00sha1:"));

        let parsed = InternalNode::deserialise(&bytes, key, SearchKeyFunc::Plain).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.search_prefix(), b"k");
        assert_eq!(parsed.node_width(), 2);
        assert_eq!(parsed.refs().unwrap(), node.refs().unwrap());
        assert!(parsed.children().values().all(|c| !c.is_loaded()));
    }

    #[test]
    fn test_deserialise_rejects_bad_children() {
        let child = ChkKey::digest(b"child");
        let check = |bytes: Vec<u8>| {
            let key = ChkKey::digest(&bytes);
            InternalNode::deserialise(&bytes, key, SearchKeyFunc::Plain)
        };
        // no children
        assert!(matches!(check(b"chknode:\n0\n1\n0\n\n".to_vec()), Err(Error::Format(_))));
        // wrong prefix width
        let bytes = format!("chknode:\n0\n1\n2\n\nab\x00{}\n", child).into_bytes();
        assert!(matches!(check(bytes), Err(Error::Format(_))));
        // bad child key
        assert!(matches!(
            check(b"chknode:\n0\n1\n2\n\na\x00md5:00\n".to_vec()),
            Err(Error::Format(_))
        ));
        // fewer items than children
        let bytes = format!("chknode:\n0\n1\n1\n\na\x00{}\nb\x00{}\n", child, child).into_bytes();
        assert!(matches!(check(bytes), Err(Error::Format(_))));
    }

    #[test]
    fn test_select_children_by_filter() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(Vec::new(), 0, 1, SearchKeyFunc::Plain);
        node.add_node(b"a".to_vec(), leaf_with(&pager, &[("aa", "1")])).unwrap();
        node.add_node(b"b".to_vec(), leaf_with(&pager, &[("bb", "2")])).unwrap();

        assert_eq!(node.select_children(None).len(), 2);
        assert_eq!(node.select_children(Some(&[Key::from("bb")])).len(), 1);
        assert_eq!(node.select_children(Some(&[Key::from("cc")])).len(), 0);
        assert_eq!(
            node.select_children(Some(&[Key::from("aa"), Key::from("ab")])).len(),
            1
        );
    }

    #[test]
    fn test_unmap_missing_key_leaves_node_alone() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(Vec::new(), 0, 1, SearchKeyFunc::Plain);
        node.add_node(b"a".to_vec(), leaf_with(&pager, &[("aa", "1")])).unwrap();
        node.add_node(b"b".to_vec(), leaf_with(&pager, &[("bb", "2")])).unwrap();

        assert!(matches!(
            node.unmap(&pager, &Key::from("cc"), true),
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            node.unmap(&pager, &Key::from("ab"), true),
            Err(Error::KeyNotFound(_))
        ));
        assert_eq!(node.len(), 2);
    }

    #[test]
    fn test_unmap_collapses_to_sole_child() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(Vec::new(), 0, 1, SearchKeyFunc::Plain);
        node.add_node(b"a".to_vec(), leaf_with(&pager, &[("aa", "1")])).unwrap();
        node.add_node(b"b".to_vec(), leaf_with(&pager, &[("bb", "2")])).unwrap();

        let replacement = node
            .unmap(&pager, &Key::from("bb"), true)
            .unwrap()
            .expect("node should collapse");
        assert_eq!(replacement.len(), 1);
        assert!(replacement.is_leaf());
    }

    #[test]
    fn test_check_remap_reads_stored_children() {
        let store = MemoryStore::new();
        let cache = PageCache::default();
        let pager = Pager::new(&store, &cache, SearchKeyFunc::Plain);
        let mut node = InternalNode::new(Vec::new(), 0, 1, SearchKeyFunc::Plain);
        node.add_node(b"a".to_vec(), leaf_with(&pager, &[("aa", "1")])).unwrap();
        node.add_node(b"b".to_vec(), leaf_with(&pager, &[("bb", "2")])).unwrap();
        node.add_node(b"c".to_vec(), leaf_with(&pager, &[("cc", "3")])).unwrap();
        let key = node.save(&pager).unwrap();

        cache.clear();
        let mut stored = match pager.load(&key).unwrap() {
            Node::Internal(node) => node,
            Node::Leaf(_) => panic!("expected an internal node"),
        };
        store.reset_read_stats();
        let leaf = stored.check_remap(&pager).unwrap().expect("children fit");
        assert_eq!(leaf.len(), 3);
        assert_eq!(store.read_count(), 3);
        assert!(stored.children().values().all(Child::is_loaded));
    }
}
