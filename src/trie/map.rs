//! The persistent map

use super::cache::PageCache;
use super::changes::ChangeIter;
use super::internal::InternalNode;
use super::iter::ItemIter;
use super::leaf::LeafNode;
use super::node::{Child, Node};
use super::pager::Pager;
use super::search_key::SearchKeyFunc;
use crate::config::MapConfig;
use crate::model::{ChkKey, Key};
use crate::store::ChkStore;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::slice;
use std::sync::Arc;
use tracing::debug;

/// One change in a batched update
///
/// With `old_key` set, the old mapping is removed (unless it is the same
/// key as `new_key`). With `new_key` set, `new_key` is mapped to `value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaEntry {
    pub old_key: Option<Key>,
    pub new_key: Option<Key>,
    pub value: Option<Vec<u8>>,
}

impl DeltaEntry {
    pub fn new(old_key: Option<Key>, new_key: Option<Key>, value: Option<Vec<u8>>) -> Self {
        DeltaEntry {
            old_key,
            new_key,
            value,
        }
    }

    /// Add a key that must not exist yet
    pub fn insert(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        DeltaEntry::new(None, Some(key.into()), Some(value.into()))
    }

    /// Remove a key that must exist
    pub fn delete(key: impl Into<Key>) -> Self {
        DeltaEntry::new(Some(key.into()), None, None)
    }

    /// Replace the value of an existing key
    pub fn update(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        DeltaEntry::new(Some(key.clone()), Some(key), Some(value.into()))
    }
}

/// A persistent map from fixed-width key tuples to byte strings, stored as
/// a trie of content-addressed pages
///
/// Changes stay in memory until [`save`](ChkMap::save) writes the modified
/// pages. Unchanged subtrees keep their keys and are never rewritten, so two
/// versions of a map share every page they have in common.
pub struct ChkMap<'s> {
    store: &'s dyn ChkStore,
    cache: Arc<PageCache>,
    root: Child,
    search_key: SearchKeyFunc,
}

impl<'s> ChkMap<'s> {
    /// Open the map rooted at `root_key`, or a new empty map for `None`.
    ///
    /// A stored root is not read until it is needed. `key_width` only
    /// applies to new maps; a stored root records its own.
    pub fn new(
        store: &'s dyn ChkStore,
        root_key: Option<ChkKey>,
        search_key: SearchKeyFunc,
        key_width: usize,
    ) -> Self {
        let root = match root_key {
            Some(key) => Child::Stored(key),
            None => Node::Leaf(LeafNode::new(0, key_width, search_key)).into(),
        };
        ChkMap {
            store,
            cache: Arc::new(PageCache::default()),
            root,
            search_key,
        }
    }

    /// Open a map with the parameters from `config`
    pub fn with_config(store: &'s dyn ChkStore, root_key: Option<ChkKey>, config: &MapConfig) -> Self {
        let mut map = ChkMap::new(store, root_key, config.search_key, config.key_width)
            .with_cache(Arc::new(PageCache::new(config.page_cache_bytes)));
        if let Child::Loaded(node) = &mut map.root {
            node.set_maximum_size(config.maximum_size);
        }
        map
    }

    /// Share a page cache with other maps
    pub fn with_cache(mut self, cache: Arc<PageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn search_key_func(&self) -> SearchKeyFunc {
        self.search_key
    }

    /// Create and save a map holding `items` in one pass, returning its
    /// root key
    pub fn from_dict<I>(
        store: &'s dyn ChkStore,
        items: I,
        maximum_size: usize,
        key_width: usize,
        search_key: SearchKeyFunc,
    ) -> Result<ChkKey>
    where
        I: IntoIterator<Item = (Key, Vec<u8>)>,
    {
        let cache = PageCache::default();
        let pager = Pager::new(store, &cache, search_key);
        let items: BTreeMap<Key, Vec<u8>> = items.into_iter().collect();
        for key in items.keys() {
            validate_key(key, key_width)?;
        }

        let leaf = LeafNode::from_items(items, maximum_size, key_width, search_key);
        let mut root = if leaf.len() > 1 && maximum_size > 0 && leaf.current_size() > maximum_size
        {
            match leaf.split(&pager)? {
                Some(split) => Node::Internal(InternalNode::from_split(split)?),
                None => Node::Leaf(leaf),
            }
        } else {
            Node::Leaf(leaf)
        };
        let key = root.save(&pager)?;
        debug!(key = %key, items = root.len(), "created map");
        Ok(key)
    }

    fn pager(&self) -> Pager<'_> {
        Pager::new(self.store, &self.cache, self.search_key)
    }

    /// The pager and the root slot, borrowed together
    fn parts(&mut self) -> (Pager<'_>, &mut Child) {
        let ChkMap {
            store,
            cache,
            root,
            search_key,
        } = self;
        (Pager::new(*store, &**cache, *search_key), root)
    }

    /// Key of the root page, `None` if the map has unsaved changes
    pub fn key(&self) -> Option<ChkKey> {
        self.root.key()
    }

    /// Number of items in the map
    pub fn len(&self) -> Result<usize> {
        match &self.root {
            Child::Loaded(node) => Ok(node.len()),
            Child::Stored(key) => Ok(self.pager().load(key)?.len()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Set the page size limit of the root. Pages created later inherit it
    /// from their parent.
    pub fn set_maximum_size(&mut self, maximum_size: usize) -> Result<()> {
        let (pager, root) = self.parts();
        root.node_mut(&pager)?.set_maximum_size(maximum_size);
        Ok(())
    }

    /// Map `key` to `value`, replacing any previous value
    pub fn map(&mut self, key: Key, value: impl Into<Vec<u8>>) -> Result<()> {
        let (pager, root) = self.parts();
        let node = root.node_mut(&pager)?;
        validate_key(&key, node.key_width())?;
        if let Some(split) = node.map(&pager, key, value.into())? {
            *node = Node::Internal(InternalNode::from_split(split)?);
        }
        Ok(())
    }

    /// Remove `key`. Fails with [`Error::KeyNotFound`] if it is absent, in
    /// which case the map is unchanged.
    pub fn unmap(&mut self, key: &Key) -> Result<()> {
        self.unmap_with(key, true)
    }

    fn unmap_with(&mut self, key: &Key, check_remap: bool) -> Result<()> {
        let (pager, root) = self.parts();
        root.node_mut(&pager)?.unmap(&pager, key, check_remap)
    }

    /// Collapse the root into a leaf if everything fits in one
    fn check_remap(&mut self) -> Result<()> {
        let (pager, root) = self.parts();
        let node = root.node_mut(&pager)?;
        let replacement = match node {
            Node::Internal(internal) => internal.check_remap(&pager)?,
            Node::Leaf(_) => None,
        };
        if let Some(leaf) = replacement {
            *node = Node::Leaf(leaf);
        }
        Ok(())
    }

    /// Write every modified page and return the root key
    pub fn save(&mut self) -> Result<ChkKey> {
        let (pager, root) = self.parts();
        match root {
            Child::Stored(key) => Ok(*key),
            Child::Loaded(node) => {
                let key = node.save(&pager)?;
                debug!(key = %key, items = node.len(), "saved map");
                Ok(key)
            }
        }
    }

    /// Apply a batch of changes and save.
    ///
    /// Inserting a key that exists, removing a key that does not, or giving
    /// a new key without a value is an [`Error::InconsistentDelta`]. On any
    /// error the map is left as it was before the call.
    pub fn apply_delta(&mut self, delta: &[DeltaEntry]) -> Result<ChkKey> {
        let snapshot = self.root.clone();
        match self.apply_delta_unchecked(delta) {
            Ok(key) => Ok(key),
            Err(e) => {
                self.root = snapshot;
                Err(e)
            }
        }
    }

    fn apply_delta_unchecked(&mut self, delta: &[DeltaEntry]) -> Result<ChkKey> {
        let key_width = {
            let (pager, root) = self.parts();
            root.node_mut(&pager)?.key_width()
        };

        let mut new_keys = Vec::new();
        for entry in delta {
            if let Some(key) = &entry.new_key {
                validate_key(key, key_width)?;
                if entry.value.is_none() {
                    return Err(Error::InconsistentDelta(format!(
                        "new key {} has no value",
                        key
                    )));
                }
                if entry.old_key.is_none() {
                    new_keys.push(key.clone());
                }
            }
        }
        if !new_keys.is_empty() {
            let existing = self
                .iteritems(Some(&new_keys))
                .map(|item| item.map(|(key, _)| key.to_string()))
                .collect::<Result<Vec<_>>>()?;
            if !existing.is_empty() {
                return Err(Error::InconsistentDelta(format!(
                    "new items are already in the map: {}",
                    existing.join(", ")
                )));
            }
        }

        let mut has_deletes = false;
        for entry in delta {
            if let Some(old) = &entry.old_key {
                if entry.new_key.as_ref() != Some(old) {
                    self.unmap_with(old, false).map_err(|e| match e {
                        Error::KeyNotFound(key) => {
                            Error::InconsistentDelta(format!("{} is not in the map", key))
                        }
                        other => other,
                    })?;
                    has_deletes = true;
                }
            }
        }
        for entry in delta {
            if let (Some(key), Some(value)) = (&entry.new_key, &entry.value) {
                self.map(key.clone(), value.clone())?;
            }
        }
        if has_deletes {
            self.check_remap()?;
        }
        self.save()
    }

    /// Iterate over the items, in key order within each page.
    ///
    /// With a filter, only pages that may hold a matching key are read.
    /// Filter keys shorter than the map's keys match every key they are a
    /// prefix of.
    pub fn iteritems(&self, filter: Option<&[Key]>) -> ItemIter<'_> {
        ItemIter::new(self.pager(), &self.root, filter.map(<[Key]>::to_vec))
    }

    /// The value mapped to `key`
    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.iteritems(Some(slice::from_ref(key)))
            .find(|item| item.as_ref().map_or(true, |(found, _)| found == key))
            .transpose()
            .map(|item| item.map(|(_, value)| value))
    }

    /// Iterate over `(key, old value, new value)` for every key that differs
    /// between `basis` (old) and this map (new). Subtrees the two maps share
    /// are skipped without being read.
    pub fn iter_changes<'m>(&'m self, basis: &'m ChkMap<'_>) -> ChangeIter<'m> {
        ChangeIter::new(
            (self.pager(), &self.root),
            (basis.pager(), &basis.root),
        )
    }

    /// Render the tree, one page per line, with items under their leaves
    pub fn dump_tree(&self, include_keys: bool) -> Result<String> {
        let pager = self.pager();
        let mut lines = Vec::new();
        match &self.root {
            Child::Loaded(node) => dump_node(&pager, node, b"", "", include_keys, &mut lines)?,
            Child::Stored(key) => {
                let node = pager.load(key)?;
                dump_node(&pager, &node, b"", "", include_keys, &mut lines)?;
            }
        }
        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}

/// Keys must match the map's width and be representable in leaf pages
pub(crate) fn validate_key(key: &Key, key_width: usize) -> Result<()> {
    if key.len() != key_width {
        return Err(Error::InvalidKey(format!(
            "{} has {} elements, expected {}",
            key,
            key.len(),
            key_width
        )));
    }
    if key
        .elements()
        .iter()
        .any(|e| e.contains(&b'\n') || e.contains(&0))
    {
        return Err(Error::InvalidKey(format!(
            "{} contains a newline or NUL byte",
            key
        )));
    }
    Ok(())
}

fn dump_node(
    pager: &Pager<'_>,
    node: &Node,
    prefix: &[u8],
    indent: &str,
    include_keys: bool,
    out: &mut Vec<String>,
) -> Result<()> {
    let key = match (include_keys, node.key()) {
        (false, _) => String::new(),
        (true, Some(key)) => format!(" {}", key),
        (true, None) => " None".to_string(),
    };
    out.push(format!(
        "{}'{}' {}{}",
        indent,
        prefix.escape_ascii(),
        node.kind(),
        key
    ));

    match node {
        Node::Leaf(leaf) => {
            for (key, value) in leaf.items() {
                out.push(format!("      {} '{}'", key, value.escape_ascii()));
            }
        }
        Node::Internal(internal) => {
            let stored: Vec<ChkKey> = internal
                .children()
                .values()
                .filter_map(|child| match child {
                    Child::Stored(key) => Some(*key),
                    Child::Loaded(_) => None,
                })
                .collect();
            let mut loaded = pager.load_many(&stored)?.into_iter();
            let indent = format!("{}  ", indent);
            for (prefix, child) in internal.children() {
                match child {
                    Child::Loaded(node) => {
                        dump_node(pager, node, prefix, &indent, include_keys, out)?
                    }
                    Child::Stored(key) => {
                        let node = loaded.next().ok_or(Error::Absent(*key))?;
                        dump_node(pager, &node, prefix, &indent, include_keys, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}
