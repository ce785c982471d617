//! Page reads and writes for a map
//!
//! Every read goes to the page cache first and falls back to the store.
//! Bytes read from the store, and bytes written to it, are cached.

use super::cache::PageCache;
use super::node::Node;
use super::search_key::SearchKeyFunc;
use crate::model::ChkKey;
use crate::store::{ChkStore, RecordOrdering};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Borrowed view of a map's store and page cache
#[derive(Clone, Copy)]
pub(crate) struct Pager<'a> {
    store: &'a dyn ChkStore,
    cache: &'a PageCache,
    search_key: SearchKeyFunc,
}

impl<'a> Pager<'a> {
    pub fn new(store: &'a dyn ChkStore, cache: &'a PageCache, search_key: SearchKeyFunc) -> Self {
        Pager {
            store,
            cache,
            search_key,
        }
    }

    pub fn search_key(&self) -> SearchKeyFunc {
        self.search_key
    }

    /// Bytes of one page
    pub fn read_bytes(&self, key: &ChkKey) -> Result<Bytes> {
        if let Some(bytes) = self.cache.get(key) {
            return Ok(bytes);
        }
        trace!(key = %key, "reading page from store");
        let records = self
            .store
            .get_record_stream(&[*key], RecordOrdering::Unordered, true)?;
        let bytes = records
            .into_iter()
            .find(|record| record.key == *key)
            .ok_or(Error::Absent(*key))?
            .into_fulltext()?;
        self.cache.insert(*key, bytes.clone());
        Ok(bytes)
    }

    /// Read and parse one page
    pub fn load(&self, key: &ChkKey) -> Result<Node> {
        let bytes = self.read_bytes(key)?;
        Node::deserialise(&bytes, *key, self.search_key)
    }

    /// Parse a page only if its bytes are already cached
    pub fn load_cached(&self, key: &ChkKey) -> Result<Option<Node>> {
        match self.cache.get(key) {
            Some(bytes) => Node::deserialise(&bytes, *key, self.search_key).map(Some),
            None => Ok(None),
        }
    }

    /// Read and parse pages straight from the store in a single request,
    /// returning them in the order asked for
    pub fn read_nodes(&self, keys: &[ChkKey]) -> Result<Vec<Node>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = keys.len(), "reading pages from store");
        let records = self
            .store
            .get_record_stream(keys, RecordOrdering::Unordered, true)?;
        let mut found: HashMap<ChkKey, Bytes> = HashMap::with_capacity(records.len());
        for record in records {
            let key = record.key;
            found.insert(key, record.into_fulltext()?);
        }

        keys.iter()
            .map(|key| {
                let bytes = found.get(key).ok_or(Error::Absent(*key))?;
                let node = Node::deserialise(bytes, *key, self.search_key)?;
                self.cache.insert(*key, bytes.clone());
                Ok(node)
            })
            .collect()
    }

    /// Parse several pages, using the cache where possible and reading the
    /// rest in one store request
    pub fn load_many(&self, keys: &[ChkKey]) -> Result<Vec<Node>> {
        let mut nodes: Vec<Option<Node>> = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            let node = self.load_cached(key)?;
            if node.is_none() {
                missing.push(*key);
            }
            nodes.push(node);
        }

        let mut read = self.read_nodes(&missing)?.into_iter();
        nodes
            .into_iter()
            .zip(keys)
            .map(|(node, key)| match node {
                Some(node) => Ok(node),
                None => read.next().ok_or(Error::Absent(*key)),
            })
            .collect()
    }

    /// Write a page and cache its bytes
    pub fn write(&self, bytes: Vec<u8>) -> Result<ChkKey> {
        let bytes = Bytes::from(bytes);
        let key = self.store.add_bytes(&bytes)?;
        trace!(key = %key, size = bytes.len(), "wrote page");
        self.cache.insert(key, bytes);
        Ok(key)
    }
}
