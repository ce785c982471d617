//! In-memory store

use super::{ChkStore, Record, RecordOrdering};
use crate::model::ChkKey;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A store that keeps every record in a hash map
///
/// Counts the keys it has been asked to read, which makes it useful for
/// checking that the map does not page in more than it needs to.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<ChkKey, Bytes>>,
    reads: AtomicUsize,
    read_log: RwLock<Vec<ChkKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, key: &ChkKey) -> bool {
        self.records.read().contains_key(key)
    }

    /// Total number of keys requested through `get_record_stream`
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Every key requested through `get_record_stream`, in request order
    pub fn read_keys(&self) -> Vec<ChkKey> {
        self.read_log.read().clone()
    }

    pub fn reset_read_stats(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.read_log.write().clear();
    }

    /// Raw bytes for a key, bypassing the read counters
    pub fn get(&self, key: &ChkKey) -> Option<Bytes> {
        self.records.read().get(key).cloned()
    }
}

impl ChkStore for MemoryStore {
    fn get_record_stream(
        &self,
        keys: &[ChkKey],
        _ordering: RecordOrdering,
        include_missing: bool,
    ) -> Result<Vec<Record>> {
        self.reads.fetch_add(keys.len(), Ordering::Relaxed);
        self.read_log.write().extend_from_slice(keys);

        let records = self.records.read();
        keys.iter()
            .map(|key| match records.get(key) {
                Some(bytes) => Ok(Record::present(*key, bytes.clone())),
                None if include_missing => Ok(Record::absent(*key)),
                None => Err(Error::Absent(*key)),
            })
            .collect()
    }

    fn add_bytes(&self, bytes: &[u8]) -> Result<ChkKey> {
        let key = ChkKey::digest(bytes);
        self.records
            .write()
            .entry(key)
            .or_insert_with(|| Bytes::copy_from_slice(bytes));
        Ok(key)
    }
}
