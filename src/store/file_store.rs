//! Single-file store with content-addressed records
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("CHKSTORE")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - record_count: 8 bytes (u64 LE)
//!   - index_offset: 8 bytes (u64 LE)
//!   - refs_offset: 8 bytes (u64 LE)
//!   - refs_count: 8 bytes (u64 LE)
//!   - reserved: 16 bytes
//!
//! [RECORDS: variable]
//!   - zstd-compressed record bytes, concatenated
//!
//! [INDEX: variable]
//!   - sorted array of (sha1, offset, size) entries
//!
//! [REFS: variable]
//!   - ref names → root keys
//! ```
//!
//! Each sync appends a new index and refs block after the records written
//! so far and then points the header at it. Earlier blocks become dead
//! space between records.

use super::record::{compress, decompress_verified};
use super::{ChkStore, Record, RecordOrdering};
use crate::model::ChkKey;
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

const HEADER_SIZE: u64 = 64;
/// 20 (sha1) + 8 (offset) + 4 (size)
const INDEX_ENTRY_SIZE: usize = 32;

/// Index entry for a record
#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

/// A content-addressed record store backed by a single file
pub struct FileStore {
    /// Path to the store file
    path: std::path::PathBuf,
    /// The file handle
    file: RwLock<File>,
    /// In-memory index
    index: RwLock<HashMap<ChkKey, IndexEntry>>,
    /// Named roots
    refs: RwLock<BTreeMap<String, ChkKey>>,
    /// Current append position
    write_offset: RwLock<u64>,
    /// Records or refs changed since the last sync
    dirty: AtomicBool,
}

impl FileStore {
    /// Create a new store file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        debug!(path = %path.display(), "created store");

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(HashMap::new()),
            refs: RwLock::new(BTreeMap::new()),
            write_offset: RwLock::new(HEADER_SIZE),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open an existing store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }

        let version = read_u32(&header[8..12]);
        if version != VERSION {
            return Err(Error::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let record_count = read_u64(&header[16..24]);
        let index_offset = read_u64(&header[24..32]);
        let refs_offset = read_u64(&header[32..40]);
        let refs_count = read_u64(&header[40..48]);

        let mut index = HashMap::new();
        if index_offset > 0 && record_count > 0 {
            file.seek(SeekFrom::Start(index_offset))?;
            for _ in 0..record_count {
                let mut entry_buf = [0u8; INDEX_ENTRY_SIZE];
                file.read_exact(&mut entry_buf)?;

                let mut digest = [0u8; 20];
                digest.copy_from_slice(&entry_buf[0..20]);
                let offset = read_u64(&entry_buf[20..28]);
                let size = read_u32(&entry_buf[28..32]);

                index.insert(ChkKey::from_bytes(digest), IndexEntry { offset, size });
            }
        }

        let mut refs = BTreeMap::new();
        if refs_offset > 0 && refs_count > 0 {
            file.seek(SeekFrom::Start(refs_offset))?;
            for _ in 0..refs_count {
                let mut len_buf = [0u8; 2];
                file.read_exact(&mut len_buf)?;
                let name_len = u16::from_le_bytes(len_buf) as usize;

                let mut name_buf = vec![0u8; name_len];
                file.read_exact(&mut name_buf)?;
                let name = String::from_utf8(name_buf)
                    .map_err(|_| Error::InvalidFile("Ref name is not UTF-8".into()))?;

                let mut digest = [0u8; 20];
                file.read_exact(&mut digest)?;
                refs.insert(name, ChkKey::from_bytes(digest));
            }
        }

        // Index and refs are the last thing a sync writes. Anything past them
        // was appended after the last sync and is not indexed; new records go
        // after it so the synced index stays readable.
        let synced_end = if index_offset == 0 {
            HEADER_SIZE
        } else if refs_count > 0 {
            file.stream_position()?
        } else {
            refs_offset
        };
        let write_offset = file.seek(SeekFrom::End(0))?;
        if write_offset > synced_end {
            warn!(
                path = %path.display(),
                unindexed_bytes = write_offset - synced_end,
                "store has records written after the last sync; they are not indexed"
            );
        }

        debug!(
            path = %path.display(),
            records = index.len(),
            refs = refs.len(),
            "opened store"
        );

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(index),
            refs: RwLock::new(refs),
            write_offset: RwLock::new(write_offset),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open or create a store file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    fn read_record(&self, key: &ChkKey) -> Result<Option<bytes::Bytes>> {
        let entry = self.index.read().get(key).cloned();
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut data = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut data)?;
        }

        decompress_verified(*key, &data).map(Some)
    }

    /// Check if a record exists
    pub fn contains(&self, key: &ChkKey) -> bool {
        self.index.read().contains_key(key)
    }

    /// Get the number of records in the store
    pub fn record_count(&self) -> usize {
        self.index.read().len()
    }

    // === Ref Management ===

    /// Get the root key stored under a ref
    pub fn get_ref(&self, name: &str) -> Option<ChkKey> {
        self.refs.read().get(name).copied()
    }

    /// Point a ref at a root key
    pub fn set_ref(&self, name: &str, key: ChkKey) {
        self.refs.write().insert(name.to_string(), key);
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove a ref
    pub fn delete_ref(&self, name: &str) -> Result<ChkKey> {
        let key = self
            .refs
            .write()
            .remove(name)
            .ok_or_else(|| Error::RefNotFound(name.to_string()))?;
        self.dirty.store(true, Ordering::Release);
        Ok(key)
    }

    /// List all refs, sorted by name
    pub fn list_refs(&self) -> Vec<(String, ChkKey)> {
        self.refs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Flush changes and write index and refs to disk
    pub fn sync(&self) -> Result<()> {
        let mut next_offset = self.write_offset.write();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let write_offset = *next_offset;
        let index = self.index.read();
        let refs = self.refs.read();
        let mut file = self.file.write();

        let index_size = index.len() * INDEX_ENTRY_SIZE;
        let refs_offset = write_offset + index_size as u64;

        // Write index at write_offset, sorted for determinism
        file.seek(SeekFrom::Start(write_offset))?;
        let mut entries: Vec<_> = index.iter().collect();
        entries.sort_by_key(|(k, _)| k.as_bytes());
        for (key, entry) in entries {
            file.write_all(key.as_bytes())?;
            file.write_all(&entry.offset.to_le_bytes())?;
            file.write_all(&entry.size.to_le_bytes())?;
        }

        // Refs after the index: name_len (u16) + name + key (20 bytes)
        for (name, key) in refs.iter() {
            let name_bytes = name.as_bytes();
            file.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
            file.write_all(name_bytes)?;
            file.write_all(key.as_bytes())?;
        }
        let end = file.stream_position()?;
        file.set_len(end)?;

        // Header last
        file.seek(SeekFrom::Start(16))?;
        file.write_all(&(index.len() as u64).to_le_bytes())?;
        file.write_all(&write_offset.to_le_bytes())?;
        file.write_all(&refs_offset.to_le_bytes())?;
        file.write_all(&(refs.len() as u64).to_le_bytes())?;

        file.sync_all()?;
        // Later records go after this index; the next sync writes a new one
        *next_offset = end;
        debug!(records = index.len(), refs = refs.len(), "synced store");
        Ok(())
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChkStore for FileStore {
    fn get_record_stream(
        &self,
        keys: &[ChkKey],
        _ordering: RecordOrdering,
        include_missing: bool,
    ) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read_record(key)? {
                Some(bytes) => records.push(Record::present(*key, bytes)),
                None if include_missing => records.push(Record::absent(*key)),
                None => return Err(Error::Absent(*key)),
            }
        }
        Ok(records)
    }

    fn add_bytes(&self, bytes: &[u8]) -> Result<ChkKey> {
        let key = ChkKey::digest(bytes);

        if self.index.read().contains_key(&key) {
            return Ok(key);
        }

        let compressed = compress(bytes)?;
        let size = compressed.len() as u32;

        let offset = {
            let mut write_offset = self.write_offset.write();
            let offset = *write_offset;

            let mut file = self.file.write();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&compressed)?;

            *write_offset = offset + size as u64;
            offset
        };

        self.index.write().insert(key, IndexEntry { offset, size });
        self.dirty.store(true, Ordering::Release);
        Ok(key)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(arr)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(arr)
}
