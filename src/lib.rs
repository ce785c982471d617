//! # chkmap
//!
//! A persistent, content-addressed trie mapping fixed-width key tuples to
//! byte strings.
//!
//! Every page of a map is stored under the SHA-1 of its bytes, so two
//! versions of a map share every page they have in common and comparing
//! them only touches the pages that differ.
//!
//! ## Core Concepts
//!
//! - **Pages**: leaf pages hold items, internal pages route by search key
//! - **Search keys**: plain or hashed routing encodings of a key
//! - **Canonical form**: a given set of items always yields the same root key
//! - **Stores**: immutable content-addressed records behind [`ChkStore`]
//!
//! ## Example
//!
//! ```ignore
//! use chkmap::{ChkMap, Key, MemoryStore, SearchKeyFunc};
//!
//! let store = MemoryStore::new();
//! let mut map = ChkMap::new(&store, None, SearchKeyFunc::Plain, 1);
//! map.map(Key::from("readme"), "file-id-1")?;
//! let root = map.save()?;
//! ```

pub mod config;
pub mod logging;
pub mod model;
pub mod ops;
pub mod store;
pub mod trie;

mod error;

pub use config::MapConfig;
pub use error::{Error, Result};
pub use model::{ChkKey, Key};
pub use ops::{diff_maps, iter_interesting_nodes, Diff, DiffEntry, InterestingNodes};
pub use store::{ChkStore, FileStore, MemoryStore, Record, RecordOrdering};
pub use trie::{ChkMap, DeltaEntry, PageCache, SearchKeyFunc};

/// Store file format version
pub const VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"CHKSTORE";
