//! Content-addressed trie of key/value pages
//!
//! This implements a persistent map where:
//! - Each page is stored under the SHA-1 of its serialized bytes
//! - An internal page refers to its children by their content keys
//! - Unchanged subtrees share storage across versions of a map
//! - The root key uniquely identifies the whole contents

mod cache;
mod changes;
mod internal;
mod iter;
mod leaf;
mod map;
mod node;
mod pager;
mod search_key;

pub use cache::{PageCache, DEFAULT_PAGE_CACHE_BYTES};
pub use changes::{Change, ChangeIter};
pub use internal::InternalNode;
pub use iter::ItemIter;
pub use leaf::LeafNode;
pub use map::{ChkMap, DeltaEntry};
pub use node::{Child, Node};
pub use search_key::SearchKeyFunc;
