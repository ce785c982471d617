//! Search key functions
//!
//! A search key is the byte string used to route a key through the trie. It
//! is never stored in node bytes, so the function chosen for a map has to be
//! supplied again (by name) whenever a stored root is reopened.

use crate::model::Key;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Element hashed in place of a key with no non-empty elements
const SENTINEL_ELEMENT: &[u8] = b"\x00";

/// The registry of search key functions, selected by name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SearchKeyFunc {
    /// NUL-joined key elements; keeps lexicographic locality
    #[default]
    Plain,
    /// CRC32 per element as 8 uppercase hex digits (16-way fan-out)
    Hash16,
    /// CRC32 per element as 4 big-endian bytes (up to 255-way fan-out)
    Hash255,
}

impl SearchKeyFunc {
    pub const ALL: [SearchKeyFunc; 3] = [
        SearchKeyFunc::Plain,
        SearchKeyFunc::Hash16,
        SearchKeyFunc::Hash255,
    ];

    /// The registry name
    pub fn name(&self) -> &'static str {
        match self {
            SearchKeyFunc::Plain => "plain",
            SearchKeyFunc::Hash16 => "hash-16-way",
            SearchKeyFunc::Hash255 => "hash-255-way",
        }
    }

    /// Look a function up by its registry name
    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| Error::UnknownSearchKey(name.to_string()))
    }

    /// Compute the search key for `key`
    pub fn search_key(&self, key: &Key) -> Vec<u8> {
        match self {
            SearchKeyFunc::Plain => {
                if key.is_empty() {
                    SENTINEL_ELEMENT.to_vec()
                } else {
                    key.serialise()
                }
            }
            SearchKeyFunc::Hash16 => {
                let parts: Vec<Vec<u8>> = hashed_elements(key)
                    .map(|crc| format!("{:08X}", crc).into_bytes())
                    .collect();
                parts.join(&b'\x00')
            }
            SearchKeyFunc::Hash255 => {
                let parts: Vec<Vec<u8>> = hashed_elements(key)
                    .map(|crc| crc.to_be_bytes().to_vec())
                    .collect();
                let mut joined = parts.join(&b'\x00');
                // Internal nodes are line oriented
                for byte in joined.iter_mut() {
                    if *byte == b'\n' {
                        *byte = b'_';
                    }
                }
                joined
            }
        }
    }
}

/// Search key that every key starting with `filter`'s elements is routed
/// under, for a filter with fewer than `key_width` elements.
///
/// `None` when no such prefix exists: the sentinel stands in for a filter
/// with no hashed elements, but longer keys hash their later elements.
pub(crate) fn prefix_search_key(
    func: SearchKeyFunc,
    filter: &Key,
    key_width: usize,
) -> Option<Vec<u8>> {
    if filter.len() >= key_width {
        return Some(func.search_key(filter));
    }
    let unrouted = match func {
        SearchKeyFunc::Plain => filter.is_empty(),
        SearchKeyFunc::Hash16 | SearchKeyFunc::Hash255 => {
            filter.elements().iter().all(|e| e.is_empty())
        }
    };
    if unrouted {
        None
    } else {
        Some(func.search_key(filter))
    }
}

/// CRC32 of every non-empty element, or of the sentinel if there are none
fn hashed_elements(key: &Key) -> impl Iterator<Item = u32> + '_ {
    let mut elements: Vec<&[u8]> = key
        .elements()
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| e.as_slice())
        .collect();
    if elements.is_empty() {
        elements.push(SENTINEL_ELEMENT);
    }
    elements.into_iter().map(crc32fast::hash)
}

impl fmt::Display for SearchKeyFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SearchKeyFunc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

impl TryFrom<String> for SearchKeyFunc {
    type Error = Error;

    fn try_from(name: String) -> Result<Self> {
        Self::from_name(&name)
    }
}

impl From<SearchKeyFunc> for String {
    fn from(func: SearchKeyFunc) -> Self {
        func.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_search_key_of_empty_filter_is_unrouted() {
        let filter = Key::from("");
        for func in [SearchKeyFunc::Hash16, SearchKeyFunc::Hash255] {
            assert_eq!(prefix_search_key(func, &filter, 2), None);
            assert_eq!(prefix_search_key(func, &filter, 1), Some(func.search_key(&filter)));
        }
        assert_eq!(prefix_search_key(SearchKeyFunc::Plain, &filter, 2), Some(Vec::new()));
    }

    #[test]
    fn test_prefix_search_key_is_prefix_of_longer_keys() {
        for func in SearchKeyFunc::ALL {
            let prefix = prefix_search_key(func, &Key::from(["a", ""]), 3).unwrap();
            assert!(func.search_key(&Key::from(["a", "", "c"])).starts_with(&prefix));
            assert!(func.search_key(&Key::from(["a", "b", "c"])).starts_with(&prefix));
        }
    }

    #[test]
    fn test_plain_joins_elements() {
        let key = Key::from(["foo", "bar"]);
        assert_eq!(SearchKeyFunc::Plain.search_key(&key), b"foo\x00bar".to_vec());
    }

    #[test]
    fn test_hash_16_way_vectors() {
        let f = SearchKeyFunc::Hash16;
        assert_eq!(
            f.search_key(&Key::from(["a", "b"])),
            b"E8B7BE43\x0071BEEFF9".to_vec()
        );
        assert_eq!(
            f.search_key(&Key::from(["a", "a"])),
            b"E8B7BE43\x00E8B7BE43".to_vec()
        );
    }

    #[test]
    fn test_hash_255_way_packs_big_endian() {
        let f = SearchKeyFunc::Hash255;
        // crc32("a") == 0xE8B7BE43
        assert_eq!(f.search_key(&Key::from("a")), vec![0xE8, 0xB7, 0xBE, 0x43]);
        let sk = f.search_key(&Key::from(["a", "b"]));
        assert_eq!(sk.len(), 9);
        assert_eq!(sk[4], 0);
    }

    #[test]
    fn test_hash_255_way_never_contains_newline() {
        for i in 0..2000u32 {
            let key = Key::single(i.to_string().into_bytes());
            assert!(!SearchKeyFunc::Hash255.search_key(&key).contains(&b'\n'));
        }
    }

    #[test]
    fn test_empty_elements_are_filtered() {
        let f = SearchKeyFunc::Hash16;
        assert_eq!(
            f.search_key(&Key::from(["b", ""])),
            f.search_key(&Key::from("b"))
        );
        // all-empty keys hash the sentinel instead of failing
        let all_empty = f.search_key(&Key::from(["", ""]));
        assert_eq!(all_empty, format!("{:08X}", crc32fast::hash(b"\x00")).into_bytes());
    }

    #[test]
    fn test_registry_lookup() {
        for func in SearchKeyFunc::ALL {
            assert_eq!(SearchKeyFunc::from_name(func.name()).unwrap(), func);
        }
        assert!(matches!(
            SearchKeyFunc::from_name("hash-1024-way"),
            Err(Error::UnknownSearchKey(_))
        ));
    }

    #[test]
    fn test_serde_uses_registry_names() {
        let json = serde_json::to_string(&SearchKeyFunc::Hash255).unwrap();
        assert_eq!(json, "\"hash-255-way\"");
        let back: SearchKeyFunc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SearchKeyFunc::Hash255);
    }
}
