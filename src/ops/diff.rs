//! Diff operations between map versions

use crate::model::Key;
use crate::trie::ChkMap;
use crate::Result;

/// Type of change in a diff
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffEntry {
    /// Key was added
    Added { key: Key, new_value: Vec<u8> },
    /// Key was removed
    Removed { key: Key, old_value: Vec<u8> },
    /// Key was modified
    Modified {
        key: Key,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
}

impl DiffEntry {
    /// Build an entry from an `(old, new)` pair; `None` if nothing changed
    pub fn from_change(key: Key, old: Option<Vec<u8>>, new: Option<Vec<u8>>) -> Option<Self> {
        match (old, new) {
            (None, Some(new_value)) => Some(DiffEntry::Added { key, new_value }),
            (Some(old_value), None) => Some(DiffEntry::Removed { key, old_value }),
            (Some(old_value), Some(new_value)) if old_value != new_value => {
                Some(DiffEntry::Modified {
                    key,
                    old_value,
                    new_value,
                })
            }
            _ => None,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            DiffEntry::Added { key, .. } => key,
            DiffEntry::Removed { key, .. } => key,
            DiffEntry::Modified { key, .. } => key,
        }
    }

    pub fn old_value(&self) -> Option<&[u8]> {
        match self {
            DiffEntry::Added { .. } => None,
            DiffEntry::Removed { old_value, .. } => Some(old_value),
            DiffEntry::Modified { old_value, .. } => Some(old_value),
        }
    }

    pub fn new_value(&self) -> Option<&[u8]> {
        match self {
            DiffEntry::Added { new_value, .. } => Some(new_value),
            DiffEntry::Removed { .. } => None,
            DiffEntry::Modified { new_value, .. } => Some(new_value),
        }
    }
}

/// A diff between two map versions
#[derive(Clone, Debug, Default)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn new(entries: Vec<DiffEntry>) -> Self {
        Diff { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn added_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Added { .. }))
            .count()
    }

    pub fn removed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Removed { .. }))
            .count()
    }

    pub fn modified_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, DiffEntry::Modified { .. }))
            .count()
    }
}

/// Compute the diff from `basis` to `new`
pub fn diff_maps(new: &ChkMap<'_>, basis: &ChkMap<'_>) -> Result<Diff> {
    let mut entries = Vec::new();
    for change in new.iter_changes(basis) {
        let (key, old, new) = change?;
        entries.extend(DiffEntry::from_change(key, old, new));
    }

    // Sort entries for determinism
    entries.sort_by(|a, b| a.key().cmp(b.key()));

    Ok(Diff::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::trie::SearchKeyFunc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, FileStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.chk");
        let store = FileStore::create(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_diff_empty_to_non_empty() {
        let (_dir, store) = setup();

        let empty = ChkMap::new(&store, None, SearchKeyFunc::Plain, 1);
        let mut map = ChkMap::new(&store, None, SearchKeyFunc::Plain, 1);
        map.map(Key::from("t1"), "Hello").unwrap();
        map.save().unwrap();

        let diff = diff_maps(&map, &empty).unwrap();

        assert_eq!(diff.added_count(), 1);
        assert_eq!(diff.removed_count(), 0);
        assert_eq!(diff.modified_count(), 0);
    }

    #[test]
    fn test_diff_modification() {
        let (_dir, store) = setup();

        // Create initial state
        let mut map = ChkMap::new(&store, None, SearchKeyFunc::Hash16, 1);
        map.set_maximum_size(64).unwrap();
        for i in 0..20 {
            map.map(Key::from(format!("t{}", i).as_str()), "Hello").unwrap();
        }
        let old_root = map.save().unwrap();

        // Modify one key, drop another, add a third
        map.map(Key::from("t3"), "Hello, World").unwrap();
        map.unmap(&Key::from("t7")).unwrap();
        map.map(Key::from("t20"), "New").unwrap();
        let new_root = map.save().unwrap();

        let old = ChkMap::new(&store, Some(old_root), SearchKeyFunc::Hash16, 1);
        let new = ChkMap::new(&store, Some(new_root), SearchKeyFunc::Hash16, 1);
        let diff = diff_maps(&new, &old).unwrap();

        assert_eq!(diff.len(), 3);
        assert_eq!(diff.added_count(), 1);
        assert_eq!(diff.removed_count(), 1);
        assert_eq!(diff.modified_count(), 1);
        assert_eq!(diff.entries[0].key(), &Key::from("t20"));
        assert_eq!(diff.entries[1].old_value(), Some(&b"Hello"[..]));
        assert_eq!(diff.entries[1].new_value(), Some(&b"Hello, World"[..]));
        assert_eq!(diff.entries[2].key(), &Key::from("t7"));
    }

    #[test]
    fn test_diff_identical_maps_is_empty() {
        let (_dir, store) = setup();
        let mut map = ChkMap::new(&store, None, SearchKeyFunc::Plain, 1);
        map.map(Key::from("a"), "1").unwrap();
        let root = map.save().unwrap();
        let other = ChkMap::new(&store, Some(root), SearchKeyFunc::Plain, 1);
        assert!(diff_maps(&map, &other).unwrap().is_empty());
    }
}
