//! Records and items reachable from new roots but not from old ones
//!
//! Used to find what has to be copied when the maps under `old_roots` are
//! already present elsewhere. The walk goes level by level:
//!
//! 1. Read the old and new roots. New roots are emitted straight away, and
//!    old children whose prefixes cannot overlap anything new are dropped.
//! 2. Read the remaining old pages, remembering every old page key and item.
//! 3. Read the new pages level by level, skipping any page key seen on the
//!    old side, and emit each page with its items minus the old ones.
//!
//! A page emitted early can still turn out to be shared with an old root.
//! That costs a redundant record, never a missed one.

use crate::model::{ChkKey, Key};
use crate::store::{ChkStore, Record, RecordOrdering};
use crate::trie::{Node, SearchKeyFunc};
use crate::Result;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::mem;
use tracing::debug;

/// Pages read per store request on the new side
const NEW_BATCH_SIZE: usize = 256;

/// A page reachable only from the new roots (or `None` for items found
/// in root pages) with its new items
pub type Interesting = (Option<Record>, Vec<(Key, Vec<u8>)>);

enum Phase {
    Roots,
    Old,
    Items,
    New {
        refs: Vec<ChkKey>,
        next: BTreeSet<ChkKey>,
    },
    Done,
}

/// Iterator over [`Interesting`] pages, see [`iter_interesting_nodes`]
pub struct InterestingNodes<'s> {
    store: &'s dyn ChkStore,
    search_key: SearchKeyFunc,
    new_root_keys: Vec<ChkKey>,
    old_root_keys: Vec<ChkKey>,
    /// Every old page key seen so far
    all_old_chks: HashSet<ChkKey>,
    /// Every item in an old leaf read so far
    all_old_items: HashSet<(Key, Vec<u8>)>,
    /// New page keys already emitted or queued
    processed_new_refs: HashSet<ChkKey>,
    old_queue: Vec<ChkKey>,
    new_queue: Vec<ChkKey>,
    /// Items from new root leaves, held until the old side is read
    new_item_queue: Vec<(Key, Vec<u8>)>,
    phase: Phase,
    output: VecDeque<Interesting>,
}

/// Stream the pages reachable from `new_roots` and not from `old_roots`,
/// with the items in them that no old leaf holds
pub fn iter_interesting_nodes<'s>(
    store: &'s dyn ChkStore,
    new_roots: &[ChkKey],
    old_roots: &[ChkKey],
    search_key: SearchKeyFunc,
) -> InterestingNodes<'s> {
    InterestingNodes {
        store,
        search_key,
        new_root_keys: new_roots.to_vec(),
        old_root_keys: old_roots.to_vec(),
        all_old_chks: old_roots.iter().copied().collect(),
        all_old_items: HashSet::new(),
        processed_new_refs: HashSet::new(),
        old_queue: Vec::new(),
        new_queue: Vec::new(),
        new_item_queue: Vec::new(),
        phase: Phase::Roots,
        output: VecDeque::new(),
    }
}

/// A page read straight from the store: the record, its child references and
/// its items
struct ReadPage {
    record: Record,
    refs: Vec<(Vec<u8>, ChkKey)>,
    items: Vec<(Key, Vec<u8>)>,
}

impl<'s> InterestingNodes<'s> {
    fn read_pages(&self, keys: &[ChkKey]) -> Result<Vec<ReadPage>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = keys.len(), "reading pages for difference");
        let records = self
            .store
            .get_record_stream(keys, RecordOrdering::Unordered, true)?;
        records
            .into_iter()
            .map(|record| {
                let node = Node::deserialise(record.fulltext()?, record.key, self.search_key)?;
                let (refs, items) = match &node {
                    Node::Internal(internal) => (internal.refs()?, Vec::new()),
                    Node::Leaf(leaf) => (
                        Vec::new(),
                        leaf.items()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ),
                };
                Ok(ReadPage {
                    record,
                    refs,
                    items,
                })
            })
            .collect()
    }

    fn read_all_roots(&mut self) -> Result<()> {
        if self.old_root_keys.is_empty() {
            self.new_queue = mem::take(&mut self.new_root_keys);
            return Ok(());
        }

        // Old roots: remember their items and hold their children back until
        // the new prefixes are known
        let mut old_to_enqueue = Vec::new();
        for page in self.read_pages(&self.old_root_keys)? {
            let refs: Vec<(Vec<u8>, ChkKey)> = page
                .refs
                .into_iter()
                .filter(|(_, key)| !self.all_old_chks.contains(key))
                .collect();
            self.all_old_chks.extend(refs.iter().map(|(_, key)| *key));
            self.all_old_items.extend(page.items);
            old_to_enqueue.extend(refs);
        }

        let new_keys: Vec<ChkKey> = self
            .new_root_keys
            .iter()
            .filter(|key| !self.all_old_chks.contains(key))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.processed_new_refs.extend(new_keys.iter().copied());

        let mut new_prefixes: HashSet<Vec<u8>> = HashSet::new();
        for page in self.read_pages(&new_keys)? {
            let refs: Vec<(Vec<u8>, ChkKey)> = page
                .refs
                .into_iter()
                .filter(|(_, key)| {
                    !self.all_old_chks.contains(key) && !self.processed_new_refs.contains(key)
                })
                .collect();
            for (prefix, key) in refs {
                new_prefixes.insert(prefix);
                self.new_queue.push(key);
                self.processed_new_refs.insert(key);
            }
            for item in page.items {
                if !self.all_old_items.contains(&item) {
                    new_prefixes.insert(self.search_key.search_key(&item.0));
                    self.new_item_queue.push(item);
                }
            }
            self.output.push_back((Some(page.record), Vec::new()));
        }

        // A new prefix 'ab' also makes an old child at 'a' relevant
        let full: Vec<Vec<u8>> = new_prefixes.iter().cloned().collect();
        for prefix in full {
            for i in 1..prefix.len() {
                new_prefixes.insert(prefix[..i].to_vec());
            }
        }
        for (prefix, key) in old_to_enqueue {
            if (1..=prefix.len()).any(|i| new_prefixes.contains(&prefix[..i])) {
                self.old_queue.push(key);
            }
        }
        debug!(
            new = self.new_queue.len(),
            old = self.old_queue.len(),
            "read roots"
        );
        Ok(())
    }

    fn process_old_queue(&mut self) -> Result<()> {
        let refs = mem::take(&mut self.old_queue);
        for page in self.read_pages(&refs)? {
            self.all_old_items.extend(page.items);
            for (_, key) in page.refs {
                if self.all_old_chks.insert(key) {
                    self.old_queue.push(key);
                }
            }
        }
        Ok(())
    }

    /// Emit the held root items and start the new side walk
    fn flush_items(&mut self) -> Phase {
        let items: Vec<(Key, Vec<u8>)> = mem::take(&mut self.new_item_queue)
            .into_iter()
            .filter(|item| !self.all_old_items.contains(item))
            .collect();
        if !items.is_empty() {
            self.output.push_back((None, items));
        }

        let refs: BTreeSet<ChkKey> = mem::take(&mut self.new_queue)
            .into_iter()
            .filter(|key| !self.all_old_chks.contains(key))
            .collect();
        self.processed_new_refs.extend(refs.iter().copied());
        Phase::New {
            refs: refs.into_iter().collect(),
            next: BTreeSet::new(),
        }
    }

    /// Read one batch of new pages, moving to the next level when the
    /// current one is done
    fn process_new_batch(
        &mut self,
        mut refs: Vec<ChkKey>,
        mut next: BTreeSet<ChkKey>,
    ) -> Result<Phase> {
        if refs.is_empty() {
            refs = next
                .into_iter()
                .filter(|key| {
                    !self.all_old_chks.contains(key) && !self.processed_new_refs.contains(key)
                })
                .collect();
            if refs.is_empty() {
                return Ok(Phase::Done);
            }
            self.processed_new_refs.extend(refs.iter().copied());
            next = BTreeSet::new();
        }

        let rest = refs.split_off(refs.len().min(NEW_BATCH_SIZE));
        for page in self.read_pages(&refs)? {
            let items = page
                .items
                .into_iter()
                .filter(|item| !self.all_old_items.contains(item))
                .collect();
            next.extend(page.refs.into_iter().map(|(_, key)| key));
            self.output.push_back((Some(page.record), items));
        }
        Ok(Phase::New { refs: rest, next })
    }

    fn step(&mut self) -> Result<()> {
        self.phase = match mem::replace(&mut self.phase, Phase::Done) {
            Phase::Roots => {
                self.read_all_roots()?;
                Phase::Old
            }
            Phase::Old => {
                if self.old_queue.is_empty() {
                    Phase::Items
                } else {
                    self.process_old_queue()?;
                    Phase::Old
                }
            }
            Phase::Items => self.flush_items(),
            Phase::New { refs, next } => self.process_new_batch(refs, next)?,
            Phase::Done => Phase::Done,
        };
        Ok(())
    }
}

impl Iterator for InterestingNodes<'_> {
    type Item = Result<Interesting>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(found) = self.output.pop_front() {
                return Some(Ok(found));
            }
            if matches!(self.phase, Phase::Done) {
                return None;
            }
            if let Err(e) = self.step() {
                self.phase = Phase::Done;
                self.output.clear();
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::trie::ChkMap;
    use crate::Error;

    fn build(store: &MemoryStore, keys: &[&str], maximum_size: usize) -> ChkKey {
        ChkMap::from_dict(
            store,
            keys.iter().map(|k| (Key::from(*k), b"v".to_vec())),
            maximum_size,
            1,
            SearchKeyFunc::Plain,
        )
        .unwrap()
    }

    fn run(store: &MemoryStore, new: &[ChkKey], old: &[ChkKey]) -> Vec<Interesting> {
        iter_interesting_nodes(store, new, old, SearchKeyFunc::Plain)
            .collect::<Result<_>>()
            .unwrap()
    }

    fn record_keys(found: &[Interesting]) -> Vec<String> {
        found
            .iter()
            .filter_map(|(record, _)| record.as_ref().map(|r| r.key.to_string()))
            .collect()
    }

    fn all_items(found: &[Interesting]) -> Vec<Key> {
        let mut keys: Vec<Key> = found
            .iter()
            .flat_map(|(_, items)| items.iter().map(|(k, _)| k.clone()))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_no_old_roots_yields_everything() {
        let store = MemoryStore::new();
        let root = build(&store, &["aaa", "bba", "bbb"], 10);
        let found = run(&store, &[root], &[]);
        assert_eq!(record_keys(&found).len(), 5);
        assert_eq!(
            all_items(&found),
            vec![Key::from("aaa"), Key::from("bba"), Key::from("bbb")]
        );
    }

    #[test]
    fn test_identical_roots_yield_nothing() {
        let store = MemoryStore::new();
        let root = build(&store, &["aaa", "bba"], 10);
        store.reset_read_stats();
        assert!(run(&store, &[root], &[root]).is_empty());
    }

    #[test]
    fn test_shared_pages_are_skipped() {
        let store = MemoryStore::new();
        let old = build(&store, &["aaa", "bba"], 10);
        let new = build(&store, &["aaa", "bba", "bbb"], 10);
        let found = run(&store, &[new], &[old]);
        assert_eq!(
            record_keys(&found),
            vec![
                "sha1:9d34878bf3cb427d97ad73cb6269cd8684a40194",
                "sha1:ecc737566509f2af0346ba8925056c99742c5685",
                "sha1:8f713aad6a65cd35e6a20995f992ae0f2e37bcf0",
            ]
        );
        assert_eq!(all_items(&found), vec![Key::from("bbb")]);
    }

    #[test]
    fn test_unrelated_shared_subtrees_are_not_read() {
        let store = MemoryStore::new();
        let old = build(&store, &["aaa", "aab", "bba", "bbb", "cca"], 10);
        let new = build(&store, &["aaa", "aab", "bba", "bbb", "cca", "ccb"], 10);

        let children = |root: ChkKey| {
            let node = Node::deserialise(&store.get(&root).unwrap(), root, SearchKeyFunc::Plain)
                .unwrap();
            node.as_internal().unwrap().refs().unwrap()
        };
        let old_children = children(old);
        let new_children = children(new);
        let shared: Vec<ChkKey> = old_children
            .iter()
            .filter(|(prefix, _)| prefix.as_slice() != b"c")
            .map(|(_, key)| *key)
            .collect();
        assert_eq!(shared.len(), 2);
        for key in &shared {
            assert!(new_children.iter().any(|(_, k)| k == key));
        }

        store.reset_read_stats();
        let found = run(&store, &[new], &[old]);
        assert_eq!(all_items(&found), vec![Key::from("ccb")]);
        let read = store.read_keys();
        for key in &shared {
            assert!(!read.contains(key));
        }
    }

    #[test]
    fn test_moved_items_are_cancelled() {
        let store = MemoryStore::new();
        // one flat leaf on the old side, a split tree on the new side
        let old = build(&store, &["aaa", "bba"], 100);
        let new = build(&store, &["aaa", "bba", "bbb"], 10);
        let found = run(&store, &[new], &[old]);
        assert_eq!(record_keys(&found).len(), 5);
        assert_eq!(all_items(&found), vec![Key::from("bbb")]);
    }

    #[test]
    fn test_changed_value_is_emitted() {
        let store = MemoryStore::new();
        let old = build(&store, &["aaa", "bba"], 10);
        let mut map = ChkMap::new(&store, Some(old), SearchKeyFunc::Plain, 1);
        map.map(Key::from("bba"), "changed").unwrap();
        let new = map.save().unwrap();

        let found = run(&store, &[new], &[old]);
        let items: Vec<(Key, Vec<u8>)> = found.into_iter().flat_map(|(_, items)| items).collect();
        assert_eq!(items, vec![(Key::from("bba"), b"changed".to_vec())]);
    }

    #[test]
    fn test_missing_page_is_fatal() {
        let store = MemoryStore::new();
        let missing = ChkKey::digest(b"not stored");
        let mut iter = iter_interesting_nodes(&store, &[missing], &[], SearchKeyFunc::Plain);
        assert!(matches!(iter.next(), Some(Err(Error::Absent(k))) if k == missing));
        assert!(iter.next().is_none());
    }
}
