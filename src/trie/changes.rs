//! Streaming comparison of two maps
//!
//! Both trees are walked in search key order with one heap per side.
//! Pages with the same content key on both sides are dropped without being
//! read, so the cost follows the size of the difference, not of the maps.

use super::iter::NodeRef;
use super::node::{Child, Node};
use super::pager::Pager;
use crate::model::{ChkKey, Key};
use crate::Result;
use std::borrow::Cow;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, VecDeque};

/// One change: key, value in the basis, value in the new map
pub type Change = (Key, Option<Vec<u8>>, Option<Vec<u8>>);

enum Entry<'m> {
    Node(NodeRef<'m>),
    Item(Key, Vec<u8>),
}

/// A page or item waiting on one side of the walk
struct Pending<'m> {
    /// Lower bound of every search key at or below this entry
    prefix: Vec<u8>,
    seq: u64,
    entry: Entry<'m>,
}

impl<'m> Pending<'m> {
    /// Pages sort before items with the same prefix
    fn item_key(&self) -> Option<&Key> {
        match &self.entry {
            Entry::Item(key, _) => Some(key),
            Entry::Node(_) => None,
        }
    }

    fn node_key(&self) -> Option<ChkKey> {
        match &self.entry {
            Entry::Node(node) => node.key(),
            Entry::Item(..) => None,
        }
    }

    fn is_node(&self) -> bool {
        matches!(self.entry, Entry::Node(_))
    }
}

impl PartialEq for Pending<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending<'_> {}

impl PartialOrd for Pending<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.item_key().cmp(&other.item_key()))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// One side of the walk
struct Side<'m> {
    pager: Pager<'m>,
    heap: BinaryHeap<Reverse<Pending<'m>>>,
    seq: u64,
}

impl<'m> Side<'m> {
    fn new(pager: Pager<'m>) -> Self {
        Side {
            pager,
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn peek(&self) -> Option<&Pending<'m>> {
        self.heap.peek().map(|Reverse(pending)| pending)
    }

    fn pop(&mut self) -> Option<Pending<'m>> {
        self.heap.pop().map(|Reverse(pending)| pending)
    }

    fn push(&mut self, prefix: Vec<u8>, entry: Entry<'m>) {
        self.seq += 1;
        self.heap.push(Reverse(Pending {
            prefix,
            seq: self.seq,
            entry,
        }));
    }

    /// Queue a child page. Child prefixes are NUL-padded and keys with
    /// shorter search keys route to the padded child, so the page sorts by
    /// its prefix with trailing NULs removed.
    fn push_child(&mut self, prefix: &[u8], child: NodeRef<'m>) {
        let end = prefix.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        self.push(prefix[..end].to_vec(), Entry::Node(child));
    }

    fn push_item(&mut self, key: Key, value: Vec<u8>) {
        let prefix = self.pager.search_key().search_key(&key);
        self.push(prefix, Entry::Item(key, value));
    }

    fn expand(&mut self, node: NodeRef<'m>) -> Result<()> {
        let node = node.resolve(&self.pager)?;
        self.expand_node(node);
        Ok(())
    }

    /// Queue everything directly below a page
    fn expand_node(&mut self, node: Cow<'m, Node>) {
        if let Some(leaf) = node.as_leaf() {
            for (key, value) in leaf.items() {
                self.push_item(key.clone(), value.clone());
            }
        } else {
            self.push_children(&node, &BTreeSet::new());
        }
    }

    /// Queue the children of an internal page except those in `skip`
    fn push_children(&mut self, node: &Cow<'m, Node>, skip: &BTreeSet<Vec<u8>>) {
        match node {
            Cow::Borrowed(Node::Internal(internal)) => {
                for (prefix, child) in internal.children() {
                    if !skip.contains(prefix) {
                        self.push_child(prefix, NodeRef::from_child(child));
                    }
                }
            }
            Cow::Owned(Node::Internal(internal)) => {
                for (prefix, child) in internal.children() {
                    if !skip.contains(prefix) {
                        self.push_child(prefix, NodeRef::from_child_owned(child));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Iterator over the differences between two maps, see
/// [`ChkMap::iter_changes`](super::ChkMap::iter_changes)
///
/// Changes come out in search key order. After an error the iterator is
/// exhausted.
pub struct ChangeIter<'m> {
    new: Side<'m>,
    old: Side<'m>,
    roots: Option<(NodeRef<'m>, NodeRef<'m>)>,
    ready: VecDeque<Change>,
    failed: bool,
}

impl<'m> ChangeIter<'m> {
    pub(crate) fn new(new: (Pager<'m>, &'m Child), old: (Pager<'m>, &'m Child)) -> Self {
        let new_root = NodeRef::from_child(new.1);
        let old_root = NodeRef::from_child(old.1);
        let unchanged = same_page(new_root.key(), old_root.key());
        ChangeIter {
            new: Side::new(new.0),
            old: Side::new(old.0),
            roots: if unchanged {
                None
            } else {
                Some((new_root, old_root))
            },
            ready: VecDeque::new(),
            failed: false,
        }
    }

    /// Compare two pages reached by the same prefix, queueing only the
    /// children or items that differ
    fn expand_common(&mut self, new: NodeRef<'m>, old: NodeRef<'m>) -> Result<()> {
        let new_node = new.resolve(&self.new.pager)?;
        let old_node = old.resolve(&self.old.pager)?;

        if let (Some(new_internal), Some(old_internal)) =
            (new_node.as_internal(), old_node.as_internal())
        {
            let shared: BTreeSet<Vec<u8>> = new_internal
                .children()
                .iter()
                .filter(|(prefix, child)| {
                    let other = old_internal.children().get(*prefix).and_then(Child::key);
                    same_page(child.key(), other)
                })
                .map(|(prefix, _)| prefix.clone())
                .collect();
            self.new.push_children(&new_node, &shared);
            self.old.push_children(&old_node, &shared);
            return Ok(());
        }

        if let (Some(new_leaf), Some(old_leaf)) = (new_node.as_leaf(), old_node.as_leaf()) {
            for (key, value) in new_leaf.items() {
                if old_leaf.get(key) != Some(value.as_slice()) {
                    self.new.push_item(key.clone(), value.clone());
                }
            }
            for (key, value) in old_leaf.items() {
                if new_leaf.get(key) != Some(value.as_slice()) {
                    self.old.push_item(key.clone(), value.clone());
                }
            }
            return Ok(());
        }

        self.new.expand_node(new_node);
        self.old.expand_node(old_node);
        Ok(())
    }

    /// Advance the walk by one entry. Returns false once both sides are
    /// exhausted.
    fn step(&mut self) -> Result<bool> {
        if let Some((new, old)) = self.roots.take() {
            self.expand_common(new, old)?;
            return Ok(true);
        }

        let order = match (self.new.peek(), self.old.peek()) {
            (None, None) => return Ok(false),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(new), Some(old)) => {
                if new.prefix == old.prefix && (new.is_node() || old.is_node()) {
                    return self.step_common_page().map(|()| true);
                }
                new.cmp_across(old)
            }
        };

        match order {
            Ordering::Less => {
                if let Some(pending) = self.new.pop() {
                    match pending.entry {
                        Entry::Item(key, value) => self.ready.push_back((key, None, Some(value))),
                        Entry::Node(node) => self.new.expand(node)?,
                    }
                }
            }
            Ordering::Greater => {
                if let Some(pending) = self.old.pop() {
                    match pending.entry {
                        Entry::Item(key, value) => self.ready.push_back((key, Some(value), None)),
                        Entry::Node(node) => self.old.expand(node)?,
                    }
                }
            }
            Ordering::Equal => {
                if let (Some(new), Some(old)) = (self.new.pop(), self.old.pop()) {
                    if let (Entry::Item(key, new_value), Entry::Item(_, old_value)) =
                        (new.entry, old.entry)
                    {
                        if new_value != old_value {
                            self.ready
                                .push_back((key, Some(old_value), Some(new_value)));
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Both heads share a prefix and at least one of them is a page
    fn step_common_page(&mut self) -> Result<()> {
        let (new_is_node, old_is_node, unchanged) = match (self.new.peek(), self.old.peek()) {
            (Some(new), Some(old)) => (
                new.is_node(),
                old.is_node(),
                same_page(new.node_key(), old.node_key()),
            ),
            _ => return Ok(()),
        };

        if unchanged {
            self.new.pop();
            self.old.pop();
            return Ok(());
        }
        if new_is_node && old_is_node {
            if let (Some(new), Some(old)) = (self.new.pop(), self.old.pop()) {
                if let (Entry::Node(new), Entry::Node(old)) = (new.entry, old.entry) {
                    self.expand_common(new, old)?;
                }
            }
        } else if new_is_node {
            if let Some(Pending {
                entry: Entry::Node(node),
                ..
            }) = self.new.pop()
            {
                self.new.expand(node)?;
            }
        } else if let Some(Pending {
            entry: Entry::Node(node),
            ..
        }) = self.old.pop()
        {
            self.old.expand(node)?;
        }
        Ok(())
    }
}

impl Pending<'_> {
    /// Order heads of the two sides: by prefix, then by item key
    fn cmp_across(&self, other: &Pending<'_>) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.item_key().cmp(&other.item_key()))
    }
}

/// Two pages are known to be identical only when both have been saved
fn same_page(a: Option<ChkKey>, b: Option<ChkKey>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

impl Iterator for ChangeIter<'_> {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(change) = self.ready.pop_front() {
                return Some(Ok(change));
            }
            if self.failed {
                return None;
            }
            match self.step() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
