//! Lazy traversal of a map's items

use super::node::{Child, Node};
use super::pager::Pager;
use crate::model::{ChkKey, Key};
use crate::{Error, Result};
use std::borrow::Cow;
use std::collections::VecDeque;

/// A node reached during a traversal: resident in the map, paged in by the
/// traversal itself, or not read yet
pub(crate) enum NodeRef<'m> {
    Borrowed(&'m Node),
    Owned(Box<Node>),
    Stored(ChkKey),
}

impl<'m> NodeRef<'m> {
    pub fn from_child(child: &'m Child) -> Self {
        match child {
            Child::Stored(key) => NodeRef::Stored(*key),
            Child::Loaded(node) => NodeRef::Borrowed(node),
        }
    }

    /// Reference a child of a node the traversal owns
    pub fn from_child_owned(child: &Child) -> Self {
        match child {
            Child::Stored(key) => NodeRef::Stored(*key),
            Child::Loaded(node) => NodeRef::Owned(node.clone()),
        }
    }

    pub fn key(&self) -> Option<ChkKey> {
        match self {
            NodeRef::Borrowed(node) => node.key(),
            NodeRef::Owned(node) => node.key(),
            NodeRef::Stored(key) => Some(*key),
        }
    }

    /// The node itself, paging it in if needed
    pub fn resolve(self, pager: &Pager<'_>) -> Result<Cow<'m, Node>> {
        match self {
            NodeRef::Borrowed(node) => Ok(Cow::Borrowed(node)),
            NodeRef::Owned(node) => Ok(Cow::Owned(*node)),
            NodeRef::Stored(key) => pager.load(&key).map(Cow::Owned),
        }
    }
}

/// Reference `children`, reading every one not yet resident in a single
/// store request
fn load_children<'c, 'm>(
    pager: &Pager<'_>,
    children: Vec<&'c Child>,
    wrap: impl Fn(&'c Child) -> NodeRef<'m>,
) -> Result<Vec<NodeRef<'m>>> {
    let stored: Vec<ChkKey> = children
        .iter()
        .filter_map(|child| match child {
            Child::Stored(key) => Some(*key),
            Child::Loaded(_) => None,
        })
        .collect();
    let mut loaded = pager.load_many(&stored)?.into_iter();
    children
        .into_iter()
        .map(|child| match child {
            Child::Stored(key) => loaded
                .next()
                .map(|node| NodeRef::Owned(Box::new(node)))
                .ok_or(Error::Absent(*key)),
            Child::Loaded(_) => Ok(wrap(child)),
        })
        .collect()
}

/// Iterator over the items of a map, see
/// [`ChkMap::iteritems`](super::ChkMap::iteritems)
///
/// Pages are read as the traversal reaches them. After an error the
/// iterator is exhausted.
pub struct ItemIter<'m> {
    pager: Pager<'m>,
    filter: Option<Vec<Key>>,
    stack: Vec<NodeRef<'m>>,
    ready: VecDeque<(Key, Vec<u8>)>,
    failed: bool,
}

impl<'m> ItemIter<'m> {
    pub(crate) fn new(pager: Pager<'m>, root: &'m Child, filter: Option<Vec<Key>>) -> Self {
        ItemIter {
            pager,
            filter,
            stack: vec![NodeRef::from_child(root)],
            ready: VecDeque::new(),
            failed: false,
        }
    }

    fn expand(&mut self, node: NodeRef<'m>) -> Result<()> {
        let filter = self.filter.as_deref();
        let children = match node.resolve(&self.pager)? {
            Cow::Borrowed(Node::Leaf(leaf)) => {
                self.ready.extend(leaf.matching_items(filter));
                return Ok(());
            }
            Cow::Owned(Node::Leaf(leaf)) => {
                self.ready.extend(leaf.matching_items(filter));
                return Ok(());
            }
            Cow::Borrowed(Node::Internal(internal)) => load_children(
                &self.pager,
                internal.select_children(filter),
                NodeRef::from_child,
            )?,
            Cow::Owned(Node::Internal(internal)) => load_children(
                &self.pager,
                internal.select_children(filter),
                NodeRef::from_child_owned,
            )?,
        };
        self.stack.extend(children.into_iter().rev());
        Ok(())
    }
}

impl Iterator for ItemIter<'_> {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(Ok(item));
            }
            if self.failed {
                return None;
            }
            let node = self.stack.pop()?;
            if let Err(e) = self.expand(node) {
                self.failed = true;
                self.stack.clear();
                return Some(Err(e));
            }
        }
    }
}
