//! Trie node types
//!
//! A map is a tree of pages. Leaf pages hold the key/value items, internal
//! pages route search key prefixes to child pages. An internal page refers
//! to a child either by its content key or by the resident node, so a tree
//! is only paged in as far as an operation needs.

use super::internal::InternalNode;
use super::leaf::LeafNode;
use super::pager::Pager;
use super::search_key::SearchKeyFunc;
use crate::model::{ChkKey, Key};
use crate::{Error, Result};

pub(crate) const LEAF_MAGIC: &[u8] = b"chkleaf:";
pub(crate) const INTERNAL_MAGIC: &[u8] = b"chknode:";

/// A page of the map
#[derive(Clone, Debug)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// A child slot of an internal node
#[derive(Clone, Debug)]
pub enum Child {
    /// Not read yet; only the content key is known
    Stored(ChkKey),
    /// Resident in memory, possibly modified since it was read
    Loaded(Box<Node>),
}

/// Result of a leaf overflowing: the common search prefix and the pages
/// that replace the leaf, each with the prefix it is reached by
#[derive(Debug)]
pub(crate) struct Split {
    pub prefix: Vec<u8>,
    pub children: Vec<(Vec<u8>, Node)>,
}

impl Node {
    /// Parse a serialized page, dispatching on its magic line
    pub fn deserialise(bytes: &[u8], key: ChkKey, search_key: SearchKeyFunc) -> Result<Node> {
        if has_magic(bytes, LEAF_MAGIC) {
            Ok(Node::Leaf(LeafNode::deserialise(bytes, key, search_key)?))
        } else if has_magic(bytes, INTERNAL_MAGIC) {
            Ok(Node::Internal(InternalNode::deserialise(
                bytes, key, search_key,
            )?))
        } else {
            Err(Error::Format(format!("Unknown node type in {}", key)))
        }
    }

    /// Content key, or `None` if the node changed since it was last saved
    pub fn key(&self) -> Option<ChkKey> {
        match self {
            Node::Leaf(leaf) => leaf.key(),
            Node::Internal(internal) => internal.key(),
        }
    }

    /// Number of items in this node's subtree
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.len(),
            Node::Internal(internal) => internal.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn maximum_size(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.maximum_size(),
            Node::Internal(internal) => internal.maximum_size(),
        }
    }

    pub fn key_width(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.key_width(),
            Node::Internal(internal) => internal.key_width(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Internal(_) => None,
        }
    }

    pub fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Node::Internal(internal) => Some(internal),
            Node::Leaf(_) => None,
        }
    }

    /// Class name used when rendering a tree
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Node::Leaf(_) => "LeafNode",
            Node::Internal(_) => "InternalNode",
        }
    }

    pub(crate) fn set_maximum_size(&mut self, maximum_size: usize) {
        match self {
            Node::Leaf(leaf) => leaf.set_maximum_size(maximum_size),
            Node::Internal(internal) => internal.set_maximum_size(maximum_size),
        }
    }

    /// Map `key` to `value` in this subtree.
    ///
    /// An internal node replaces itself when it has to grow a new parent or
    /// collapses into a leaf. A leaf that overflows is left as it is and the
    /// pages replacing it are returned.
    pub(crate) fn map(
        &mut self,
        pager: &Pager<'_>,
        key: Key,
        value: Vec<u8>,
    ) -> Result<Option<Split>> {
        match self {
            Node::Leaf(leaf) => leaf.map(pager, key, value),
            Node::Internal(internal) => {
                if let Some(replacement) = internal.map(pager, key, value)? {
                    *self = replacement;
                }
                Ok(None)
            }
        }
    }

    /// Remove `key` from this subtree, replacing this node if it collapses
    pub(crate) fn unmap(&mut self, pager: &Pager<'_>, key: &Key, check_remap: bool) -> Result<()> {
        match self {
            Node::Leaf(leaf) => leaf.unmap(key),
            Node::Internal(internal) => {
                if let Some(replacement) = internal.unmap(pager, key, check_remap)? {
                    *self = replacement;
                }
                Ok(())
            }
        }
    }

    /// Write every unsaved page of this subtree, children first
    pub(crate) fn save(&mut self, pager: &Pager<'_>) -> Result<ChkKey> {
        match self {
            Node::Leaf(leaf) => leaf.save(pager),
            Node::Internal(internal) => internal.save(pager),
        }
    }
}

impl Child {
    /// Content key of the child, if it has one
    pub fn key(&self) -> Option<ChkKey> {
        match self {
            Child::Stored(key) => Some(*key),
            Child::Loaded(node) => node.key(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Child::Loaded(_))
    }

    /// The resident node, paging it in first if needed
    pub(crate) fn node_mut(&mut self, pager: &Pager<'_>) -> Result<&mut Node> {
        if let Child::Stored(key) = *self {
            *self = Child::Loaded(Box::new(pager.load(&key)?));
        }
        match self {
            Child::Loaded(node) => Ok(&mut **node),
            Child::Stored(key) => Err(Error::Invariant(format!("{} was not paged in", key))),
        }
    }

    /// Take the node out of the slot, paging it in if needed
    pub(crate) fn into_node(self, pager: &Pager<'_>) -> Result<Node> {
        match self {
            Child::Stored(key) => pager.load(&key),
            Child::Loaded(node) => Ok(*node),
        }
    }
}

impl From<Node> for Child {
    fn from(node: Node) -> Self {
        Child::Loaded(Box::new(node))
    }
}

fn has_magic(bytes: &[u8], magic: &[u8]) -> bool {
    bytes.starts_with(magic) && bytes.get(magic.len()) == Some(&b'\n')
}

/// Longest common prefix of two byte strings
pub(crate) fn common_prefix<'a>(prefix: &'a [u8], other: &[u8]) -> &'a [u8] {
    let len = prefix
        .iter()
        .zip(other)
        .take_while(|(a, b)| a == b)
        .count();
    &prefix[..len]
}

/// Longest common prefix of all the strings, `None` for no strings
pub(crate) fn common_prefix_many<I>(strings: I) -> Option<Vec<u8>>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut strings = strings.into_iter();
    let mut prefix = strings.next()?.as_ref().to_vec();
    for s in strings {
        let len = common_prefix(&prefix, s.as_ref()).len();
        prefix.truncate(len);
        if prefix.is_empty() {
            break;
        }
    }
    Some(prefix)
}

/// Split serialized page bytes into lines, requiring a trailing newline
pub(crate) fn split_lines<'a>(bytes: &'a [u8], key: &ChkKey) -> Result<Vec<&'a [u8]>> {
    let mut lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    match lines.pop() {
        Some(last) if last.is_empty() && !lines.is_empty() => Ok(lines),
        _ => Err(Error::Format(format!(
            "{} does not end with a newline",
            key
        ))),
    }
}

/// Parse a decimal header line
pub(crate) fn parse_count(line: Option<&[u8]>, what: &str, key: &ChkKey) -> Result<usize> {
    let line = line.ok_or_else(|| Error::Format(format!("{} is missing its {}", key, what)))?;
    std::str::from_utf8(line)
        .ok()
        .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| {
            Error::Format(format!(
                "{} has a bad {}: {:?}",
                key,
                what,
                line.escape_ascii().to_string()
            ))
        })
}

/// Number of decimal digits needed to write `n`
pub(crate) fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}
