//! Map keys: fixed-width tuples of byte strings

use std::fmt;

/// A key tuple stored in a map
///
/// Every key in one map has the same number of elements (the map's
/// `key_width`). Ordering is lexicographic over the elements.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Key(Vec<Vec<u8>>);

impl Key {
    /// Create a key from its elements
    pub fn new(elements: Vec<Vec<u8>>) -> Self {
        Key(elements)
    }

    /// Create a single-element key
    pub fn single(element: impl Into<Vec<u8>>) -> Self {
        Key(vec![element.into()])
    }

    pub fn elements(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key with only its first `n` elements
    pub fn prefix(&self, n: usize) -> &[Vec<u8>] {
        &self.0[..n.min(self.0.len())]
    }

    /// NUL-joined elements, as written into leaf nodes
    pub fn serialise(&self) -> Vec<u8> {
        self.0.join(&b'\x00')
    }

    pub fn into_elements(self) -> Vec<Vec<u8>> {
        self.0
    }
}

impl From<Vec<Vec<u8>>> for Key {
    fn from(elements: Vec<Vec<u8>>) -> Self {
        Key(elements)
    }
}

impl From<&[&[u8]]> for Key {
    fn from(elements: &[&[u8]]) -> Self {
        Key(elements.iter().map(|e| e.to_vec()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Key {
    fn from(elements: [&str; N]) -> Self {
        Key(elements.iter().map(|e| e.as_bytes().to_vec()).collect())
    }
}

impl From<&str> for Key {
    fn from(element: &str) -> Self {
        Key::single(element.as_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{}'", element.escape_ascii())?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key{}", self)
    }
}
