//! Content hash key: `sha1:` followed by the lowercase hex SHA-1 of a record

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Textual prefix of every content hash key
pub const CHK_PREFIX: &str = "sha1:";

/// A 20-byte SHA-1 digest used to address serialized nodes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChkKey([u8; 20]);

impl ChkKey {
    /// Create a key from raw digest bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        ChkKey(bytes)
    }

    /// Hash arbitrary data
    pub fn digest(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        ChkKey(arr)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex of the digest, without the `sha1:` prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the textual `sha1:<40 hex>` form
    pub fn parse(text: &[u8]) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidChkKey(String::from_utf8_lossy(text).into_owned());
        let hex_part = text
            .strip_prefix(CHK_PREFIX.as_bytes())
            .ok_or_else(invalid)?;
        let bytes = hex::decode(hex_part).map_err(|_| invalid())?;
        if bytes.len() != 20 {
            return Err(invalid());
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(ChkKey(arr))
    }

    /// Get a short prefix for display (first 7 chars, like git)
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }
}

impl fmt::Display for ChkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CHK_PREFIX, self.to_hex())
    }
}

impl fmt::Debug for ChkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChkKey({})", self.short())
    }
}

impl FromStr for ChkKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        ChkKey::parse(s.as_bytes())
    }
}

impl Serialize for ChkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_known_sha1() {
        let key = ChkKey::digest(b"chkleaf:\n0\n1\n0\n\n");
        assert_eq!(
            key.to_string(),
            "sha1:8571e09bf1bcc5b9621ce31b3d4c93d6e9a1ed26"
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let key = ChkKey::digest(b"test data");
        let parsed: ChkKey = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ChkKey::parse(b"sha1:1234").is_err());
        assert!(ChkKey::parse(b"md5:8571e09bf1bcc5b9621ce31b3d4c93d6e9a1ed26").is_err());
        assert!(ChkKey::parse(b"sha1:zz71e09bf1bcc5b9621ce31b3d4c93d6e9a1ed26").is_err());
    }

    #[test]
    fn test_short() {
        let key = ChkKey::digest(b"test");
        assert_eq!(key.short().len(), 7);
    }
}
