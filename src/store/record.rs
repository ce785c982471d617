//! Record type - the unit returned by a store read

use crate::model::ChkKey;
use crate::{Error, Result};
use bytes::Bytes;

/// Requested ordering of a record stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordOrdering {
    /// Any order the store finds convenient
    #[default]
    Unordered,
    /// The order the keys were requested in
    AsRequested,
}

/// A record read from a store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Key the record was requested under
    pub key: ChkKey,
    /// Full text, or `None` when the store does not have the record
    pub bytes: Option<Bytes>,
}

impl Record {
    pub fn present(key: ChkKey, bytes: Bytes) -> Self {
        Record {
            key,
            bytes: Some(bytes),
        }
    }

    pub fn absent(key: ChkKey) -> Self {
        Record { key, bytes: None }
    }

    pub fn is_absent(&self) -> bool {
        self.bytes.is_none()
    }

    /// The full text, failing for absent records
    pub fn fulltext(&self) -> Result<&Bytes> {
        self.bytes.as_ref().ok_or(Error::Absent(self.key))
    }

    /// Take the full text, failing for absent records
    pub fn into_fulltext(self) -> Result<Bytes> {
        let key = self.key;
        self.bytes.ok_or(Error::Absent(key))
    }
}

/// Compress record bytes for storage
pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::encode_all(data, 3)?)
}

/// Decompress stored bytes and check they hash to `key`
pub(crate) fn decompress_verified(key: ChkKey, data: &[u8]) -> Result<Bytes> {
    if data.is_empty() {
        return Err(Error::Corruption("Empty record data".into()));
    }
    let decompressed = zstd::decode_all(data)?;
    if ChkKey::digest(&decompressed) != key {
        return Err(Error::Corruption(format!(
            "Record {} does not match its content",
            key
        )));
    }
    Ok(Bytes::from(decompressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip_is_verified() {
        let data = b"chkleaf:\n0\n1\n0\n\n";
        let key = ChkKey::digest(data);
        let compressed = compress(data).unwrap();
        let restored = decompress_verified(key, &compressed).unwrap();
        assert_eq!(&restored[..], data);
    }

    #[test]
    fn test_decompress_detects_wrong_key() {
        let compressed = compress(b"some bytes").unwrap();
        let wrong = ChkKey::digest(b"other bytes");
        assert!(matches!(
            decompress_verified(wrong, &compressed),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_absent_record_has_no_fulltext() {
        let record = Record::absent(ChkKey::digest(b"x"));
        assert!(record.is_absent());
        assert!(matches!(record.fulltext(), Err(Error::Absent(_))));
    }
}
