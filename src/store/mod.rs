//! Content-addressed backing stores
//!
//! The map only talks to storage through [`ChkStore`]: a batched record
//! reader and a write path that returns the content hash key of new bytes.
//! Records are immutable once written.

mod file_store;
mod memory;
mod record;

pub use file_store::FileStore;
pub use memory::MemoryStore;
pub use record::{Record, RecordOrdering};

use crate::model::ChkKey;
use crate::Result;

/// A store of immutable records addressed by content hash key
pub trait ChkStore {
    /// Fetch the records for `keys`.
    ///
    /// With `include_missing` set, keys the store does not hold come back as
    /// absent records; otherwise the first missing key is an
    /// [`Error::Absent`](crate::Error::Absent).
    fn get_record_stream(
        &self,
        keys: &[ChkKey],
        ordering: RecordOrdering,
        include_missing: bool,
    ) -> Result<Vec<Record>>;

    /// Write `bytes` and return their content hash key. Writing bytes that
    /// are already present is a no-op.
    fn add_bytes(&self, bytes: &[u8]) -> Result<ChkKey>;
}

impl<S: ChkStore + ?Sized> ChkStore for &S {
    fn get_record_stream(
        &self,
        keys: &[ChkKey],
        ordering: RecordOrdering,
        include_missing: bool,
    ) -> Result<Vec<Record>> {
        (**self).get_record_stream(keys, ordering, include_missing)
    }

    fn add_bytes(&self, bytes: &[u8]) -> Result<ChkKey> {
        (**self).add_bytes(bytes)
    }
}
