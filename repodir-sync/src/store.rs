//! Storage of the materialized directory.

use anyhow::Result;

use crate::record::{DirectoryKey, RepositoryRecord};

pub mod fs;

pub use self::fs::Store;

/// The materialized directory: records by key plus the pending tombstones.
///
/// Writes take `&mut self`: there is exactly one writer, the sync actor. Reads through `&self`
/// must observe whole records only, never a half-applied write.
pub trait DirectoryStore: std::fmt::Debug + Send + 'static {
    /// Get the record stored for `key`.
    fn get(&self, key: &DirectoryKey) -> Result<Option<RepositoryRecord>>;

    /// Store `record` under its key, replacing what was there.
    fn put(&mut self, record: &RepositoryRecord) -> Result<()>;

    /// All stored records, in key order.
    fn records(&self) -> Result<Vec<RepositoryRecord>>;

    /// Mark the record for `key` removed by `record_id`.
    ///
    /// Returns the updated record, or `None` if there is no record or it was removed already.
    fn soft_delete(
        &mut self,
        key: &DirectoryKey,
        record_id: &str,
    ) -> Result<Option<RepositoryRecord>> {
        let Some(mut record) = self.get(key)? else {
            return Ok(None);
        };
        if record.removed {
            return Ok(None);
        }
        record.removed = true;
        record.removed_by = Some(record_id.to_string());
        self.put(&record)?;
        Ok(Some(record))
    }

    /// Pending tombstones as `(record id, expiry in unix seconds)`.
    fn pending_tombstones(&self) -> Result<Vec<(String, u64)>>;

    /// Add or refresh a pending tombstone.
    fn insert_pending_tombstone(&mut self, record_id: &str, expires_at: u64) -> Result<()>;

    /// Remove a pending tombstone. Returns its expiry if it existed.
    fn remove_pending_tombstone(&mut self, record_id: &str) -> Result<Option<u64>>;
}
