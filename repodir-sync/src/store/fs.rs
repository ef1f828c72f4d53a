//! Directory storage on top of redb, on disk or in memory.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use redb::{
    backends::InMemoryBackend, Database, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use tracing::info;

use super::DirectoryStore;
use crate::record::{DirectoryKey, RepositoryRecord};

/// Table: Records
/// Key:   `&str`  # DirectoryKey, `<hex owner>:<repo id>`
/// Value: `&[u8]` # postcard encoded RepositoryRecord
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records-1");

/// Table: Pending tombstones
/// Key:   `&str` # referenced record id
/// Value: `u64`  # expiry, unix seconds
const PENDING_TOMBSTONES_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("pending-tombstones-1");

/// The directory store.
///
/// Cheaply cloneable. Every clone shares the same database; reads run in their own read
/// transaction and see a consistent snapshot while the writer is busy.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Create a new store in memory.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    /// Create or open a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading directory database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory at {}", path.display())
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open directory database")?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(RECORDS_TABLE)?;
            let _table = write_tx.open_table(PENDING_TOMBSTONES_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Hard-delete the record for `key`. Returns whether there was one.
    ///
    /// The engine never calls this, it is meant for administrative cleanup.
    pub fn purge(&self, key: &DirectoryKey) -> Result<bool> {
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(RECORDS_TABLE)?;
            #[allow(clippy::let_and_return)]
            let removed = table.remove(key.to_storage_key().as_str())?.is_some();
            removed
        };
        write_tx.commit()?;
        Ok(removed)
    }

    /// Number of stored records, removed ones included.
    pub fn len(&self) -> Result<usize> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECORDS_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl DirectoryStore for Store {
    fn get(&self, key: &DirectoryKey) -> Result<Option<RepositoryRecord>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECORDS_TABLE)?;
        let Some(value) = table.get(key.to_storage_key().as_str())? else {
            return Ok(None);
        };
        let record = postcard::from_bytes(value.value())
            .with_context(|| format!("failed to decode record {key}"))?;
        Ok(Some(record))
    }

    fn put(&mut self, record: &RepositoryRecord) -> Result<()> {
        let value = postcard::to_stdvec(record)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(RECORDS_TABLE)?;
            table.insert(record.key.to_storage_key().as_str(), value.as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<RepositoryRecord>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(RECORDS_TABLE)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let record = postcard::from_bytes(value.value())
                .with_context(|| format!("failed to decode record {}", key.value()))?;
            records.push(record);
        }
        Ok(records)
    }

    fn pending_tombstones(&self) -> Result<Vec<(String, u64)>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(PENDING_TOMBSTONES_TABLE)?;
        let mut pending = Vec::new();
        for entry in table.iter()? {
            let (record_id, expires_at) = entry?;
            pending.push((record_id.value().to_string(), expires_at.value()));
        }
        Ok(pending)
    }

    fn insert_pending_tombstone(&mut self, record_id: &str, expires_at: u64) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(PENDING_TOMBSTONES_TABLE)?;
            table.insert(record_id, expires_at)?;
        }
        write_tx.commit()?;
        Ok(())
    }

    fn remove_pending_tombstone(&mut self, record_id: &str) -> Result<Option<u64>> {
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(PENDING_TOMBSTONES_TABLE)?;
            #[allow(clippy::let_and_return)]
            let removed = table.remove(record_id)?.map(|expires_at| expires_at.value());
            removed
        };
        write_tx.commit()?;
        Ok(removed)
    }
}
