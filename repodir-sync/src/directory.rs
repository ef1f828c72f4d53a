//! The ingest pipeline over a [`DirectoryStore`].

use anyhow::Result;
use tracing::{trace, warn};

use crate::{
    config::PendingTombstoneConfig,
    error::IngestError,
    incoming::{IncomingRecord, Origin, TombstoneMarker},
    merge::{merge, LocalEdit},
    normalize::{normalize, NormalizedRecord},
    record::{DirectoryKey, RepositoryRecord},
    store::DirectoryStore,
    tombstone::{self, take_pending, unix_now, AppliedTombstone},
};

/// What happened to one incoming record.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The record was merged and the result stored.
    Stored(RepositoryRecord),
    /// The record was merged, and the result equals what was stored already.
    Unchanged(RepositoryRecord),
    /// Nothing was stored.
    Rejected(IngestError),
}

impl IngestOutcome {
    /// The stored record, unless rejected.
    pub fn record(&self) -> Option<&RepositoryRecord> {
        match self {
            IngestOutcome::Stored(record) | IngestOutcome::Unchanged(record) => Some(record),
            IngestOutcome::Rejected(_) => None,
        }
    }

    /// Whether the store changed.
    pub fn is_stored(&self) -> bool {
        matches!(self, IngestOutcome::Stored(_))
    }
}

/// Owns the store and runs every mutation through validation and the merge engine.
///
/// Not synchronized: exactly one [`Directory`] may mutate a store, see
/// [`SyncHandle`](crate::actor::SyncHandle).
#[derive(Debug)]
pub struct Directory<S> {
    store: S,
    pending: PendingTombstoneConfig,
}

impl<S: DirectoryStore> Directory<S> {
    /// Create a new directory over `store`.
    pub fn new(store: S, pending: PendingTombstoneConfig) -> Self {
        Self { store, pending }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume the directory, returning the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Ingest one record.
    ///
    /// A record that cannot be stored is logged and reported as [`IngestOutcome::Rejected`];
    /// only storage failures are errors.
    pub fn ingest(&mut self, raw: &IncomingRecord, origin: Origin) -> Result<IngestOutcome> {
        let normalized = crate::validate::validate(raw)
            .and_then(|key| normalize(raw, key, origin.clone()));
        match normalized {
            Ok(normalized) => self.store_merged(normalized),
            Err(err) => Ok(reject(&raw.record_id, &origin, err)),
        }
    }

    /// Apply a local edit to the record stored for `key`.
    ///
    /// Returns `None` if there is no such record.
    pub fn edit_local(
        &mut self,
        key: &DirectoryKey,
        edit: &LocalEdit,
    ) -> Result<Option<IngestOutcome>> {
        let Some(existing) = self.store.get(key)? else {
            return Ok(None);
        };
        let outcome = self.store_merged(edit.to_record(&existing))?;
        Ok(Some(outcome))
    }

    /// Apply a tombstone.
    pub fn apply_tombstone(&mut self, marker: &TombstoneMarker) -> Result<AppliedTombstone> {
        tombstone::apply_tombstone(&mut self.store, marker, &self.pending, unix_now())
    }

    fn store_merged(&mut self, normalized: NormalizedRecord) -> Result<IngestOutcome> {
        let origin = normalized.origin.clone();
        let record_id = normalized.record.version.record_id.clone();
        let existing = self.store.get(&normalized.record.key)?;
        let mut record = match merge(existing.as_ref(), normalized) {
            Ok(record) => record,
            Err(err) => return Ok(reject(&record_id, &origin, err)),
        };
        if !record.removed && take_pending(&mut self.store, &record_id, unix_now())? {
            trace!(key = %record.key.fmt_short(), "record suppressed by pending tombstone");
            record.removed = true;
            record.removed_by = Some(record.version.record_id.clone());
        }
        if existing.as_ref() == Some(&record) {
            return Ok(IngestOutcome::Unchanged(record));
        }
        self.store.put(&record)?;
        trace!(key = %record.key.fmt_short(), version = ?record.version, "stored");
        Ok(IngestOutcome::Stored(record))
    }
}

fn reject(record_id: &str, origin: &Origin, err: IngestError) -> IngestOutcome {
    let source = origin.source().map(|s| s.as_str()).unwrap_or("local");
    if err.is_stale() {
        trace!(%record_id, %source, %err, "discarding record");
    } else {
        warn!(%record_id, %source, %err, "rejecting record");
    }
    IngestOutcome::Rejected(err)
}
