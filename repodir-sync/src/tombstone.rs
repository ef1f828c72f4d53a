//! Application of tombstones, including ones that arrive before their record.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, trace};

use crate::{
    config::PendingTombstoneConfig,
    incoming::TombstoneMarker,
    record::RepositoryRecord,
    store::DirectoryStore,
};

/// What applying a tombstone did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedTombstone {
    /// Records that were marked removed by this application.
    pub removed: Vec<RepositoryRecord>,
    /// Whether the marker matched nothing and was kept pending.
    pub pending: bool,
}

impl AppliedTombstone {
    /// Number of records this application removed. Zero when applied again.
    pub fn count(&self) -> usize {
        self.removed.len()
    }
}

/// Apply `marker` to every stored record whose version carries the referenced record id.
///
/// A marker that matches no stored record is kept pending, so that the record is suppressed
/// as soon as it arrives. Expired pending markers are pruned on every call.
pub fn apply_tombstone<S: DirectoryStore>(
    store: &mut S,
    marker: &TombstoneMarker,
    config: &PendingTombstoneConfig,
    now: u64,
) -> Result<AppliedTombstone> {
    let record_id = marker.referenced_record_id.as_str();
    let matching: Vec<_> = store
        .records()?
        .into_iter()
        .filter(|r| r.version.record_id == record_id)
        .collect();

    prune_expired(store, now)?;

    if matching.is_empty() {
        let pending = remember(store, record_id, config, now)?;
        return Ok(AppliedTombstone {
            removed: Vec::new(),
            pending,
        });
    }

    let mut removed = Vec::new();
    for record in matching {
        if let Some(record) = store.soft_delete(&record.key, record_id)? {
            debug!(key = %record.key.fmt_short(), %record_id, "record removed");
            removed.push(record);
        }
    }
    Ok(AppliedTombstone {
        removed,
        pending: false,
    })
}

/// Consume the pending tombstone for `record_id`, if there is one that has not expired.
pub fn take_pending<S: DirectoryStore>(store: &mut S, record_id: &str, now: u64) -> Result<bool> {
    match store.remove_pending_tombstone(record_id)? {
        Some(expires_at) if expires_at > now => Ok(true),
        Some(_) => {
            trace!(%record_id, "pending tombstone expired");
            Ok(false)
        }
        None => Ok(false),
    }
}

fn remember<S: DirectoryStore>(
    store: &mut S,
    record_id: &str,
    config: &PendingTombstoneConfig,
    now: u64,
) -> Result<bool> {
    if config.capacity == 0 {
        return Ok(false);
    }
    let mut pending = store.pending_tombstones()?;
    if !pending.iter().any(|(id, _)| id == record_id) {
        pending.sort_by_key(|(_, expires_at)| *expires_at);
        let excess = (pending.len() + 1).saturating_sub(config.capacity);
        for (id, _) in pending.iter().take(excess) {
            debug!(record_id = %id, "evicting pending tombstone");
            store.remove_pending_tombstone(id)?;
        }
    }
    let expires_at = now.saturating_add(config.ttl.as_secs());
    store.insert_pending_tombstone(record_id, expires_at)?;
    trace!(%record_id, expires_at, "tombstone pending");
    Ok(true)
}

fn prune_expired<S: DirectoryStore>(store: &mut S, now: u64) -> Result<()> {
    for (id, expires_at) in store.pending_tombstones()? {
        if expires_at <= now {
            store.remove_pending_tombstone(&id)?;
        }
    }
    Ok(())
}

/// Seconds since the unix epoch, the time base of pending tombstones.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::tests::{owner, record},
        store::Store,
    };

    fn config(capacity: usize, ttl_secs: u64) -> PendingTombstoneConfig {
        PendingTombstoneConfig {
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[test]
    fn removes_matching_records_once() -> Result<()> {
        let mut store = Store::memory()?;
        store.put(&record(owner(1), "a", "e1", 1))?;
        store.put(&record(owner(2), "b", "e1", 1))?;
        store.put(&record(owner(1), "c", "e2", 1))?;

        let marker = TombstoneMarker::new("e1");
        let applied = apply_tombstone(&mut store, &marker, &config(8, 60), 0)?;
        assert_eq!(applied.count(), 2);
        assert!(!applied.pending);
        assert!(applied.removed.iter().all(|r| r.removed));

        let again = apply_tombstone(&mut store, &marker, &config(8, 60), 0)?;
        assert_eq!(again.count(), 0);
        assert!(!again.pending);
        assert!(store.pending_tombstones()?.is_empty());

        let untouched = store.records()?.into_iter().find(|r| r.version.record_id == "e2");
        assert!(!untouched.unwrap().removed);
        Ok(())
    }

    #[test]
    fn unmatched_marker_is_pending_until_expiry() -> Result<()> {
        let mut store = Store::memory()?;
        let marker = TombstoneMarker::new("later");
        let applied = apply_tombstone(&mut store, &marker, &config(8, 60), 100)?;
        assert!(applied.pending);
        assert_eq!(store.pending_tombstones()?, vec![("later".to_string(), 160)]);

        assert!(!take_pending(&mut store, "other", 110)?);
        assert!(take_pending(&mut store, "later", 110)?);
        // consumed
        assert!(!take_pending(&mut store, "later", 110)?);

        apply_tombstone(&mut store, &marker, &config(8, 60), 100)?;
        assert!(!take_pending(&mut store, "later", 160)?);
        Ok(())
    }

    #[test]
    fn pending_set_is_bounded() -> Result<()> {
        let mut store = Store::memory()?;
        let cfg = config(2, 60);
        apply_tombstone(&mut store, &TombstoneMarker::new("a"), &cfg, 0)?;
        apply_tombstone(&mut store, &TombstoneMarker::new("b"), &cfg, 1)?;
        apply_tombstone(&mut store, &TombstoneMarker::new("c"), &cfg, 2)?;
        let ids: Vec<_> = store
            .pending_tombstones()?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);

        // refreshing a known marker evicts nothing
        apply_tombstone(&mut store, &TombstoneMarker::new("b"), &cfg, 3)?;
        assert_eq!(store.pending_tombstones()?.len(), 2);

        // expired markers are pruned
        apply_tombstone(&mut store, &TombstoneMarker::new("d"), &cfg, 62)?;
        let ids: Vec<_> = store
            .pending_tombstones()?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["b", "d"]);

        let mut store = Store::memory()?;
        let applied = apply_tombstone(&mut store, &TombstoneMarker::new("a"), &config(0, 60), 0)?;
        assert!(!applied.pending);
        assert!(store.pending_tombstones()?.is_empty());
        Ok(())
    }
}
