//! The merge engine: decides what gets stored when a record meets the stored state of its key.
//!
//! Every producer of records goes through [`merge`]: remote records, local edits and the read
//! time deduplication in [`query`](crate::query) all use the same precedence rules.
//!
//! * No stored record: the incoming record is stored as is.
//! * Replaceable records replace the stored one only if strictly newer. Equal timestamps are
//!   stale, so redelivery never changes anything.
//! * Freeform records are never stale. Non-empty incoming fields win, empty ones keep the stored
//!   value, and the stored timestamp never goes back.
//! * Fields in the stored record's locally owned set survive unless the incoming record comes
//!   from the local actor.
//! * Contributor lists are merged per identity, incoming entries win.
//! * After every merge the owner entry is forced to weight 100 and role owner.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    error::IngestError,
    incoming::{Origin, ShapeKind},
    normalize::{dedup, NormalizedRecord},
    record::{Contributor, RecordField, RepositoryRecord},
};

/// Outcome of a merge: the record to store, or why nothing is stored.
pub type MergeResult = Result<RepositoryRecord, IngestError>;

/// Merge `incoming` into `existing`, the stored record for the same key.
pub fn merge(existing: Option<&RepositoryRecord>, incoming: NormalizedRecord) -> MergeResult {
    let NormalizedRecord {
        mut record,
        shape,
        origin,
    } = incoming;

    let Some(existing) = existing else {
        finish(&mut record);
        return Ok(record);
    };
    debug_assert_eq!(existing.key, record.key);
    let local = origin.is_local();

    match shape {
        ShapeKind::Replaceable => {
            if record.version.timestamp <= existing.version.timestamp {
                return Err(IngestError::StaleRecord {
                    incoming: record.version.timestamp,
                    stored: existing.version.timestamp,
                });
            }
        }
        ShapeKind::Freeform => {
            for field in RecordField::iter() {
                let cleared_locally = local && record.locally_owned.contains(&field);
                if record.is_empty(field) && !cleared_locally {
                    record.copy_field(field, existing);
                }
            }
            record.version.timestamp = record.version.timestamp.max(existing.version.timestamp);
        }
    }

    if local {
        record
            .locally_owned
            .extend(existing.locally_owned.iter().copied());
    } else {
        carry_locally_owned(existing, &mut record);
    }

    record.contributors = merge_contributors(&existing.contributors, record.contributors);

    // a tombstone only suppresses the record id it names
    let record_id = record.version.record_id.as_str();
    if existing.removed && existing.removed_by.as_deref() == Some(record_id) {
        record.removed = true;
        record.removed_by.clone_from(&existing.removed_by);
    } else {
        record.removed = false;
        record.removed_by = None;
    }

    finish(&mut record);
    Ok(record)
}

/// Whether `candidate` takes precedence over `current` for the same key.
pub(crate) fn supersedes(candidate: &RepositoryRecord, current: &RepositoryRecord) -> bool {
    candidate.version.timestamp > current.version.timestamp
}

/// Copy every field `existing` owns locally into `record` and keep them owned.
pub(crate) fn carry_locally_owned(existing: &RepositoryRecord, record: &mut RepositoryRecord) {
    for field in &existing.locally_owned {
        record.copy_field(*field, existing);
        record.locally_owned.insert(*field);
    }
}

fn merge_contributors(existing: &[Contributor], incoming: Vec<Contributor>) -> Vec<Contributor> {
    let mut merged: Vec<Contributor> = existing.to_vec();
    for c in incoming {
        match merged.iter_mut().find(|m| m.id == c.id) {
            Some(slot) => *slot = c,
            None => merged.push(c),
        }
    }
    merged
}

/// Fill the name from the repo id unless the local user cleared it, then fix the owner entry.
fn finish(record: &mut RepositoryRecord) {
    if record.name.is_empty() && !record.locally_owned.contains(&RecordField::Name) {
        record.name.clone_from(&record.repo_id);
    }
    record.enforce_owner();
}

/// An edit made by the local user to a stored record.
///
/// Every field that is `Some` becomes locally owned, including fields set to an empty value.
/// A cleared name stays empty instead of falling back to the repo id. Lists are trimmed and
/// deduplicated like lists from the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEdit {
    /// New display name.
    pub name: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New endpoint URIs.
    pub endpoints: Option<Vec<String>>,
    /// New advertised sources.
    pub sources: Option<Vec<String>>,
    /// New topics.
    pub topics: Option<Vec<String>>,
}

impl LocalEdit {
    /// The fields this edit sets.
    pub fn fields(&self) -> BTreeSet<RecordField> {
        let mut fields = BTreeSet::new();
        if self.name.is_some() {
            fields.insert(RecordField::Name);
        }
        if self.description.is_some() {
            fields.insert(RecordField::Description);
        }
        if self.endpoints.is_some() {
            fields.insert(RecordField::Endpoints);
        }
        if self.sources.is_some() {
            fields.insert(RecordField::Sources);
        }
        if self.topics.is_some() {
            fields.insert(RecordField::Topics);
        }
        fields
    }

    /// Whether the edit sets nothing.
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// The freeform record from the local actor that carries this edit on top of `existing`.
    ///
    /// The version marker of `existing` is kept, so an edit never looks newer than the network
    /// state it was made against.
    pub fn to_record(&self, existing: &RepositoryRecord) -> NormalizedRecord {
        let mut record = existing.clone();
        if let Some(name) = &self.name {
            record.name = name.trim().to_string();
        }
        if let Some(description) = &self.description {
            record.description = description.trim().to_string();
        }
        if let Some(endpoints) = &self.endpoints {
            record.endpoints = dedup(endpoints.iter().map(String::as_str));
        }
        if let Some(sources) = &self.sources {
            record.sources = dedup(sources.iter().map(String::as_str));
        }
        if let Some(topics) = &self.topics {
            record.topics = dedup(topics.iter().map(String::as_str));
        }
        record.locally_owned = self.fields();
        NormalizedRecord {
            record,
            shape: ShapeKind::Freeform,
            origin: Origin::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::{
        incoming::IncomingRecord,
        normalize::normalize,
        record::{tests::owner, Role},
        sources::SourceUri,
        validate::validate,
    };

    fn remote() -> Origin {
        Origin::Remote("wss://relay.example".parse::<SourceUri>().unwrap())
    }

    fn replaceable(record_id: &str, ts: i64, tags: &[[&str; 2]]) -> NormalizedRecord {
        let mut raw = IncomingRecord::replaceable(owner(1).to_hex(), record_id, ts, vec![])
            .with_tag(["d", "demo"]);
        for tag in tags {
            raw = raw.with_tag(*tag);
        }
        let key = validate(&raw).unwrap();
        normalize(&raw, key, remote()).unwrap()
    }

    fn freeform(record_id: &str, ts: i64, payload: serde_json::Value) -> NormalizedRecord {
        let raw = IncomingRecord::freeform(owner(1).to_hex(), record_id, ts, payload);
        let key = validate(&raw).unwrap();
        normalize(&raw, key, remote()).unwrap()
    }

    fn apply(stored: &mut Option<RepositoryRecord>, incoming: NormalizedRecord) -> MergeResult {
        let merged = merge(stored.as_ref(), incoming)?;
        *stored = Some(merged.clone());
        Ok(merged)
    }

    #[test]
    fn first_record_is_stored() {
        let r = merge(None, replaceable("a", 100, &[])).unwrap();
        assert_eq!(r.version.record_id, "a");
        assert!(r.owner_invariant_holds());
    }

    #[test]
    fn stale_and_newer_replaceable() {
        let mut stored = None;
        apply(&mut stored, replaceable("a", 100, &[["description", "A"]])).unwrap();
        let locally = LocalEdit {
            name: Some("My name".into()),
            ..Default::default()
        };
        let edit = locally.to_record(stored.as_ref().unwrap());
        apply(&mut stored, edit).unwrap();

        let err = apply(&mut stored, replaceable("b", 90, &[])).unwrap_err();
        assert!(err.is_stale());
        // equal timestamps are stale too
        let err = apply(&mut stored, replaceable("a2", 100, &[])).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(stored.as_ref().unwrap().version.record_id, "a");

        let c = apply(&mut stored, replaceable("c", 150, &[["name", "Upstream"]])).unwrap();
        assert_eq!(c.version.record_id, "c");
        assert_eq!(c.version.timestamp, 150);
        // replaced, not merged
        assert_eq!(c.description, "");
        // locally owned field survives
        assert_eq!(c.name, "My name");
        assert!(c.locally_owned.contains(&RecordField::Name));
    }

    #[test]
    fn redelivery_is_idempotent() {
        let mut stored = None;
        apply(&mut stored, replaceable("a", 100, &[["t", "x"]])).unwrap();
        let before = stored.clone();
        assert!(apply(&mut stored, replaceable("a", 100, &[["t", "x"]])).is_err());
        assert_eq!(stored, before);

        let mut stored = None;
        let payload = json!({ "repo": "demo", "description": "d" });
        apply(&mut stored, freeform("f", 5, payload.clone())).unwrap();
        let before = stored.clone();
        apply(&mut stored, freeform("f", 5, payload)).unwrap();
        assert_eq!(stored, before);
    }

    #[test]
    fn freeform_merges_fields() {
        let mut stored = None;
        apply(
            &mut stored,
            freeform(
                "f1",
                10,
                json!({ "repo": "demo", "description": "first", "topics": ["a"] }),
            ),
        )
        .unwrap();
        let r = apply(
            &mut stored,
            freeform("f2", 3, json!({ "repo": "demo", "name": "Demo" })),
        )
        .unwrap();
        assert_eq!(r.name, "Demo");
        assert_eq!(r.description, "first");
        assert_eq!(r.topics, vec!["a"]);
        assert_eq!(r.version.record_id, "f2");
        // never goes back in time
        assert_eq!(r.version.timestamp, 10);
    }

    #[test]
    fn local_edit_can_clear_a_field() {
        let mut stored = None;
        apply(
            &mut stored,
            freeform("f1", 1, json!({ "repo": "demo", "description": "x" })),
        )
        .unwrap();
        let edit = LocalEdit {
            description: Some(String::new()),
            ..Default::default()
        };
        let edit = edit.to_record(stored.as_ref().unwrap());
        let r = apply(&mut stored, edit).unwrap();
        assert_eq!(r.description, "");
        assert!(r.locally_owned.contains(&RecordField::Description));

        // a remote freeform record does not bring it back
        let r = apply(
            &mut stored,
            freeform("f2", 2, json!({ "repo": "demo", "description": "again" })),
        )
        .unwrap();
        assert_eq!(r.description, "");
    }

    #[test]
    fn local_edit_can_clear_the_name() {
        let mut stored = None;
        let r = apply(&mut stored, replaceable("a", 1, &[])).unwrap();
        assert_eq!(r.name, "demo");
        let edit = LocalEdit {
            name: Some(" ".into()),
            ..Default::default()
        };
        let edit = edit.to_record(stored.as_ref().unwrap());
        let r = apply(&mut stored, edit).unwrap();
        assert_eq!(r.name, "");
        assert!(r.locally_owned.contains(&RecordField::Name));

        let r = apply(&mut stored, replaceable("b", 2, &[["name", "Upstream"]])).unwrap();
        assert_eq!(r.name, "");
    }

    #[test]
    fn local_edit_lists_are_normalized() {
        let mut stored = None;
        apply(&mut stored, replaceable("a", 1, &[])).unwrap();
        let edit = LocalEdit {
            endpoints: Some(vec![
                " https://a.example/r.git ".into(),
                "https://a.example/r.git".into(),
            ]),
            sources: Some(vec!["wss://r.example".into(), "".into(), "wss://r.example".into()]),
            topics: Some(vec!["rust".into(), " rust".into(), "sync".into()]),
            ..Default::default()
        };
        let edit = edit.to_record(stored.as_ref().unwrap());
        let r = apply(&mut stored, edit).unwrap();
        assert_eq!(r.endpoints, vec!["https://a.example/r.git"]);
        assert_eq!(r.sources, vec!["wss://r.example"]);
        assert_eq!(r.topics, vec!["rust", "sync"]);
    }

    #[test]
    fn contributors_merge_per_identity() {
        let mut stored = None;
        let p2 = owner(2).to_hex();
        let p3 = owner(3).to_hex();
        apply(
            &mut stored,
            freeform(
                "f1",
                1,
                json!({ "repo": "demo", "contributors": [
                    { "owner": p2, "weight": 10 },
                    { "owner": p3, "weight": 20 },
                ]}),
            ),
        )
        .unwrap();
        let r = apply(
            &mut stored,
            freeform(
                "f2",
                2,
                json!({ "repo": "demo", "contributors": [
                    { "owner": p3, "weight": 30, "role": "maintainer" },
                    { "owner": owner(1).to_hex(), "weight": 0 },
                ]}),
            ),
        )
        .unwrap();
        assert!(r.owner_invariant_holds());
        assert_eq!(r.contributors.len(), 3);
        assert_eq!(r.contributors[0], Contributor::owner(owner(1)));
        assert_eq!(r.contributors[1].weight, 10);
        assert_eq!(r.contributors[2].weight, 30);
        assert_eq!(r.contributors[2].role, Role::Maintainer);
    }

    #[test]
    fn tombstone_survives_only_its_record() {
        let mut stored = None;
        apply(&mut stored, replaceable("a", 1, &[])).unwrap();
        let s = stored.as_mut().unwrap();
        s.removed = true;
        s.removed_by = Some("a".into());

        let edit = LocalEdit {
            name: Some("n".into()),
            ..Default::default()
        };
        let edit = edit.to_record(stored.as_ref().unwrap());
        let r = apply(&mut stored, edit).unwrap();
        assert!(r.removed);

        let r = apply(&mut stored, replaceable("b", 2, &[])).unwrap();
        assert!(!r.removed);
        assert_eq!(r.removed_by, None);
    }

    proptest! {
        #[test]
        fn replaceable_is_monotonic(timestamps in prop::collection::vec(0i64..50, 1..20)) {
            let mut stored: Option<RepositoryRecord> = None;
            let mut last = i64::MIN;
            for (i, ts) in timestamps.into_iter().enumerate() {
                let _ = apply(&mut stored, replaceable(&format!("r{i}"), ts, &[]));
                let current = stored.as_ref().unwrap().version.timestamp;
                prop_assert!(current >= last);
                last = current;
                prop_assert!(stored.as_ref().unwrap().owner_invariant_holds());
            }
        }
    }
}
