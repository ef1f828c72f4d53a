//! Conversion of both incoming shapes into one [`RepositoryRecord`].

use std::collections::{BTreeSet, HashSet};

use repodir_base::canonicalize;
use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::debug;

use crate::{
    error::IngestError,
    incoming::{
        IncomingRecord, Origin, RawContributor, RecordShape, ShapeKind, TAG_CONTRIBUTOR,
        TAG_DESCRIPTION, TAG_ENDPOINTS, TAG_NAME, TAG_SOURCES, TAG_TOPIC,
    },
    record::{Contributor, DirectoryKey, RecordField, RepositoryRecord, Role, VersionMarker},
};

/// A normalized record together with what the merge needs to know about where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    /// The record.
    pub record: RepositoryRecord,
    /// Shape of the incoming record.
    pub shape: ShapeKind,
    /// Origin of the incoming record.
    pub origin: Origin,
}

/// Normalize a record that passed [`validate`](crate::validate::validate) into the key it
/// resolved to.
///
/// Out of band list fields take precedence over the record's own. Contributors that do not
/// canonicalize, or carry a weight outside `0..=100`, are dropped one by one. A record produced
/// by the local actor owns every field it sets.
pub fn normalize(
    raw: &IncomingRecord,
    key: DirectoryKey,
    origin: Origin,
) -> Result<NormalizedRecord, IngestError> {
    let shape = &raw.shape;
    let repo_id = shape
        .raw_repo_id()?
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| key.repo().to_string());

    let mut name = text_field(shape, "name", TAG_NAME)?;
    if name.is_empty() && shape.kind() == ShapeKind::Replaceable {
        name.clone_from(&repo_id);
    }
    let description = text_field(shape, "description", TAG_DESCRIPTION)?;

    let endpoints = match &raw.lists.endpoints {
        Some(list) => dedup(list.iter().map(String::as_str)),
        None => list_field(shape, "clone", TAG_ENDPOINTS)?,
    };
    let sources = match &raw.lists.sources {
        Some(list) => dedup(list.iter().map(String::as_str)),
        None => list_field(shape, "relays", TAG_SOURCES)?,
    };
    let topics = match &raw.lists.topics {
        Some(list) => dedup(list.iter().map(String::as_str)),
        None => list_field(shape, "topics", TAG_TOPIC)?,
    };
    let contributors = match &raw.lists.contributors {
        Some(list) => list.clone(),
        None => shape_contributors(shape)?,
    };
    let contributors = contributors.iter().filter_map(resolve_contributor).collect();

    let mut record = RepositoryRecord {
        key,
        repo_id,
        name,
        description,
        endpoints,
        sources,
        topics,
        contributors,
        version: VersionMarker {
            record_id: raw.record_id.clone(),
            timestamp: raw.timestamp,
        },
        removed: false,
        removed_by: None,
        locally_owned: BTreeSet::new(),
    };
    if origin.is_local() {
        record.locally_owned = RecordField::iter()
            .filter(|field| !record.is_empty(*field))
            .collect();
    }
    record.enforce_owner();

    Ok(NormalizedRecord {
        record,
        shape: shape.kind(),
        origin,
    })
}

/// A scalar text field: the payload key for freeform records, falling back to the tag.
fn text_field(shape: &RecordShape, key: &str, tag: &str) -> Result<String, IngestError> {
    let value = shape
        .payload_str(key)?
        .or_else(|| shape.tag_value(tag))
        .unwrap_or_default();
    Ok(value.trim().to_string())
}

/// A list field: the payload key for freeform records, falling back to the tags.
///
/// A payload value may be a single string or an array of strings.
fn list_field(shape: &RecordShape, key: &str, tag: &str) -> Result<Vec<String>, IngestError> {
    let from_payload = match shape.payload()?.and_then(|p| p.get(key)) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(vec![s.as_str()]),
        Some(Value::Array(items)) => Some(items.iter().filter_map(Value::as_str).collect()),
        Some(_) => {
            return Err(IngestError::MalformedRecord(format!(
                "payload field {key:?} is not a list"
            )))
        }
    };
    Ok(match from_payload {
        Some(items) => dedup(items),
        None => dedup(shape.tag_values(tag)),
    })
}

fn shape_contributors(shape: &RecordShape) -> Result<Vec<RawContributor>, IngestError> {
    if let Some(items) = shape.payload()?.and_then(|p| p.get("contributors")) {
        let Value::Array(items) = items else {
            return Err(IngestError::MalformedRecord(
                "payload field \"contributors\" is not a list".into(),
            ));
        };
        return Ok(items.iter().filter_map(payload_contributor).collect());
    }
    let from_tags = shape
        .tags_named(TAG_CONTRIBUTOR)
        .filter_map(|tag| {
            let identity = tag.get(1)?;
            // an unparseable weight is kept as out of range so the entry is dropped later
            let weight = tag
                .get(2)
                .filter(|w| !w.is_empty())
                .map(|w| w.trim().parse::<i64>().unwrap_or(-1));
            Some(RawContributor::new(
                identity.as_str(),
                weight,
                tag.get(3).map(String::as_str),
            ))
        })
        .collect();
    Ok(from_tags)
}

fn payload_contributor(value: &Value) -> Option<RawContributor> {
    let Some(identity) = value.get("owner").and_then(Value::as_str) else {
        debug!(?value, "dropping contributor without identity");
        return None;
    };
    let weight = match value.get("weight") {
        None | Some(Value::Null) => None,
        Some(w) => Some(w.as_i64().unwrap_or(-1)),
    };
    let role = value.get("role").and_then(Value::as_str);
    Some(RawContributor::new(identity, weight, role))
}

fn resolve_contributor(raw: &RawContributor) -> Option<Contributor> {
    let id = match canonicalize(&raw.identity) {
        Ok(id) => id,
        Err(err) => {
            debug!(identity = %raw.identity, %err, "dropping contributor with invalid identity");
            return None;
        }
    };
    let weight = match raw.weight {
        None => 0,
        Some(w) => match u8::try_from(w) {
            Ok(w) if w <= 100 => w,
            _ => {
                debug!(
                    identity = %raw.identity,
                    weight = w,
                    "dropping contributor with invalid weight"
                );
                return None;
            }
        },
    };
    let role = Role::parse(raw.role.as_deref().unwrap_or_default());
    Some(Contributor { id, weight, role })
}

pub(crate) fn dedup<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && seen.insert(*s))
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        incoming::ListFields,
        record::{tests::owner, OWNER_WEIGHT},
        validate::validate,
    };

    fn run(raw: &IncomingRecord) -> RepositoryRecord {
        let key = validate(raw).unwrap();
        normalize(raw, key, Origin::Local).unwrap().record
    }

    #[test]
    fn replaceable_fields() {
        let me = owner(1);
        let raw = IncomingRecord::replaceable(me.to_hex(), "e1", 10, vec![])
            .with_tag(["d", "Demo_App"])
            .with_tag(["description", " a demo "])
            .with_tag(["clone", "https://a", "https://b"])
            .with_tag(["clone", "https://a"])
            .with_tag(["relays", "wss://r1"])
            .with_tag(["t", "rust"])
            .with_tag(["t", "git"])
            .with_tag(["p", owner(2).to_npub().as_str(), "50", "maintainer"])
            .with_tag(["p", "garbage", "50"])
            .with_tag(["p", owner(3).to_hex().as_str(), "500"]);
        let r = run(&raw);
        assert_eq!(r.key.repo().as_str(), "demo-app");
        assert_eq!(r.repo_id, "Demo_App");
        // name falls back to the repo id
        assert_eq!(r.name, "Demo_App");
        assert_eq!(r.description, "a demo");
        assert_eq!(r.endpoints, vec!["https://a", "https://b"]);
        assert_eq!(r.sources, vec!["wss://r1"]);
        assert_eq!(r.topics, vec!["rust", "git"]);
        assert_eq!(
            r.contributors,
            vec![
                Contributor::owner(me),
                Contributor {
                    id: owner(2),
                    weight: 50,
                    role: Role::Maintainer
                }
            ]
        );
        assert_eq!(
            r.version,
            VersionMarker {
                record_id: "e1".into(),
                timestamp: 10
            }
        );
        assert!(r.owner_invariant_holds());
    }

    #[test]
    fn freeform_fields_and_tag_fallback() {
        let me = owner(1);
        let raw = IncomingRecord::freeform(
            me.to_hex(),
            "e1",
            3,
            json!({
                "repo": "demo",
                "description": "from payload",
                "clone": "https://only",
                "contributors": [
                    { "owner": owner(2).to_hex(), "weight": 10 },
                    { "owner": owner(3).to_hex(), "weight": 7.5 },
                    { "weight": 1 },
                    { "owner": me.to_hex(), "weight": 3, "role": "contributor" },
                ],
            }),
        )
        .with_tag(["description", "from tag"])
        .with_tag(["t", "tagged"]);
        let r = run(&raw);
        assert_eq!(r.name, "");
        assert_eq!(r.description, "from payload");
        assert_eq!(r.endpoints, vec!["https://only"]);
        assert_eq!(r.topics, vec!["tagged"]);
        assert_eq!(r.contributors.len(), 2);
        assert_eq!(r.contributors[0].weight, OWNER_WEIGHT);
        assert_eq!(r.contributors[1].id, owner(2));
        assert_eq!(r.contributors[1].role, Role::Contributor);
    }

    #[test]
    fn out_of_band_lists_take_precedence() {
        let raw = IncomingRecord::freeform(
            owner(1).to_hex(),
            "e1",
            3,
            json!({ "repo": "demo", "topics": ["inline"], "relays": ["wss://inline"] }),
        )
        .with_lists(ListFields {
            topics: Some(vec!["oob".into(), "oob".into()]),
            contributors: Some(vec![RawContributor::new(owner(4).to_npub(), None, None)]),
            ..Default::default()
        });
        let r = run(&raw);
        assert_eq!(r.topics, vec!["oob"]);
        assert_eq!(r.sources, vec!["wss://inline"]);
        assert_eq!(r.contributors[1].id, owner(4));
        assert_eq!(r.contributors[1].weight, 0);
    }

    #[test]
    fn local_origin_owns_set_fields() {
        let raw = IncomingRecord::replaceable(owner(1).to_hex(), "e1", 1, vec![])
            .with_tag(["d", "demo"])
            .with_tag(["t", "x"]);
        let r = run(&raw);
        assert_eq!(
            r.locally_owned,
            BTreeSet::from([RecordField::Name, RecordField::Topics])
        );

        let key = validate(&raw).unwrap();
        let uri: crate::sources::SourceUri = "wss://relay.example".parse().unwrap();
        let remote = normalize(&raw, key, Origin::Remote(uri)).unwrap();
        assert!(remote.record.locally_owned.is_empty());
    }

    #[test]
    fn malformed_list_field() {
        let raw = IncomingRecord::freeform(
            owner(1).to_hex(),
            "e1",
            1,
            json!({ "repo": "demo", "topics": { "a": 1 } }),
        );
        let key = validate(&raw).unwrap();
        assert!(matches!(
            normalize(&raw, key, Origin::Local),
            Err(IngestError::MalformedRecord(_))
        ));
    }
}
