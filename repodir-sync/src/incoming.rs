//! Records as they arrive from sources, before validation.
//!
//! An [`IncomingRecord`] is transient: it is validated, normalized into a
//! [`RepositoryRecord`](crate::record::RepositoryRecord) and then dropped. The two wire shapes
//! are modelled as the [`RecordShape`] variants so that the rest of the pipeline never has to
//! guess what it is looking at.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::IngestError, sources::SourceUri};

/// A tag: a name followed by its values, e.g. `["clone", "https://…", "https://…"]`.
pub type Tag = Vec<String>;

/// Tag carrying the repository identifier.
pub const TAG_REPO: &str = "d";
/// Tag carrying the display name.
pub const TAG_NAME: &str = "name";
/// Tag carrying the description.
pub const TAG_DESCRIPTION: &str = "description";
/// Tag carrying endpoint URIs.
pub const TAG_ENDPOINTS: &str = "clone";
/// Tag carrying advertised source URIs.
pub const TAG_SOURCES: &str = "relays";
/// Tag carrying one topic.
pub const TAG_TOPIC: &str = "t";
/// Tag carrying one contributor: `["p", identity, weight?, role?]`.
pub const TAG_CONTRIBUTOR: &str = "p";
/// Tag carrying a payload-embedded owner identity.
pub const TAG_OWNER: &str = "owner";

/// Which of the two shapes a record had.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShapeKind {
    /// Unversioned, merged field by field.
    Freeform,
    /// Versioned, a newer one replaces an older one.
    Replaceable,
}

/// The shape-specific content of an incoming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordShape {
    /// A structured payload plus a few descriptive tags.
    ///
    /// The payload is expected to be a JSON object with the optional keys `repo`, `name`,
    /// `description`, `clone`, `relays`, `topics`, `contributors` and `owner`.
    Freeform {
        /// The structured payload.
        payload: Value,
        /// Descriptive tags, consulted when the payload lacks a field.
        tags: Vec<Tag>,
    },
    /// A fixed set of tagged fields.
    Replaceable {
        /// The tags.
        tags: Vec<Tag>,
    },
}

impl RecordShape {
    /// The kind of this shape.
    pub fn kind(&self) -> ShapeKind {
        match self {
            RecordShape::Freeform { .. } => ShapeKind::Freeform,
            RecordShape::Replaceable { .. } => ShapeKind::Replaceable,
        }
    }

    /// All tags.
    pub fn tags(&self) -> &[Tag] {
        match self {
            RecordShape::Freeform { tags, .. } => tags,
            RecordShape::Replaceable { tags } => tags,
        }
    }

    /// The first value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags()
            .iter()
            .filter(|tag| tag.first().map(String::as_str) == Some(name))
            .find_map(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Every value of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags_named(name)
            .flat_map(|tag| tag.iter().skip(1))
            .map(String::as_str)
    }

    /// All tags named `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags()
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
    }

    /// The payload object of a freeform record.
    ///
    /// Returns `Ok(None)` for the replaceable shape and an error if a freeform payload is not an
    /// object.
    pub fn payload(&self) -> Result<Option<&Map<String, Value>>, IngestError> {
        match self {
            RecordShape::Replaceable { .. } => Ok(None),
            RecordShape::Freeform { payload, .. } => match payload.as_object() {
                Some(map) => Ok(Some(map)),
                None => Err(IngestError::MalformedRecord(
                    "freeform payload is not an object".into(),
                )),
            },
        }
    }

    /// A string field of the freeform payload. `null` counts as absent.
    pub fn payload_str(&self, key: &str) -> Result<Option<&str>, IngestError> {
        let Some(payload) = self.payload()? else {
            return Ok(None);
        };
        match payload.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(IngestError::MalformedRecord(format!(
                "payload field {key:?} is not a string"
            ))),
        }
    }

    /// The repository identifier as spelled by the record.
    pub fn raw_repo_id(&self) -> Result<Option<&str>, IngestError> {
        let from_payload = self.payload_str("repo")?;
        Ok(from_payload.or_else(|| self.tag_value(TAG_REPO)))
    }

    /// An owner identity embedded in the content, as opposed to the authorship field.
    pub fn embedded_owner(&self) -> Result<Option<&str>, IngestError> {
        let from_payload = self.payload_str("owner")?;
        Ok(from_payload.or_else(|| self.tag_value(TAG_OWNER)))
    }
}

/// A contributor entry as received, before its identity is canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContributor {
    /// Identity in either encoding.
    pub identity: String,
    /// Weight, expected in `0..=100`. Absent means 0.
    pub weight: Option<i64>,
    /// Role tag. Absent means `contributor`.
    pub role: Option<String>,
}

impl RawContributor {
    /// Create a new entry.
    pub fn new(identity: impl Into<String>, weight: Option<i64>, role: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            weight,
            role: role.map(ToString::to_string),
        }
    }
}

/// List fields delivered out of band, next to the record.
///
/// A field that is `Some` takes precedence over the equivalent field inside the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFields {
    /// Endpoint URIs.
    pub endpoints: Option<Vec<String>>,
    /// Source URIs.
    pub sources: Option<Vec<String>>,
    /// Topic tags.
    pub topics: Option<Vec<String>>,
    /// Contributor entries.
    pub contributors: Option<Vec<RawContributor>>,
}

/// A raw record delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingRecord {
    /// Shape-specific content.
    pub shape: RecordShape,
    /// Identity of the author, in either encoding.
    pub author: String,
    /// Logical timestamp.
    pub timestamp: i64,
    /// Id of this record. Tombstones refer to it.
    pub record_id: String,
    /// Out of band list fields.
    #[serde(default)]
    pub lists: ListFields,
}

impl IncomingRecord {
    /// A replaceable record.
    pub fn replaceable(
        author: impl Into<String>,
        record_id: impl Into<String>,
        timestamp: i64,
        tags: Vec<Tag>,
    ) -> Self {
        Self {
            shape: RecordShape::Replaceable { tags },
            author: author.into(),
            timestamp,
            record_id: record_id.into(),
            lists: ListFields::default(),
        }
    }

    /// A freeform record.
    pub fn freeform(
        author: impl Into<String>,
        record_id: impl Into<String>,
        timestamp: i64,
        payload: Value,
    ) -> Self {
        Self {
            shape: RecordShape::Freeform {
                payload,
                tags: Vec::new(),
            },
            author: author.into(),
            timestamp,
            record_id: record_id.into(),
            lists: ListFields::default(),
        }
    }

    /// Add a tag.
    pub fn with_tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tag = tag.into_iter().map(Into::into).collect();
        match &mut self.shape {
            RecordShape::Freeform { tags, .. } => tags.push(tag),
            RecordShape::Replaceable { tags } => tags.push(tag),
        }
        self
    }

    /// Set the out of band list fields.
    pub fn with_lists(mut self, lists: ListFields) -> Self {
        self.lists = lists;
        self
    }

    /// The kind of shape.
    pub fn kind(&self) -> ShapeKind {
        self.shape.kind()
    }
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Delivered by a source.
    Remote(SourceUri),
    /// Produced by the local user of this instance.
    Local,
}

impl Origin {
    /// Whether this is the local actor.
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }

    /// The source, for remote records.
    pub fn source(&self) -> Option<&SourceUri> {
        match self {
            Origin::Remote(uri) => Some(uri),
            Origin::Local => None,
        }
    }
}

/// A deletion marker naming the record it removes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TombstoneMarker {
    /// Id of the removed record.
    pub referenced_record_id: String,
}

impl TombstoneMarker {
    /// Create a marker for `record_id`.
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            referenced_record_id: record_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tag_lookup() {
        let r = IncomingRecord::replaceable("a", "e1", 1, vec![])
            .with_tag(["d", "demo"])
            .with_tag(["clone", "https://a", "https://b"])
            .with_tag(["clone", "https://c"])
            .with_tag(["t"]);
        assert_eq!(r.shape.tag_value("d"), Some("demo"));
        assert_eq!(r.shape.tag_value("t"), None);
        assert_eq!(
            r.shape.tag_values("clone").collect::<Vec<_>>(),
            vec!["https://a", "https://b", "https://c"]
        );
        assert_eq!(r.shape.raw_repo_id().unwrap(), Some("demo"));
    }

    #[test]
    fn payload_repo_wins_over_tag() {
        let r = IncomingRecord::freeform("a", "e1", 1, json!({ "repo": "from-payload" }))
            .with_tag(["d", "from-tag"]);
        assert_eq!(r.shape.raw_repo_id().unwrap(), Some("from-payload"));

        let r = IncomingRecord::freeform("a", "e1", 1, json!({ "repo": null }))
            .with_tag(["d", "from-tag"]);
        assert_eq!(r.shape.raw_repo_id().unwrap(), Some("from-tag"));
    }

    #[test]
    fn malformed_payloads() {
        let r = IncomingRecord::freeform("a", "e1", 1, json!(["not", "an", "object"]));
        assert!(matches!(
            r.shape.raw_repo_id(),
            Err(IngestError::MalformedRecord(_))
        ));
        let r = IncomingRecord::freeform("a", "e1", 1, json!({ "owner": 7 }));
        assert!(matches!(
            r.shape.embedded_owner(),
            Err(IngestError::MalformedRecord(_))
        ));
    }

    #[test]
    fn json_shape() {
        let r = IncomingRecord::replaceable("a", "e1", 5, vec![vec!["d".into(), "x".into()]]);
        let json = serde_json::to_string(&r).unwrap();
        let back: IncomingRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.kind(), ShapeKind::Replaceable);
    }
}
