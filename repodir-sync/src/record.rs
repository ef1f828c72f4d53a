//! The materialized repository record and its directory key.

use std::{collections::BTreeSet, fmt, str::FromStr};

use anyhow::Context;
use repodir_base::OwnerId;
use serde::{Deserialize, Serialize};

/// A repository identifier in normalized form.
///
/// Normalization lower-cases the identifier and collapses every run of separators (`-`, `_`
/// and whitespace) into a single `-`, dropping separators at either end. Superficially
/// different spellings of the same identifier (`My__Repo`, `my-repo`) therefore compare equal.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(from = "String", into = "String")]
pub struct RepoId(String);

impl RepoId {
    /// Normalize a raw identifier. Returns `None` if nothing is left after normalization.
    pub fn new(raw: &str) -> Option<Self> {
        let id = normalize_repo_id(raw);
        (!id.is_empty()).then_some(Self(id))
    }

    /// The normalized identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RepoId {
    fn from(value: String) -> Self {
        Self(normalize_repo_id(&value))
    }
}

impl From<RepoId> for String {
    fn from(value: RepoId) -> Self {
        value.0
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({:?})", self.0)
    }
}

fn normalize_repo_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut separator = false;
    for c in raw.chars() {
        if c == '-' || c == '_' || c.is_whitespace() {
            separator = true;
            continue;
        }
        if separator && !out.is_empty() {
            out.push('-');
        }
        separator = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// Identifies one logical repository: `(canonical owner, normalized repo id)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirectoryKey {
    owner: OwnerId,
    repo: RepoId,
}

impl DirectoryKey {
    /// Create a new key.
    pub fn new(owner: OwnerId, repo: RepoId) -> Self {
        Self { owner, repo }
    }

    /// The canonical owner.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The normalized repository id.
    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// The string under which the record is kept in the store: `<hex owner>:<repo id>`.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}", self.owner.to_hex(), self.repo)
    }

    /// Parse a key produced by [`Self::to_storage_key`].
    pub fn from_storage_key(s: &str) -> anyhow::Result<Self> {
        let (owner, repo) = s.split_once(':').context("missing separator")?;
        let owner = OwnerId::from_str(owner)?;
        let repo = RepoId::new(repo).context("empty repo id")?;
        Ok(Self { owner, repo })
    }

    /// Format for logging.
    pub fn fmt_short(&self) -> String {
        format!("{}/{}", self.owner.fmt_short(), self.repo)
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

impl fmt::Debug for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryKey({})", self.fmt_short())
    }
}

/// The `(record id, logical timestamp)` pair of the record a stored state came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    /// Id of the incoming record.
    pub record_id: String,
    /// Logical timestamp, never decreasing per key.
    pub timestamp: i64,
}

/// Role of a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The owner of the repository. Exactly one per record.
    Owner,
    /// A maintainer.
    Maintainer,
    /// Any other contributor.
    Contributor,
    /// A role this crate does not know about.
    Other(String),
}

impl Role {
    /// Parse a role tag. Unknown tags are kept verbatim.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Role::Owner,
            "maintainer" => Role::Maintainer,
            "" | "contributor" => Role::Contributor,
            _ => Role::Other(s.trim().to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Maintainer => write!(f, "maintainer"),
            Role::Contributor => write!(f, "contributor"),
            Role::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Weight the owner entry always carries.
pub const OWNER_WEIGHT: u8 = 100;

/// A contributor entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    /// Canonical identity.
    pub id: OwnerId,
    /// Weight in `0..=100`.
    pub weight: u8,
    /// Role tag.
    pub role: Role,
}

impl Contributor {
    /// The entry every record carries for its owner.
    pub fn owner(id: OwnerId) -> Self {
        Self {
            id,
            weight: OWNER_WEIGHT,
            role: Role::Owner,
        }
    }

    fn is_owner_entry(&self) -> bool {
        self.weight == OWNER_WEIGHT && self.role == Role::Owner
    }
}

/// Fields a local user can take ownership of.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum RecordField {
    /// Display name.
    Name,
    /// Free text description.
    Description,
    /// Endpoint URIs.
    Endpoints,
    /// Advertised source URIs.
    Sources,
    /// Topic tags.
    Topics,
}

/// The materialized repository entity kept in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Directory key.
    pub key: DirectoryKey,
    /// The repository id as spelled by the record that produced this state.
    pub repo_id: String,
    /// Display name.
    pub name: String,
    /// Free text description.
    pub description: String,
    /// Ordered endpoint URIs to fetch content from.
    pub endpoints: Vec<String>,
    /// Further sources advertised by the owner.
    pub sources: Vec<String>,
    /// Topic tags.
    pub topics: Vec<String>,
    /// Contributors; the owner entry comes first.
    pub contributors: Vec<Contributor>,
    /// Version of the record that produced this state.
    pub version: VersionMarker,
    /// Set when a tombstone was applied.
    pub removed: bool,
    /// The record id the applied tombstone referenced.
    pub removed_by: Option<String>,
    /// Fields set by the local user.
    pub locally_owned: BTreeSet<RecordField>,
}

impl RepositoryRecord {
    /// The canonical owner.
    pub fn owner(&self) -> OwnerId {
        self.key.owner()
    }

    /// Whether `field` holds no value.
    pub fn is_empty(&self, field: RecordField) -> bool {
        match field {
            RecordField::Name => self.name.is_empty(),
            RecordField::Description => self.description.is_empty(),
            RecordField::Endpoints => self.endpoints.is_empty(),
            RecordField::Sources => self.sources.is_empty(),
            RecordField::Topics => self.topics.is_empty(),
        }
    }

    /// Overwrite `field` with the value `other` holds.
    pub fn copy_field(&mut self, field: RecordField, other: &RepositoryRecord) {
        match field {
            RecordField::Name => self.name.clone_from(&other.name),
            RecordField::Description => self.description.clone_from(&other.description),
            RecordField::Endpoints => self.endpoints.clone_from(&other.endpoints),
            RecordField::Sources => self.sources.clone_from(&other.sources),
            RecordField::Topics => self.topics.clone_from(&other.topics),
        }
    }

    /// Restore the owner invariant: exactly one contributor with weight 100 and role
    /// [`Role::Owner`], whose identity is the record's owner.
    ///
    /// The owner entry is moved to the front, other entries claiming ownership are demoted to
    /// [`Role::Maintainer`] and duplicate identities are collapsed, keeping the first one.
    pub fn enforce_owner(&mut self) {
        let owner = self.owner();
        let mut seen = BTreeSet::from([owner]);
        let mut contributors = Vec::with_capacity(self.contributors.len() + 1);
        contributors.push(Contributor::owner(owner));
        for mut c in self.contributors.drain(..) {
            if !seen.insert(c.id) {
                continue;
            }
            if c.role == Role::Owner {
                c.role = Role::Maintainer;
            }
            contributors.push(c);
        }
        self.contributors = contributors;
    }

    /// Whether the owner invariant holds.
    pub fn owner_invariant_holds(&self) -> bool {
        let owners: Vec<_> = self
            .contributors
            .iter()
            .filter(|c| c.is_owner_entry())
            .collect();
        owners.len() == 1 && owners[0].id == self.owner()
    }
}
