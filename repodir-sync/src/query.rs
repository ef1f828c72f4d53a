//! Listing of directory records.

use std::collections::{btree_map, BTreeMap};

use repodir_base::OwnerId;
use serde::{Deserialize, Serialize};

use crate::{
    merge::{carry_locally_owned, supersedes},
    record::{DirectoryKey, RepositoryRecord},
};

/// Which records [`list`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Only records of this owner.
    pub owner: Option<OwnerId>,
    /// Only records whose name, description, repository id or topics contain this text,
    /// ignoring case.
    pub text: Option<String>,
    /// Include removed records.
    pub include_removed: bool,
}

impl ListFilter {
    /// Filter by owner.
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Filter by text.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Include removed records.
    pub fn include_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }

    fn matches(&self, record: &RepositoryRecord) -> bool {
        if record.removed && !self.include_removed {
            return false;
        }
        if let Some(owner) = self.owner {
            if record.owner() != owner {
                return false;
            }
        }
        match self.text.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(text) => {
                let needle = text.to_lowercase();
                let contains = |s: &str| s.to_lowercase().contains(&needle);
                contains(&record.name)
                    || contains(&record.description)
                    || contains(&record.repo_id)
                    || contains(record.key.repo().as_str())
                    || record.topics.iter().any(|t| contains(t))
            }
        }
    }
}

/// Deduplicate `records` by key and return the ones matching `filter`, in key order.
///
/// The store holds one record per key, so duplicates only show up if something went wrong
/// below. They are resolved with the precedence the merge engine uses: the newer version wins
/// and locally owned fields of the loser are kept.
pub fn list(
    records: impl IntoIterator<Item = RepositoryRecord>,
    filter: &ListFilter,
) -> Vec<RepositoryRecord> {
    let mut by_key: BTreeMap<DirectoryKey, RepositoryRecord> = BTreeMap::new();
    for record in records {
        match by_key.entry(record.key.clone()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(record);
            }
            btree_map::Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if supersedes(&record, current) {
                    let mut record = record;
                    carry_locally_owned(current, &mut record);
                    *current = record;
                } else {
                    carry_locally_owned(&record, current);
                }
            }
        }
    }
    by_key
        .into_values()
        .filter(|record| filter.matches(record))
        .collect()
}
