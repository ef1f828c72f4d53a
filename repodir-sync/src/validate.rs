//! Structural checks run before a record can touch the store.

use repodir_base::canonicalize;

use crate::{
    error::IngestError,
    incoming::IncomingRecord,
    record::{DirectoryKey, RepoId},
};

/// Validate an incoming record and resolve the directory key it targets.
///
/// The owner is always the canonicalized author. An owner identity embedded in the record's
/// content is only checked against it: if it does not decode, or decodes to a different key,
/// the whole record is corrupt.
pub fn validate(record: &IncomingRecord) -> Result<DirectoryKey, IngestError> {
    if record.record_id.trim().is_empty() {
        return Err(IngestError::MalformedRecord("missing record id".into()));
    }
    let repo = record
        .shape
        .raw_repo_id()?
        .and_then(RepoId::new)
        .ok_or_else(|| IngestError::MalformedRecord("missing repo identifier".into()))?;

    if record.author.trim().is_empty() {
        return Err(IngestError::invalid_identity(&record.author, None));
    }
    let owner = canonicalize(&record.author)
        .map_err(|err| IngestError::invalid_identity(&record.author, Some(err)))?;

    if let Some(embedded) = record.shape.embedded_owner()? {
        let embedded = canonicalize(embedded).map_err(|err| {
            IngestError::CorruptRecord(format!("embedded owner {embedded:?} is invalid: {err}"))
        })?;
        if embedded != owner {
            return Err(IngestError::CorruptRecord(format!(
                "embedded owner {} does not match author {}",
                embedded.fmt_short(),
                owner.fmt_short()
            )));
        }
    }

    Ok(DirectoryKey::new(owner, repo))
}
