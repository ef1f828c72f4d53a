//! Errors produced while ingesting records and managing sources.

use repodir_base::KeyParsingError;

use crate::sources::SourceUri;

/// Why an incoming record was not stored.
///
/// All variants are terminal for the one record only. [`IngestError::StaleRecord`] is an expected
/// outcome of redelivery and out of order arrival, the others mark input that can never be
/// stored.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The author identity is missing or does not decode to a raw key.
    #[error("invalid identity {identity:?}")]
    InvalidIdentity {
        /// The identity as received.
        identity: String,
        /// Decoding failure, if the identity was present.
        #[source]
        source: Option<KeyParsingError>,
    },
    /// The record could not be read.
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    /// The record contradicts itself.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    /// A replaceable record that is not newer than the stored one.
    #[error("stale record: timestamp {incoming} is not newer than {stored}")]
    StaleRecord {
        /// Timestamp of the incoming record.
        incoming: i64,
        /// Timestamp of the stored record.
        stored: i64,
    },
}

impl IngestError {
    pub(crate) fn invalid_identity(identity: &str, source: Option<KeyParsingError>) -> Self {
        Self::InvalidIdentity {
            identity: identity.to_string(),
            source,
        }
    }

    /// Whether this is the expected stale outcome rather than bad input.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRecord { .. })
    }
}

/// A source could not be reached or dropped the subscription.
#[derive(Debug, Clone, thiserror::Error)]
#[error("source unavailable: {reason}")]
pub struct SourceUnavailable {
    /// Human readable cause.
    pub reason: String,
}

impl SourceUnavailable {
    /// Create a new error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Auto-discovery of a source was refused by one of the protective limits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryBoundExceeded {
    /// The discovery chain would be too long.
    #[error("{uri} is {hops} hops from a configured source, limit is {max}")]
    Hops {
        /// The refused source.
        uri: SourceUri,
        /// Chain length it would have had.
        hops: usize,
        /// Configured limit.
        max: usize,
    },
    /// The source set is full.
    #[error("cannot add {uri}: already tracking {max} sources")]
    Capacity {
        /// The refused source.
        uri: SourceUri,
        /// Configured limit.
        max: usize,
    },
    /// The source was advertised by a record from a source that is not tracked, so its chain
    /// has no configured root.
    #[error("cannot add {uri}: advertised by untracked source {from}")]
    UntrackedParent {
        /// The refused source.
        uri: SourceUri,
        /// The source the advertising record came from.
        from: SourceUri,
    },
}
