//! Synchronization and reconciliation of a repository directory gathered from many untrusted
//! sources.
//!
//! Records arrive from sources through an [`Engine`], are checked by [`validate`], brought into
//! canonical form by [`normalize`] and merged into the [`store`] by the [`merge`] engine.
//! Deletions go through [`tombstone`]. The [`sources`] module bounds auto-discovery of further
//! sources and decides when the directory has settled.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod incoming;
pub mod merge;
pub mod normalize;
pub mod query;
pub mod record;
pub mod sources;
pub mod store;
pub mod tombstone;
pub mod validate;

pub use self::config::SyncConfig;
pub use self::directory::IngestOutcome;
pub use self::engine::{Engine, Event, SourceClient, SourceMessage, SubscriptionRequest};
pub use self::error::{DiscoveryBoundExceeded, IngestError, SourceUnavailable};
pub use self::incoming::{IncomingRecord, Origin, RecordShape, TombstoneMarker};
pub use self::merge::LocalEdit;
pub use self::query::ListFilter;
pub use self::record::{DirectoryKey, RepoId, RepositoryRecord};
pub use self::sources::SourceUri;
pub use self::store::{DirectoryStore, Store};
