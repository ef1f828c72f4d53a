//! Base types and utilities for repodir
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod key;

pub use key::{canonicalize, KeyParsingError, OwnerId};
