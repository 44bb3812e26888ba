//! Core types and rules shared by the cadvault engine and its front ends.
//!
//! This crate holds everything that does not touch the repository:
//! - `VaultError`: the error taxonomy and its response categories
//! - Data model: file, lock, revision metadata and commit event records
//! - `next_revision`: the revision numbering policy
//! - `convention`: the commit-message contract the activity feed is parsed from
//! - `Notification`: payloads pushed to observers

pub mod convention;
mod error;
mod model;
mod notify;
mod revision;

pub use convention::{CommitSubject, OperationKind};
pub use error::{ErrorCategory, VaultError};
pub use model::{
    group_key, group_files, CommitEvent, FileGroup, FileRecord, Identity, LockRecord,
    LockSummary, RevisionMetadata, UserMessage,
};
pub use notify::Notification;
pub use revision::{next_revision, Revision, RevisionClass};
