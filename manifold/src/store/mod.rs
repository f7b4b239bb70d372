//! Storage contracts of the engine, and the in-memory backend used for
//! testing and embedded deployments.
//!
//! Backends implement [DataStore] for the chunked append log,
//! [DocumentStore] for the ETag-guarded manifest, and [TagStore] for the
//! inverse tag indexes. The remaining contracts ([crate::snapshot::SnapshotStore],
//! [crate::backup::BackupStore], [crate::lock::LockProvider],
//! [crate::projection::StatusStore]) live next to their components.

mod data;
mod document;
pub mod memory;
mod tag;

pub use data::{DataStore, DataStoreError};
pub use document::{DocumentStore, DocumentStoreError};
pub use tag::{TagScope, TagStore, TagStoreError};
