//! Filesystem blob backend for the `manifold` event-sourcing engine.
//!
//! Lays objects out the way a blob container would: one JSON blob per
//! manifest, chunked event blobs per stream, inverse tag indexes,
//! snapshots, backup artifacts with a shared registry, lease files and
//! projection-status documents. Writes are atomic (temp file + rename)
//! and conditional (content-hash ETags), so the engine's optimistic
//! concurrency holds on plain disks too.
//!
//! The backend assumes a single process per container root; within the
//! process, writers of any concurrency are fenced by the ETag checks.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod container;

mod backup;
mod data;
mod document;
mod lock;
mod snapshot;
mod status;
mod tag;

use std::path::PathBuf;
use std::sync::Arc;

use manifold::factory::Backend;
use manifold::store::TagScope;
use manifold::stream::StreamType;

pub use crate::backup::FsBackupStore;
pub use crate::container::{Blob, BlobError, Container, WriteCondition};
pub use crate::data::FsDataStore;
pub use crate::document::FsDocumentStore;
pub use crate::lock::FsLockProvider;
pub use crate::snapshot::FsSnapshotStore;
pub use crate::status::FsStatusStore;
pub use crate::tag::FsTagStore;

/// The filesystem backend: every store contract served from one
/// container root directory.
#[derive(Clone)]
pub struct FsBackend {
    container: Arc<Container>,
}

impl FsBackend {
    /// Opens (or prepares) a backend rooted at the given directory. The
    /// directory is created on [FsBackend::initialize].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            container: Arc::new(Container::new(root)),
        }
    }

    /// Creates the container root.
    pub async fn initialize(&self) -> Result<(), BlobError> {
        self.container.ensure_root().await
    }

    /// The underlying blob container.
    pub fn container(&self) -> Arc<Container> {
        Arc::clone(&self.container)
    }

    /// Builds a [Backend] whose every store is served from this
    /// container.
    pub fn backend(&self) -> Backend {
        let container = &self.container;
        Backend {
            stream_type: StreamType::Blob,
            data: Arc::new(FsDataStore::new(Arc::clone(container))),
            documents: Arc::new(FsDocumentStore::new(Arc::clone(container))),
            document_tags: Arc::new(FsTagStore::new(Arc::clone(container), TagScope::Document)),
            stream_tags: Arc::new(FsTagStore::new(Arc::clone(container), TagScope::Stream)),
            snapshots: Arc::new(FsSnapshotStore::new(Arc::clone(container))),
            backups: Arc::new(FsBackupStore::new(Arc::clone(container))),
            locks: Arc::new(FsLockProvider::new(Arc::clone(container))),
            status: Arc::new(FsStatusStore::new(Arc::clone(container))),
        }
    }
}

/// Encodes an arbitrary value (a tag, a lock key) into a single safe
/// path component: bytes outside `[A-Za-z0-9._-]` become `%XX`.
pub(crate) fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char);
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}
