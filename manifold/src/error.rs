//! Stable, machine-readable error codes shared by every error type
//! exposed from this crate.
//!
//! Codes are part of the persisted/observable surface of the engine:
//! callers dispatch on them, dashboards group by them. They must never
//! change once released.

/// Maps an error value to its stable machine-readable code.
///
/// Implemented by all public error enums in this crate. The code is
/// meant for programmatic dispatch and log correlation; the `Display`
/// implementation of the error remains the human-readable side.
pub trait ErrorCode {
    /// Returns the stable code for this error value.
    fn error_code(&self) -> &'static str;
}

/// The full set of stable error codes emitted by the engine.
pub mod codes {
    /// An unknown store connection name was requested.
    pub const CFG_UNKNOWN_STORE: &str = "ELFAES-CFG-0001";
    /// No storage route is registered for the aggregate name.
    pub const CFG_NO_ROUTE: &str = "ELFAES-CFG-0002";
    /// Object name or id contains characters outside `[A-Za-z0-9._-]`.
    pub const CFG_INVALID_OBJECT_ID: &str = "ELFAES-CFG-0003";
    /// Chunk settings are unusable (zero size with chunking enabled).
    pub const CFG_INVALID_CHUNK_SETTINGS: &str = "ELFAES-CFG-0004";
    /// A stream identifier did not match `<id-sans-dashes>-<generation>`.
    pub const CFG_INVALID_STREAM_IDENTIFIER: &str = "ELFAES-CFG-0005";
    /// A snapshot policy is unusable (e.g. `every == 0` while enabled).
    pub const CFG_INVALID_SNAPSHOT_POLICY: &str = "ELFAES-CFG-0006";

    /// Transient external-storage processing failure.
    pub const EXT_PROCESSING: &str = "ELFAES-EXT-0001";
    /// The object-document manifest was not found.
    pub const EXT_DOCUMENT_NOT_FOUND: &str = "ELFAES-EXT-0010";
    /// The object-document manifest already exists.
    pub const EXT_DOCUMENT_ALREADY_EXISTS: &str = "ELFAES-EXT-0011";
    /// A store entry (tag index, snapshot, backup artifact) was not found.
    pub const EXT_ENTRY_NOT_FOUND: &str = "ELFAES-EXT-0012";

    /// A blob addressed by key does not exist.
    pub const FILE_BLOB_NOT_FOUND: &str = "ELFAES-FILE-0001";
    /// The backing container (root directory, bucket) does not exist.
    pub const FILE_CONTAINER_NOT_FOUND: &str = "ELFAES-FILE-0002";

    /// Persisted data could not be deserialized.
    pub const VAL_DESERIALIZATION: &str = "ELFAES-VAL-0001";
    /// Two version tokens of different objects were compared.
    pub const VAL_TOKEN_MISMATCH: &str = "ELFAES-VAL-0004";

    /// A registered constraint rejected an event.
    pub const BIZ_CONSTRAINT: &str = "ELFAES-BIZ-0001";

    /// A commit failed before the manifest became visible.
    pub const COMMIT_FAILED: &str = "ELFAES-COMMIT-0001";
    /// Cleanup after a failed commit failed as well; the stream is broken.
    pub const COMMIT_CLEANUP_FAILED: &str = "ELFAES-COMMIT-0002";

    /// One or more post-commit actions failed after events became durable.
    pub const POST_COMMIT_FAILED: &str = "ELFAES-POSTCOMMIT-0001";

    /// Optimistic concurrency conflict on the manifest or a status document.
    pub const CONCURRENCY_CONFLICT: &str = "ES_CONCURRENCY_CONFLICT";
    /// The target stream is closed; a continuation may be carried.
    pub const STREAM_CLOSED: &str = "ES_STREAM_CLOSED";

    /// A write was computed from a checkpoint that is no longer current.
    pub const STALE_CHECKPOINT: &str = "ELFAES-STALE-0001";
}
