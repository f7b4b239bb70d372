//! A blob-container abstraction over a directory tree: keyed blobs with
//! content-hash ETags, atomic writes and conditional-write semantics.

use std::path::{Path, PathBuf};

use manifold::error::{codes, ErrorCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// All possible error types returned by [Container] operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// No blob exists under the key.
    #[error("blob {key} was not found")]
    NotFound { key: String },

    /// The container root does not exist.
    #[error("container root {path} does not exist")]
    ContainerNotFound { path: String },

    /// A conditional write lost: the blob changed (or appeared) since
    /// the caller read it.
    #[error("conditional write on blob {key} failed")]
    Conflict { key: String },

    /// The key is not safe to map onto the filesystem.
    #[error("blob key {key:?} contains unsafe path components")]
    UnsafeKey { key: String },

    /// Underlying filesystem failure.
    #[error("i/o failure on blob {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl ErrorCode for BlobError {
    fn error_code(&self) -> &'static str {
        match self {
            BlobError::NotFound { .. } => codes::FILE_BLOB_NOT_FOUND,
            BlobError::ContainerNotFound { .. } => codes::FILE_CONTAINER_NOT_FOUND,
            BlobError::Conflict { .. } => codes::CONCURRENCY_CONFLICT,
            BlobError::UnsafeKey { .. } => codes::CFG_INVALID_OBJECT_ID,
            BlobError::Io { .. } => codes::EXT_PROCESSING,
        }
    }
}

/// A blob read back from the container, with the ETag of the content.
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub etag: String,
}

/// Conditions applied to [Container::write].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Last writer wins.
    Any,
    /// The blob must not exist yet (`If-None-Match: *`).
    IfNoneMatch,
    /// The blob must still carry this ETag (`If-Match`).
    IfMatch(String),
}

/// A directory tree exposed as a flat blob namespace.
///
/// ETags are the SHA-256 of the blob content, so they survive process
/// restarts. Writes go through a temp file plus rename and are
/// serialized per container, which makes the read-compare-write cycle
/// of conditional writes atomic within the owning process.
pub struct Container {
    root: PathBuf,
    write_serial: Mutex<()>,
}

impl Container {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_serial: Mutex::new(()),
        }
    }

    /// Creates the root directory if it is missing.
    pub async fn ensure_root(&self) -> Result<(), BlobError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| BlobError::Io {
                key: self.root.display().to_string(),
                source,
            })
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, BlobError> {
        let unsafe_key = || BlobError::UnsafeKey {
            key: key.to_owned(),
        };

        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(unsafe_key());
        }

        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(unsafe_key());
            }
            path.push(component);
        }
        Ok(path)
    }

    fn etag_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    async fn read_optional(&self, path: &Path, key: &str) -> Result<Option<Blob>, BlobError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let etag = Self::etag_of(&bytes);
                Ok(Some(Blob { bytes, etag }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(BlobError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Reads a blob, or `None` when absent.
    pub async fn try_read(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let path = self.path_of(key)?;
        self.read_optional(&path, key).await
    }

    /// Reads a blob, failing with [BlobError::NotFound] when absent.
    pub async fn read(&self, key: &str) -> Result<Blob, BlobError> {
        self.try_read(key)
            .await?
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_owned(),
            })
    }

    /// Writes a blob under the given condition, returning the new ETag.
    pub async fn write(
        &self,
        key: &str,
        bytes: &[u8],
        condition: WriteCondition,
    ) -> Result<String, BlobError> {
        let path = self.path_of(key)?;
        let _guard = self.write_serial.lock().await;

        let current = self.read_optional(&path, key).await?;
        match (&condition, &current) {
            (WriteCondition::Any, _) => {}
            (WriteCondition::IfNoneMatch, None) => {}
            (WriteCondition::IfNoneMatch, Some(_)) => {
                return Err(BlobError::Conflict {
                    key: key.to_owned(),
                });
            }
            (WriteCondition::IfMatch(expected), Some(blob)) if *expected == blob.etag => {}
            (WriteCondition::IfMatch(_), _) => {
                return Err(BlobError::Conflict {
                    key: key.to_owned(),
                });
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| BlobError::Io {
                    key: key.to_owned(),
                    source,
                })?;
        }

        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let io_err = |source| BlobError::Io {
            key: key.to_owned(),
            source,
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        Ok(Self::etag_of(bytes))
    }

    /// Deletes a blob, reporting whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_of(key)?;
        let _guard = self.write_serial.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BlobError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Lists the file names (not full keys) directly under a directory
    /// key. A missing directory lists as empty.
    pub async fn list_dir(&self, dir_key: &str) -> Result<Vec<String>, BlobError> {
        let path = self.path_of(dir_key)?;

        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BlobError::Io {
                    key: dir_key.to_owned(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    // Skip in-flight temp files.
                    if name.contains(".tmp-") {
                        continue;
                    }
                    if entry
                        .file_type()
                        .await
                        .map(|t| t.is_file())
                        .unwrap_or(false)
                    {
                        names.push(name);
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(BlobError::Io {
                        key: dir_key.to_owned(),
                        source,
                    })
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn container() -> (tempfile::TempDir, Container) {
        let dir = tempfile::tempdir().expect("temp dir");
        let container = Container::new(dir.path());
        (dir, container)
    }

    #[tokio::test]
    async fn write_read_round_trip_with_stable_etags() {
        let (_dir, container) = container();

        let etag = container
            .write("a/b/c.json", b"{}", WriteCondition::Any)
            .await
            .expect("write should succeed");

        let blob = container.read("a/b/c.json").await.expect("blob exists");
        assert_eq!(blob.bytes, b"{}");
        assert_eq!(blob.etag, etag);
    }

    #[tokio::test]
    async fn conditional_writes_enforce_their_conditions() {
        let (_dir, container) = container();

        let etag = container
            .write("doc.json", b"one", WriteCondition::IfNoneMatch)
            .await
            .unwrap();

        assert!(matches!(
            container
                .write("doc.json", b"two", WriteCondition::IfNoneMatch)
                .await,
            Err(BlobError::Conflict { .. })
        ));

        let etag = container
            .write("doc.json", b"two", WriteCondition::IfMatch(etag))
            .await
            .expect("matching etag");

        assert!(matches!(
            container
                .write("doc.json", b"three", WriteCondition::IfMatch("stale".to_owned()))
                .await,
            Err(BlobError::Conflict { .. })
        ));

        assert_eq!(container.read("doc.json").await.unwrap().etag, etag);
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let (_dir, container) = container();

        for key in ["../escape", "a/../b", "/absolute", "a//b", ""] {
            assert!(matches!(
                container.try_read(key).await,
                Err(BlobError::UnsafeKey { .. })
            ));
        }
    }

    #[tokio::test]
    async fn listing_skips_temp_files_and_missing_dirs() {
        let (_dir, container) = container();

        assert!(container.list_dir("events").await.unwrap().is_empty());

        container
            .write("events/0.json", b"[]", WriteCondition::Any)
            .await
            .unwrap();
        container
            .write("events/1.json", b"[]", WriteCondition::Any)
            .await
            .unwrap();

        assert_eq!(
            container.list_dir("events").await.unwrap(),
            vec!["0.json".to_owned(), "1.json".to_owned()]
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, container) = container();

        container
            .write("gone.json", b"x", WriteCondition::Any)
            .await
            .unwrap();
        assert!(container.delete("gone.json").await.unwrap());
        assert!(!container.delete("gone.json").await.unwrap());
        assert!(container.try_read("gone.json").await.unwrap().is_none());
    }
}
