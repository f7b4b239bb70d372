//! Backend registration, per-aggregate storage routing and the
//! object-document factory that resolves or creates manifests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backup::BackupStore;
use crate::document::{validate_key_component, InvalidObjectId, ObjectDocument, StreamDefaults};
use crate::error::{codes, ErrorCode};
use crate::lock::LockProvider;
use crate::projection::StatusStore;
use crate::session::LeasedSession;
use crate::snapshot::SnapshotStore;
use crate::store::{DataStore, DocumentStore, DocumentStoreError, TagStore, TagStoreError};
use crate::stream::StreamType;

/// All possible configuration error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No backend is registered under the requested connection name.
    #[error("no store is registered under the connection name {name:?}")]
    UnknownStore { name: String },

    /// No storage route exists for the aggregate name and no default
    /// store is configured.
    #[error("no storage route is configured for aggregate {aggregate:?}")]
    NoRoute { aggregate: String },
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::UnknownStore { .. } => codes::CFG_UNKNOWN_STORE,
            ConfigError::NoRoute { .. } => codes::CFG_NO_ROUTE,
        }
    }
}

/// One configured backend: the full set of stores reachable under a
/// single connection name.
#[derive(Clone)]
pub struct Backend {
    /// Backend tag recorded on streams created against this backend.
    pub stream_type: StreamType,
    pub data: Arc<dyn DataStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub document_tags: Arc<dyn TagStore>,
    pub stream_tags: Arc<dyn TagStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub backups: Arc<dyn BackupStore>,
    pub locks: Arc<dyn LockProvider>,
    pub status: Arc<dyn StatusStore>,
}

/// Registry of named backends.
///
/// Connection names recorded in stream descriptors resolve through this
/// registry at runtime; resolution is compile-time-registered code, no
/// reflection involved.
#[derive(Clone, Default)]
pub struct Backends {
    named: HashMap<String, Arc<Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under a connection name, replacing any
    /// previous registration.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<Backend>) -> &mut Self {
        self.named.insert(name.into(), backend);
        self
    }

    /// Resolves a connection name.
    pub fn resolve(&self, name: &str) -> Result<Arc<Backend>, ConfigError> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStore {
                name: name.to_owned(),
            })
    }
}

/// Case-insensitive static map from aggregate name to the connection
/// name of the backend storing it.
#[derive(Clone, Default)]
pub struct StorageRouting {
    routes: HashMap<String, String>,
    default_store: Option<String>,
}

impl StorageRouting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every unrouted aggregate to the given store.
    #[must_use]
    pub fn with_default(mut self, store_name: impl Into<String>) -> Self {
        self.default_store = Some(store_name.into());
        self
    }

    /// Routes one aggregate name to a store.
    #[must_use]
    pub fn route(mut self, aggregate: &str, store_name: impl Into<String>) -> Self {
        self.routes
            .insert(aggregate.to_lowercase(), store_name.into());
        self
    }

    /// Resolves the store name for an aggregate.
    pub fn resolve(&self, aggregate: &str) -> Result<&str, ConfigError> {
        self.routes
            .get(&aggregate.to_lowercase())
            .or(self.default_store.as_ref())
            .map(String::as_str)
            .ok_or_else(|| ConfigError::NoRoute {
                aggregate: aggregate.to_owned(),
            })
    }
}

/// All possible error types returned by the [ObjectDocumentFactory].
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error(transparent)]
    InvalidObjectId(#[from] InvalidObjectId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentStoreError),

    #[error(transparent)]
    Tag(#[from] TagStoreError),
}

impl ErrorCode for FactoryError {
    fn error_code(&self) -> &'static str {
        match self {
            FactoryError::InvalidObjectId(e) => e.error_code(),
            FactoryError::Config(e) => e.error_code(),
            FactoryError::Document(e) => e.error_code(),
            FactoryError::Tag(e) => e.error_code(),
        }
    }
}

/// Resolves manifests by (object name, object id), creating them on
/// first use, and dispatches to the backend configured for the
/// aggregate.
#[derive(Clone)]
pub struct ObjectDocumentFactory {
    backends: Arc<Backends>,
    routing: StorageRouting,
    defaults: HashMap<String, StreamDefaults>,
}

impl ObjectDocumentFactory {
    pub fn new(backends: Arc<Backends>, routing: StorageRouting) -> Self {
        Self {
            backends,
            routing,
            defaults: HashMap::new(),
        }
    }

    /// Overrides the stream defaults applied when creating manifests
    /// for one aggregate.
    #[must_use]
    pub fn with_defaults(mut self, aggregate: &str, defaults: StreamDefaults) -> Self {
        self.defaults.insert(aggregate.to_lowercase(), defaults);
        self
    }

    /// The backend registry this factory resolves against.
    pub fn backends(&self) -> Arc<Backends> {
        Arc::clone(&self.backends)
    }

    fn routed_backend(&self, object_name: &str) -> Result<(String, Arc<Backend>), FactoryError> {
        let store_name = self.routing.resolve(object_name)?.to_owned();
        let backend = self.backends.resolve(&store_name)?;
        Ok((store_name, backend))
    }

    fn defaults_for(&self, object_name: &str, store_name: &str, backend: &Backend) -> StreamDefaults {
        self.defaults
            .get(&object_name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| StreamDefaults::for_store(backend.stream_type, store_name))
    }

    /// Reads the manifest, or fails with
    /// [DocumentStoreError::DocumentNotFound].
    #[tracing::instrument(skip(self))]
    pub async fn get(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, FactoryError> {
        validate_key_component(object_name)?;
        validate_key_component(object_id)?;

        // Manifests live under the lowercased object name.
        let object_name = object_name.to_lowercase();
        let (_, backend) = self.routed_backend(&object_name)?;
        Ok(backend.documents.get(&object_name, object_id).await?)
    }

    /// Reads the manifest, creating it with the configured defaults when
    /// absent.
    #[tracing::instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, FactoryError> {
        validate_key_component(object_name)?;
        validate_key_component(object_id)?;

        let object_name = object_name.to_lowercase();
        let (store_name, backend) = self.routed_backend(&object_name)?;

        match backend.documents.get(&object_name, object_id).await {
            Ok(document) => Ok(document),
            Err(DocumentStoreError::DocumentNotFound { .. }) => {
                let defaults = self.defaults_for(&object_name, &store_name, &backend);
                let mut document = ObjectDocument::new(&object_name, object_id, &defaults)?;

                match backend.documents.create(&mut document).await {
                    Ok(()) => Ok(document),
                    // Lost the creation race; the winner's manifest is
                    // authoritative.
                    Err(DocumentStoreError::AlreadyExists { .. }) => {
                        Ok(backend.documents.get(&object_name, object_id).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Conditionally persists a manifest mutated outside a session
    /// (e.g. after tagging metadata changes). Sessions persist through
    /// their own commit path.
    #[tracing::instrument(skip(self, document), fields(key = %document.key()))]
    pub async fn set(&self, document: &mut ObjectDocument) -> Result<(), FactoryError> {
        let backend = self.backends.resolve(&document.active.document_store)?;
        Ok(backend.documents.set(document).await?)
    }

    /// Returns every manifest whose object id carries the tag.
    #[tracing::instrument(skip(self))]
    pub async fn get_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Vec<ObjectDocument>, FactoryError> {
        validate_key_component(object_name)?;

        let object_name = object_name.to_lowercase();
        let (_, backend) = self.routed_backend(&object_name)?;
        let ids = backend.document_tags.get(&object_name, tag).await?;

        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            match backend.documents.get(&object_name, &id).await {
                Ok(document) => documents.push(document),
                // A tag entry may outlive its manifest on backends
                // without cross-object transactions; skip it.
                Err(DocumentStoreError::DocumentNotFound { .. }) => {
                    tracing::warn!(%object_name, %id, tag, "tagged manifest is gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(documents)
    }

    /// Returns the first manifest carrying the tag, if any.
    pub async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<ObjectDocument>, FactoryError> {
        Ok(self.get_by_tag(object_name, tag).await?.into_iter().next())
    }

    /// Opens a leased session over the manifest for appending events.
    pub fn open_session(&self, document: ObjectDocument) -> LeasedSession {
        LeasedSession::new(document, self.backends())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::InMemoryBackend;

    fn factory() -> ObjectDocumentFactory {
        let mut backends = Backends::new();
        backends.register("default", Arc::new(InMemoryBackend::default().backend()));

        ObjectDocumentFactory::new(
            Arc::new(backends),
            StorageRouting::new().with_default("default"),
        )
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let factory = factory();

        let created = factory.get_or_create("Project", "P1").await.unwrap();
        assert_eq!(created.object_name, "project");
        assert!(created.etag.is_some());

        let loaded = factory.get_or_create("Project", "P1").await.unwrap();
        assert_eq!(loaded, created);

        // Object names are case-insensitive on every lookup path.
        let loaded = factory.get("PROJECT", "P1").await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn get_requires_an_existing_manifest() {
        let factory = factory();

        let err = factory.get("project", "missing").await.expect_err("absent");
        assert_eq!(err.error_code(), codes::EXT_DOCUMENT_NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_path_components_never_reach_storage() {
        let factory = factory();

        let err = factory
            .get_or_create("project", "../escape")
            .await
            .expect_err("path traversal");
        assert_eq!(err.error_code(), codes::CFG_INVALID_OBJECT_ID);

        let err = factory
            .get("pro ject", "P1")
            .await
            .expect_err("space in name");
        assert_eq!(err.error_code(), codes::CFG_INVALID_OBJECT_ID);
    }

    #[tokio::test]
    async fn routing_misses_surface_as_config_errors() {
        let backends = Backends::new();
        let factory = ObjectDocumentFactory::new(Arc::new(backends), StorageRouting::new());

        let err = factory.get("project", "P1").await.expect_err("no route");
        assert_eq!(err.error_code(), codes::CFG_NO_ROUTE);
    }

    #[tokio::test]
    async fn routes_are_case_insensitive() {
        let routing = StorageRouting::new().route("Project", "primary");
        assert_eq!(routing.resolve("PROJECT").unwrap(), "primary");
        assert!(routing.resolve("order").is_err());
    }
}
