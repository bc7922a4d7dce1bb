//! # Catalog Client
//!
//! The transport-facing side of schema retrieval. A catalog serves class
//! libraries, example datasets, mixin declarations and entity records;
//! replies travel as serialized [`Library`] documents. An empty reply
//! means "none found" and becomes a negative cache event upstream.
//!
//! Two implementations: [`HttpCatalog`] for a real catalog endpoint and
//! [`MemoryCatalog`] for tests, which counts outbound calls so batching
//! behavior can be asserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use crate::ast::{ClassDef, Dataset, EntityTypeRecord, Library, MixinDecl};

/// Error types for schema operations. Clone-able because one failure fans
/// out to every waiter coalesced into the same batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    /// The catalog does not know this class
    #[error("no such class {0}")]
    ClassNotFound(String),
    /// The class exists but has no such function
    #[error("no such function {kind}.{name}")]
    FunctionNotFound { kind: String, name: String },
    /// The catalog could not be reached
    #[error("transport error: {0}")]
    Transport(String),
    /// The catalog reply did not deserialize
    #[error("invalid class library: {0}")]
    Parse(String),
    /// The class deserialized but failed validation
    #[error("class {kind} failed validation: {message}")]
    Invalid { kind: String, message: String },
}

/// The external catalog contract.
pub trait CatalogClient: Send + Sync {
    /// Source of a single class.
    fn get_device_code(&self, kind: String) -> BoxFuture<'_, Result<String, SchemaError>>;

    /// A library containing zero or more of the requested classes.
    /// `get_meta` asks for the richer natural-language metadata.
    fn get_schemas(
        &self,
        kinds: Vec<String>,
        get_meta: bool,
    ) -> BoxFuture<'_, Result<String, SchemaError>>;

    /// A library carrying the datasets for the requested classes.
    fn get_examples_by_kinds(
        &self,
        kinds: Vec<String>,
    ) -> BoxFuture<'_, Result<String, SchemaError>>;

    fn get_mixins(&self) -> BoxFuture<'_, Result<HashMap<String, MixinDecl>, SchemaError>>;

    fn get_all_entity_types(&self) -> BoxFuture<'_, Result<Vec<EntityTypeRecord>, SchemaError>>;
}

// ============================================================================
// HTTP catalog
// ============================================================================

/// Catalog client over HTTP.
pub struct HttpCatalog {
    base_url: String,
    client: reqwest::Client,
    developer_key: Option<String>,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpCatalog {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            developer_key: None,
        }
    }

    pub fn with_developer_key(mut self, key: impl Into<String>) -> Self {
        self.developer_key = Some(key.into());
        self
    }

    async fn get_text(&self, path: String) -> Result<String, SchemaError> {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(key) = &self.developer_key {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("developer_key=");
            url.push_str(key);
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SchemaError::Transport(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| SchemaError::Transport(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| SchemaError::Transport(e.to_string()))
    }
}

impl CatalogClient for HttpCatalog {
    fn get_device_code(&self, kind: String) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move { self.get_text(format!("/api/code/devices/{kind}")).await })
    }

    fn get_schemas(
        &self,
        kinds: Vec<String>,
        get_meta: bool,
    ) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move {
            let meta = if get_meta { "?meta=1" } else { "" };
            self.get_text(format!("/api/schemas/{}{}", kinds.join(","), meta))
                .await
        })
    }

    fn get_examples_by_kinds(
        &self,
        kinds: Vec<String>,
    ) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move {
            self.get_text(format!("/api/examples/by-kinds/{}", kinds.join(",")))
                .await
        })
    }

    fn get_mixins(&self) -> BoxFuture<'_, Result<HashMap<String, MixinDecl>, SchemaError>> {
        Box::pin(async move {
            let text = self.get_text("/api/mixins".to_string()).await?;
            serde_json::from_str(&text).map_err(|e| SchemaError::Parse(e.to_string()))
        })
    }

    fn get_all_entity_types(&self) -> BoxFuture<'_, Result<Vec<EntityTypeRecord>, SchemaError>> {
        Box::pin(async move {
            let text = self.get_text("/api/entities/all".to_string()).await?;
            serde_json::from_str(&text).map_err(|e| SchemaError::Parse(e.to_string()))
        })
    }
}

// ============================================================================
// In-memory catalog
// ============================================================================

/// In-memory catalog for tests. Serves pre-registered classes and records
/// every `get_schemas` call so tests can assert request coalescing.
#[derive(Default)]
pub struct MemoryCatalog {
    classes: Mutex<HashMap<String, ClassDef>>,
    datasets: Mutex<HashMap<String, Dataset>>,
    entity_types: Mutex<Vec<EntityTypeRecord>>,
    mixins: Mutex<HashMap<String, MixinDecl>>,
    schema_requests: AtomicUsize,
    requested_kinds: Mutex<Vec<Vec<String>>>,
    /// When set, every request fails with this transport error
    fail_with: Mutex<Option<String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog::default()
    }

    pub fn with_class(self, class: ClassDef) -> Self {
        self.classes.lock().insert(class.kind.clone(), class);
        self
    }

    pub fn with_dataset(self, dataset: Dataset) -> Self {
        self.datasets.lock().insert(dataset.name.clone(), dataset);
        self
    }

    pub fn with_entity_type(self, record: EntityTypeRecord) -> Self {
        self.entity_types.lock().push(record);
        self
    }

    pub fn add_class(&self, class: ClassDef) {
        self.classes.lock().insert(class.kind.clone(), class);
    }

    /// Make every subsequent request fail at the transport level.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock() = Some(message.into());
    }

    /// Stop failing requests.
    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }

    /// Number of `get_schemas` calls issued so far.
    pub fn schema_request_count(&self) -> usize {
        self.schema_requests.load(Ordering::SeqCst)
    }

    /// The kind lists of every `get_schemas` call, in order.
    pub fn requested_kinds(&self) -> Vec<Vec<String>> {
        self.requested_kinds.lock().clone()
    }

    fn check_failure(&self) -> Result<(), SchemaError> {
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(SchemaError::Transport(message));
        }
        Ok(())
    }
}

impl CatalogClient for MemoryCatalog {
    fn get_device_code(&self, kind: String) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move {
            self.check_failure()?;
            let classes = self.classes.lock();
            match classes.get(&kind) {
                Some(class) => {
                    let library = Library { classes: vec![class.clone()], datasets: vec![] };
                    serde_json::to_string(&library)
                        .map_err(|e| SchemaError::Parse(e.to_string()))
                }
                None => Err(SchemaError::ClassNotFound(kind)),
            }
        })
    }

    fn get_schemas(
        &self,
        kinds: Vec<String>,
        _get_meta: bool,
    ) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move {
            self.schema_requests.fetch_add(1, Ordering::SeqCst);
            self.requested_kinds.lock().push(kinds.clone());
            self.check_failure()?;
            let classes = self.classes.lock();
            let found: Vec<ClassDef> = kinds
                .iter()
                .filter_map(|k| classes.get(k).cloned())
                .collect();
            let library = Library { classes: found, datasets: vec![] };
            serde_json::to_string(&library).map_err(|e| SchemaError::Parse(e.to_string()))
        })
    }

    fn get_examples_by_kinds(
        &self,
        kinds: Vec<String>,
    ) -> BoxFuture<'_, Result<String, SchemaError>> {
        Box::pin(async move {
            self.check_failure()?;
            let datasets = self.datasets.lock();
            let found: Vec<Dataset> = kinds
                .iter()
                .filter_map(|k| datasets.get(k).cloned())
                .collect();
            let library = Library { classes: vec![], datasets: found };
            serde_json::to_string(&library).map_err(|e| SchemaError::Parse(e.to_string()))
        })
    }

    fn get_mixins(&self) -> BoxFuture<'_, Result<HashMap<String, MixinDecl>, SchemaError>> {
        Box::pin(async move {
            self.check_failure()?;
            Ok(self.mixins.lock().clone())
        })
    }

    fn get_all_entity_types(&self) -> BoxFuture<'_, Result<Vec<EntityTypeRecord>, SchemaError>> {
        Box::pin(async move {
            self.check_failure()?;
            Ok(self.entity_types.lock().clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::functions::{ArgumentDef, Direction, FunctionDef, FunctionType};
    use crate::types::Type;

    fn example_class() -> ClassDef {
        ClassDef::new("com.example").with_query(FunctionDef::new(
            "com.example",
            FunctionType::Query,
            "list",
            vec![ArgumentDef::new(Direction::Out, "item", Type::String)],
        ))
    }

    #[tokio::test]
    async fn test_memory_catalog_serves_libraries() {
        let catalog = MemoryCatalog::new().with_class(example_class());
        let text = catalog
            .get_schemas(vec!["com.example".to_string(), "com.missing".to_string()], false)
            .await
            .unwrap();
        let library: Library = serde_json::from_str(&text).unwrap();
        assert_eq!(library.classes.len(), 1);
        assert_eq!(library.classes[0].kind, "com.example");
        assert_eq!(catalog.schema_request_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_catalog_transport_failure() {
        let catalog = MemoryCatalog::new();
        catalog.fail_with("connection refused");
        let err = catalog
            .get_schemas(vec!["com.example".to_string()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::Transport(_)));
    }
}
