//! # Schema Retriever
//!
//! Resolves device-class metadata from the external catalog. Requests
//! arriving in the same cooperative turn coalesce into one outbound
//! `get_schemas` call per metadata level; replies are cached with a TTL,
//! and kinds the catalog does not know get a 10-minute negative entry so
//! repeated misses stay local.
//!
//! ```text
//! get_schema(kind)  ──miss──> pending set ──(yield one turn)──> one batch
//!        │                                                          │
//!        └──hit──> cache <──── parse + validate + distribute ───────┘
//! ```
//!
//! Concurrency: at most one fetch is in flight per level; kinds that miss
//! while a fetch is out queue into the next batch. All caches sit behind
//! one mutex per level, written only by the batch-completion path and the
//! explicit `inject_class`/`remove_from_cache`/`clear_cache` calls.

pub mod catalog;

pub use catalog::{CatalogClient, HttpCatalog, MemoryCatalog, SchemaError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::ast::{ClassDef, Dataset, EntityTypeRecord, FunctionDef, Library, MixinDecl};
use crate::types::EntitySubtypeMap;

/// How much metadata a cached class carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaLevel {
    /// Signatures only
    Basic,
    /// Signatures plus natural-language metadata
    Everything,
}

/// Which function table to look in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSelector {
    Query,
    Action,
    Both,
}

type ClassResult = Result<Arc<ClassDef>, SchemaError>;
type Waiter = oneshot::Sender<ClassResult>;

struct ClassEntry {
    class: ClassResult,
    /// `None` for injected classes, which never expire
    expires: Option<Instant>,
}

impl ClassEntry {
    fn is_valid(&self, now: Instant) -> bool {
        self.expires.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Default)]
struct LevelState {
    cache: HashMap<String, ClassEntry>,
    pending: HashMap<String, Vec<Waiter>>,
    /// A batch task has been spawned but has not collected `pending` yet
    scheduled: bool,
    /// A batch fetch is currently out
    in_flight: bool,
}

struct TimedEntry<T> {
    value: T,
    expires: Instant,
}

/// Cache and TTL knobs; see [`crate::config::CacheConfig`].
#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    /// How long successfully fetched classes stay cached
    pub cache_ttl: Duration,
    /// How long "class does not exist" stays cached
    pub negative_ttl: Duration,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        RetrieverOptions {
            cache_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_millis(600_000),
        }
    }
}

/// The schema retriever. Cheap to share: all methods take `&self`.
pub struct SchemaRetriever {
    client: Arc<dyn CatalogClient>,
    basic: Arc<Mutex<LevelState>>,
    everything: Arc<Mutex<LevelState>>,
    datasets: Mutex<HashMap<String, TimedEntry<Arc<Dataset>>>>,
    entities: Mutex<Option<TimedEntry<Arc<Vec<EntityTypeRecord>>>>>,
    mixins: Mutex<Option<TimedEntry<Arc<HashMap<String, MixinDecl>>>>>,
    options: RetrieverOptions,
}

impl SchemaRetriever {
    pub fn new(client: Arc<dyn CatalogClient>) -> Self {
        Self::with_options(client, RetrieverOptions::default())
    }

    pub fn with_options(client: Arc<dyn CatalogClient>, options: RetrieverOptions) -> Self {
        SchemaRetriever {
            client,
            basic: Arc::new(Mutex::new(LevelState::default())),
            everything: Arc::new(Mutex::new(LevelState::default())),
            datasets: Mutex::new(HashMap::new()),
            entities: Mutex::new(None),
            mixins: Mutex::new(None),
            options,
        }
    }

    fn level(&self, level: SchemaLevel) -> &Arc<Mutex<LevelState>> {
        match level {
            SchemaLevel::Basic => &self.basic,
            SchemaLevel::Everything => &self.everything,
        }
    }

    // ------------------------------------------------------------------
    // Public lookup API
    // ------------------------------------------------------------------

    /// Resolve one function signature at the basic level.
    pub async fn get_schema(
        &self,
        kind: &str,
        selector: FunctionSelector,
        name: &str,
    ) -> Result<Arc<FunctionDef>, SchemaError> {
        let class = self.ensure_class(kind, SchemaLevel::Basic).await?;
        Self::pick_function(&class, selector, name)
    }

    /// Resolve one function with full natural-language metadata.
    pub async fn get_meta(
        &self,
        kind: &str,
        selector: FunctionSelector,
        name: &str,
    ) -> Result<Arc<FunctionDef>, SchemaError> {
        let class = self.ensure_class(kind, SchemaLevel::Everything).await?;
        Self::pick_function(&class, selector, name)
    }

    /// Resolve a whole class at the basic level.
    pub async fn get_class(&self, kind: &str) -> Result<Arc<ClassDef>, SchemaError> {
        self.ensure_class(kind, SchemaLevel::Basic).await
    }

    fn pick_function(
        class: &ClassDef,
        selector: FunctionSelector,
        name: &str,
    ) -> Result<Arc<FunctionDef>, SchemaError> {
        let found = match selector {
            FunctionSelector::Query => class.get_query(name),
            FunctionSelector::Action => class.get_action(name),
            FunctionSelector::Both => class.get_query(name).or_else(|| class.get_action(name)),
        };
        found
            .map(|f| Arc::new(f.clone()))
            .ok_or_else(|| SchemaError::FunctionNotFound {
                kind: class.kind.clone(),
                name: name.to_string(),
            })
    }

    /// The example dataset for one class.
    pub async fn get_examples_by_kind(&self, kind: &str) -> Result<Arc<Dataset>, SchemaError> {
        let now = Instant::now();
        if let Some(entry) = self.datasets.lock().get(kind) {
            if entry.expires > now {
                return Ok(entry.value.clone());
            }
        }
        let text = self
            .client
            .get_examples_by_kinds(vec![kind.to_string()])
            .await?;
        let library: Library =
            serde_json::from_str(&text).map_err(|e| SchemaError::Parse(e.to_string()))?;
        let dataset = library
            .datasets
            .into_iter()
            .find(|d| d.name == kind)
            .unwrap_or_else(|| Dataset { name: kind.to_string(), examples: vec![] });
        let dataset = Arc::new(dataset);
        self.datasets.lock().insert(
            kind.to_string(),
            TimedEntry { value: dataset.clone(), expires: now + self.options.cache_ttl },
        );
        Ok(dataset)
    }

    /// Declared parents of an entity type, per the catalog's records.
    pub async fn get_entity_parents(&self, entity_type: &str) -> Result<Vec<String>, SchemaError> {
        let records = self.entity_records().await?;
        Ok(records
            .iter()
            .find(|r| r.entity_type == entity_type)
            .and_then(|r| r.subtype_of.clone())
            .unwrap_or_default())
    }

    /// The whole subtype graph, for the typechecker.
    pub async fn entity_subtype_map(&self) -> Result<EntitySubtypeMap, SchemaError> {
        let records = self.entity_records().await?;
        Ok(records
            .iter()
            .filter_map(|r| {
                r.subtype_of
                    .as_ref()
                    .map(|parents| (r.entity_type.clone(), parents.clone()))
            })
            .collect())
    }

    async fn entity_records(&self) -> Result<Arc<Vec<EntityTypeRecord>>, SchemaError> {
        let now = Instant::now();
        if let Some(entry) = self.entities.lock().as_ref() {
            if entry.expires > now {
                return Ok(entry.value.clone());
            }
        }
        let records = Arc::new(self.client.get_all_entity_types().await?);
        *self.entities.lock() = Some(TimedEntry {
            value: records.clone(),
            expires: now + self.options.cache_ttl,
        });
        Ok(records)
    }

    /// Mixin declarations from the catalog.
    pub async fn get_mixins(&self) -> Result<Arc<HashMap<String, MixinDecl>>, SchemaError> {
        let now = Instant::now();
        if let Some(entry) = self.mixins.lock().as_ref() {
            if entry.expires > now {
                return Ok(entry.value.clone());
            }
        }
        let mixins = Arc::new(self.client.get_mixins().await?);
        *self.mixins.lock() = Some(TimedEntry {
            value: mixins.clone(),
            expires: now + self.options.cache_ttl,
        });
        Ok(mixins)
    }

    // ------------------------------------------------------------------
    // Cache management
    // ------------------------------------------------------------------

    /// Register a class directly, bypassing the catalog. Injected entries
    /// never expire.
    pub fn inject_class(&self, class: ClassDef) -> Result<(), SchemaError> {
        class.validate().map_err(|message| SchemaError::Invalid {
            kind: class.kind.clone(),
            message,
        })?;
        let class = Arc::new(class);
        for level in [SchemaLevel::Basic, SchemaLevel::Everything] {
            self.level(level).lock().cache.insert(
                class.kind.clone(),
                ClassEntry { class: Ok(class.clone()), expires: None },
            );
        }
        Ok(())
    }

    /// Drop one class from every cache level.
    pub fn remove_from_cache(&self, kind: &str) {
        self.basic.lock().cache.remove(kind);
        self.everything.lock().cache.remove(kind);
    }

    /// Drop everything, including datasets, entities and mixins.
    pub fn clear_cache(&self) {
        self.basic.lock().cache.clear();
        self.everything.lock().cache.clear();
        self.datasets.lock().clear();
        *self.entities.lock() = None;
        *self.mixins.lock() = None;
    }

    // ------------------------------------------------------------------
    // Batched resolution
    // ------------------------------------------------------------------

    async fn ensure_class(
        &self,
        kind: &str,
        level: SchemaLevel,
    ) -> Result<Arc<ClassDef>, SchemaError> {
        let receiver = {
            let state_arc = self.level(level).clone();
            let mut state = state_arc.lock();
            let now = Instant::now();
            if let Some(entry) = state.cache.get(kind) {
                if entry.is_valid(now) {
                    return entry.class.clone();
                }
                state.cache.remove(kind);
            }

            let (tx, rx) = oneshot::channel();
            state.pending.entry(kind.to_string()).or_default().push(tx);
            if !state.scheduled && !state.in_flight {
                state.scheduled = true;
                let client = self.client.clone();
                let options = self.options.clone();
                let state_arc = state_arc.clone();
                tokio::spawn(Self::run_batch(client, state_arc, level, options));
            }
            rx
        };

        receiver
            .await
            .map_err(|_| SchemaError::Transport("schema batch aborted".to_string()))?
    }

    /// One batch cycle: yield a turn so peers can join, collect the
    /// pending set, fire a single catalog call, then distribute results
    /// (and negative entries) to every waiter. Misses queued while the
    /// fetch was out form the next iteration's batch.
    async fn run_batch(
        client: Arc<dyn CatalogClient>,
        state_arc: Arc<Mutex<LevelState>>,
        level: SchemaLevel,
        options: RetrieverOptions,
    ) {
        loop {
            // Defer to the end of the current cooperative step; misses
            // that happen before this task resumes land in the batch.
            tokio::task::yield_now().await;

            let batch: HashMap<String, Vec<Waiter>> = {
                let mut state = state_arc.lock();
                state.scheduled = false;
                state.in_flight = true;
                std::mem::take(&mut state.pending)
            };
            if batch.is_empty() {
                state_arc.lock().in_flight = false;
                return;
            }

            let mut kinds: Vec<String> = batch.keys().cloned().collect();
            kinds.sort();
            debug!(level = ?level, kinds = ?kinds, "fetching schema batch");

            let outcome = Self::fetch_and_parse(&*client, kinds, level).await;

            let mut state = state_arc.lock();
            match outcome {
                Err(error) => {
                    // Transport (or parse) failure: fail every coalesced
                    // waiter uniformly, cache nothing.
                    for waiters in batch.into_values() {
                        for waiter in waiters {
                            let _ = waiter.send(Err(error.clone()));
                        }
                    }
                }
                Ok(mut resolved) => {
                    let now = Instant::now();
                    for (kind, waiters) in batch {
                        let result = resolved.remove(&kind).unwrap_or_else(|| {
                            warn!(kind = %kind, "class not in catalog, caching negative entry");
                            Err(SchemaError::ClassNotFound(kind.clone()))
                        });
                        let ttl =
                            if result.is_ok() { options.cache_ttl } else { options.negative_ttl };
                        state.cache.insert(
                            kind,
                            ClassEntry { class: result.clone(), expires: Some(now + ttl) },
                        );
                        for waiter in waiters {
                            let _ = waiter.send(result.clone());
                        }
                    }
                    // Classes the catalog sent along unrequested are cached too
                    for (kind, result) in resolved {
                        let ttl =
                            if result.is_ok() { options.cache_ttl } else { options.negative_ttl };
                        state
                            .cache
                            .insert(kind, ClassEntry { class: result, expires: Some(now + ttl) });
                    }
                }
            }

            state.in_flight = false;
            if state.pending.is_empty() {
                return;
            }
            // take over the next batch ourselves
            state.scheduled = true;
        }
    }

    async fn fetch_and_parse(
        client: &dyn CatalogClient,
        kinds: Vec<String>,
        level: SchemaLevel,
    ) -> Result<HashMap<String, ClassResult>, SchemaError> {
        let get_meta = level == SchemaLevel::Everything;
        let text = client.get_schemas(kinds, get_meta).await?;
        let library: Library =
            serde_json::from_str(&text).map_err(|e| SchemaError::Parse(e.to_string()))?;

        let mut resolved = HashMap::new();
        for class in library.classes {
            let kind = class.kind.clone();
            let result = match class.validate() {
                Ok(()) => Ok(Arc::new(class)),
                Err(message) => {
                    warn!(kind = %kind, message = %message, "class failed validation");
                    Err(SchemaError::Invalid { kind: kind.clone(), message })
                }
            };
            resolved.insert(kind, result);
        }
        Ok(resolved)
    }
}
