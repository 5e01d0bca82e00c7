//! Tiered, memoized lookup of optional collaborators.
//!
//! Resolution folds over an ordered list of [`ResolveStrategy`] tiers and stops at the first
//! handle of the requested capability:
//!
//! 1. [`RegistryTier`]: an already-registered instance.
//! 2. [`DefaultConstructionTier`]: a default instance built and initialized on demand.
//! 3. [`ScopedApiTier`] (optional): a narrower, scope-qualified registry entry.
//!
//! When every tier comes back empty the capability is unavailable and callers degrade.
//!
//! Each capability owns a `tokio::sync::OnceCell`. Concurrent first-use waits on the same cell,
//! so construction runs at most once; a failed resolution leaves the cell empty and the next
//! caller retries.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::embedding::{Embedder, HashingEmbedder};
use crate::parser::{FileParser, LocalFileParser};
use crate::storage::{ArtifactStore, FilesystemStore};

/// Errors raised while resolving a collaborator.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No tier produced a handle.
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    /// A tier tried to build the collaborator and failed.
    #[error("failed to construct {capability}: {reason}")]
    Construction {
        /// Capability being built.
        capability: &'static str,
        /// Failure detail.
        reason: String,
    },
    /// Capability name not recognised.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
}

/// Collaborators the pipeline can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// File parsing.
    Parser,
    /// Artifact persistence.
    Store,
    /// Sample embedding.
    Embedder,
}

impl Capability {
    /// Registry name of the capability.
    pub fn name(self) -> &'static str {
        match self {
            Self::Parser => "FileParserService",
            Self::Store => "ContentSteward",
            Self::Embedder => "EmbeddingService",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FileParserService" => Ok(Self::Parser),
            "ContentSteward" => Ok(Self::Store),
            "EmbeddingService" => Ok(Self::Embedder),
            other => Err(ResolveError::UnknownCapability(other.to_string())),
        }
    }
}

/// A resolved collaborator.
#[derive(Clone)]
pub enum Handle {
    /// Parser collaborator.
    Parser(Arc<dyn FileParser>),
    /// Store collaborator.
    Store(Arc<dyn ArtifactStore>),
    /// Embedder collaborator.
    Embedder(Arc<dyn Embedder>),
}

impl Handle {
    /// Capability this handle provides.
    pub fn capability(&self) -> Capability {
        match self {
            Self::Parser(_) => Capability::Parser,
            Self::Store(_) => Capability::Store,
            Self::Embedder(_) => Capability::Embedder,
        }
    }

    /// Whether both handles point at the same instance.
    pub fn same_instance(&self, other: &Handle) -> bool {
        match (self, other) {
            (Self::Parser(a), Self::Parser(b)) => Arc::ptr_eq(a, b),
            (Self::Store(a), Self::Store(b)) => Arc::ptr_eq(a, b),
            (Self::Embedder(a), Self::Embedder(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.capability())
    }
}

/// Shared registry of already-constructed collaborators.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Look up a collaborator by capability name.
    async fn lookup(&self, name: &str) -> Option<Handle>;
}

/// One resolution tier.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    /// Tier label used in logs.
    fn tier(&self) -> &'static str;

    /// Try to produce a handle. `Ok(None)` means "not here, try the next tier".
    async fn resolve(&self, capability: Capability) -> Result<Option<Handle>, ResolveError>;
}

/// Builds default collaborators.
#[async_trait]
pub trait CollaboratorFactory: Send + Sync {
    /// Construct and initialize a default collaborator, or `None` when there is no default.
    async fn construct(&self, capability: Capability) -> Result<Option<Handle>, ResolveError>;
}

/// Tier 1: registry lookup by capability name.
pub struct RegistryTier {
    registry: Arc<dyn Registry>,
}

impl RegistryTier {
    /// Wrap a registry.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ResolveStrategy for RegistryTier {
    fn tier(&self) -> &'static str {
        "registry"
    }

    async fn resolve(&self, capability: Capability) -> Result<Option<Handle>, ResolveError> {
        Ok(self.registry.lookup(capability.name()).await)
    }
}

/// Tier 2: direct construction through a factory.
pub struct DefaultConstructionTier {
    factory: Arc<dyn CollaboratorFactory>,
}

impl DefaultConstructionTier {
    /// Wrap a factory.
    pub fn new(factory: Arc<dyn CollaboratorFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl ResolveStrategy for DefaultConstructionTier {
    fn tier(&self) -> &'static str {
        "default_construction"
    }

    async fn resolve(&self, capability: Capability) -> Result<Option<Handle>, ResolveError> {
        self.factory.construct(capability).await
    }
}

/// Tier 3: registry lookup under a scope, as `<scope>/<capability name>`.
pub struct ScopedApiTier {
    registry: Arc<dyn Registry>,
    scope: String,
}

impl ScopedApiTier {
    /// Look capabilities up under `scope` in `registry`.
    pub fn new(registry: Arc<dyn Registry>, scope: impl Into<String>) -> Self {
        Self {
            registry,
            scope: scope.into(),
        }
    }
}

#[async_trait]
impl ResolveStrategy for ScopedApiTier {
    fn tier(&self) -> &'static str {
        "scoped_api"
    }

    async fn resolve(&self, capability: Capability) -> Result<Option<Handle>, ResolveError> {
        let key = format!("{}/{}", self.scope, capability.name());
        Ok(self.registry.lookup(&key).await)
    }
}

/// Memoizing resolver shared by every ingestion an orchestrator runs.
pub struct ServiceResolver {
    tiers: Vec<Arc<dyn ResolveStrategy>>,
    cells: Mutex<HashMap<Capability, Arc<OnceCell<Handle>>>>,
}

impl ServiceResolver {
    /// Build a resolver over `tiers`, consulted in order.
    pub fn new(tiers: Vec<Arc<dyn ResolveStrategy>>) -> Self {
        Self {
            tiers,
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Registry first, then default construction.
    pub fn standard(registry: Arc<dyn Registry>, factory: Arc<dyn CollaboratorFactory>) -> Self {
        Self::new(vec![
            Arc::new(RegistryTier::new(registry)),
            Arc::new(DefaultConstructionTier::new(factory)),
        ])
    }

    /// Resolve a capability; `None` means unavailable.
    pub async fn resolve(&self, capability: Capability) -> Option<Handle> {
        let cell = self.cell(capability);
        match cell.get_or_try_init(|| self.run_tiers(capability)).await {
            Ok(handle) => Some(handle.clone()),
            Err(error) => {
                tracing::warn!(
                    capability = %capability,
                    error = %error,
                    "Collaborator unavailable"
                );
                None
            }
        }
    }

    /// Resolve by registry name.
    pub async fn resolve_named(&self, name: &str) -> Option<Handle> {
        match name.parse::<Capability>() {
            Ok(capability) => self.resolve(capability).await,
            Err(error) => {
                tracing::warn!(error = %error, "Cannot resolve capability");
                None
            }
        }
    }

    /// Resolve the parser.
    pub async fn parser(&self) -> Option<Arc<dyn FileParser>> {
        match self.resolve(Capability::Parser).await? {
            Handle::Parser(parser) => Some(parser),
            _ => None,
        }
    }

    /// Resolve the store.
    pub async fn store(&self) -> Option<Arc<dyn ArtifactStore>> {
        match self.resolve(Capability::Store).await? {
            Handle::Store(store) => Some(store),
            _ => None,
        }
    }

    /// Resolve the embedder.
    pub async fn embedder(&self) -> Option<Arc<dyn Embedder>> {
        match self.resolve(Capability::Embedder).await? {
            Handle::Embedder(embedder) => Some(embedder),
            _ => None,
        }
    }

    /// Whether a handle for `capability` is memoized.
    pub fn is_cached(&self, capability: Capability) -> bool {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&capability)
            .is_some_and(|cell| cell.initialized())
    }

    fn cell(&self, capability: Capability) -> Arc<OnceCell<Handle>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(capability).or_default())
    }

    async fn run_tiers(&self, capability: Capability) -> Result<Handle, ResolveError> {
        for tier in &self.tiers {
            match tier.resolve(capability).await {
                Ok(Some(handle)) if handle.capability() == capability => {
                    tracing::debug!(
                        capability = %capability,
                        tier = tier.tier(),
                        "Resolved collaborator"
                    );
                    return Ok(handle);
                }
                Ok(Some(handle)) => {
                    tracing::warn!(
                        capability = %capability,
                        tier = tier.tier(),
                        returned = %handle.capability(),
                        "Ignoring handle of the wrong capability"
                    );
                }
                Ok(None) => {
                    tracing::trace!(
                        capability = %capability,
                        tier = tier.tier(),
                        "Tier had no handle"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        capability = %capability,
                        tier = tier.tier(),
                        error = %error,
                        "Tier failed"
                    );
                }
            }
        }
        Err(ResolveError::Unavailable(capability.name()))
    }
}

/// In-memory [`Registry`].
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, Handle>>,
}

impl InMemoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under an explicit name.
    pub fn register(&self, name: impl Into<String>, handle: Handle) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), handle);
    }

    /// Register a handle under its capability name.
    pub fn register_handle(&self, handle: Handle) {
        self.register(handle.capability().name(), handle);
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn lookup(&self, name: &str) -> Option<Handle> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Default factory building local collaborators from configuration.
pub struct LocalCollaborators {
    config: Config,
}

impl LocalCollaborators {
    /// Factory using `config`.
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CollaboratorFactory for LocalCollaborators {
    async fn construct(&self, capability: Capability) -> Result<Option<Handle>, ResolveError> {
        let construction = |reason: String| ResolveError::Construction {
            capability: capability.name(),
            reason,
        };
        let handle = match capability {
            Capability::Parser => {
                let parser = LocalFileParser::new(self.config.data_dir.clone());
                parser
                    .initialize()
                    .await
                    .map_err(|error| construction(error.to_string()))?;
                Handle::Parser(Arc::new(parser))
            }
            Capability::Store => {
                let store = FilesystemStore::new(self.config.artifact_dir.clone());
                store
                    .initialize()
                    .await
                    .map_err(|error| construction(error.to_string()))?;
                Handle::Store(Arc::new(store))
            }
            Capability::Embedder => {
                if self.config.embedding_dimension == 0 {
                    return Err(construction("embedding dimension must be positive".into()));
                }
                Handle::Embedder(Arc::new(HashingEmbedder::new(self.config.embedding_dimension)))
            }
        };
        tracing::info!(capability = %capability, "Constructed default collaborator");
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::types::ParseResult;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubParser;

    #[async_trait]
    impl FileParser for StubParser {
        async fn parse(&self, _file_id: &str, _options: &Map<String, Value>) -> ParseResult {
            ParseResult::failure("stub")
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl CollaboratorFactory for CountingFactory {
        async fn construct(&self, capability: Capability) -> Result<Option<Handle>, ResolveError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_first && call == 0 {
                return Err(ResolveError::Construction {
                    capability: capability.name(),
                    reason: "transient".into(),
                });
            }
            match capability {
                Capability::Parser => Ok(Some(Handle::Parser(Arc::new(StubParser)))),
                _ => Ok(None),
            }
        }
    }

    fn resolver(registry: Arc<InMemoryRegistry>, factory: Arc<CountingFactory>) -> ServiceResolver {
        ServiceResolver::standard(registry, factory)
    }

    #[tokio::test]
    async fn concurrent_first_use_constructs_once() {
        let factory = Arc::new(CountingFactory::default());
        let resolver = resolver(Arc::new(InMemoryRegistry::new()), Arc::clone(&factory));

        let (first, second) = tokio::join!(
            resolver.resolve(Capability::Parser),
            resolver.resolve(Capability::Parser)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.same_instance(&second));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert!(resolver.is_cached(Capability::Parser));
    }

    #[tokio::test]
    async fn registry_wins_over_construction() {
        let registry = Arc::new(InMemoryRegistry::new());
        let registered = Handle::Parser(Arc::new(StubParser));
        registry.register_handle(registered.clone());
        let factory = Arc::new(CountingFactory::default());
        let resolver = resolver(registry, Arc::clone(&factory));

        let resolved = resolver.resolve_named("FileParserService").await.unwrap();
        assert!(resolved.same_instance(&registered));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_capability_from_registry_is_ignored() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("ContentSteward", Handle::Parser(Arc::new(StubParser)));
        let resolver = resolver(registry, Arc::new(CountingFactory::default()));
        assert!(resolver.store().await.is_none());
        assert!(!resolver.is_cached(Capability::Store));
    }

    #[tokio::test]
    async fn failed_resolution_is_retried() {
        let factory = Arc::new(CountingFactory {
            fail_first: true,
            ..CountingFactory::default()
        });
        let resolver = resolver(Arc::new(InMemoryRegistry::new()), Arc::clone(&factory));
        assert!(resolver.parser().await.is_none());
        assert!(resolver.parser().await.is_some());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scoped_tier_is_consulted_last() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register(
            "tenant-a/EmbeddingService",
            Handle::Embedder(Arc::new(HashingEmbedder::new(4))),
        );
        let factory = Arc::new(CountingFactory::default());
        let resolver = ServiceResolver::new(vec![
            Arc::new(RegistryTier::new(registry.clone())),
            Arc::new(DefaultConstructionTier::new(factory.clone())),
            Arc::new(ScopedApiTier::new(registry, "tenant-a")),
        ]);
        assert!(resolver.embedder().await.is_some());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_names_resolve_to_none() {
        let resolver = resolver(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(CountingFactory::default()),
        );
        assert!(resolver.resolve_named("TelemetryService").await.is_none());
        assert!("ContentSteward".parse::<Capability>().is_ok());
    }

    #[tokio::test]
    async fn local_collaborators_require_data_dir() {
        let config = Config {
            data_dir: std::env::temp_dir().join(format!("docingest-none-{}", uuid::Uuid::new_v4())),
            ..Config::default()
        };
        let factory = LocalCollaborators::new(config);
        assert!(factory.construct(Capability::Parser).await.is_err());
        assert!(matches!(
            factory.construct(Capability::Embedder).await,
            Ok(Some(Handle::Embedder(_)))
        ));
    }
}
