//! Dependency injection for tool handlers.
//!
//! Handlers declare injected parameters with a `Depends(provider)` default.
//! At call time [`resolve_dependencies`] runs each provider against a
//! [`DependencyContainer`] and hands the handler a name → capability map.
//! Handler code is the same whether the container holds production clients
//! or test doubles.

mod error;
pub mod http;
pub mod inference;
pub mod store;

pub use error::CapabilityError;
pub use http::{HttpFetcher, ReqwestFetcher};
pub use inference::{CompletionRequest, HttpInferenceClient, InferenceClient};
#[cfg(test)]
pub use inference::MockInferenceClient;
pub use store::{JournalEntry, JournalStore, MemoryStore};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::tools::schema::{ParamDef, ParamDefault};
use crate::types::CapabilityConfig;

// =============================================================================
// Injected values
// =============================================================================

/// A live capability handed to a handler.
#[derive(Clone)]
pub enum Dependency {
    Store(Arc<dyn JournalStore>),
    Inference(Arc<dyn InferenceClient>),
    Http(Arc<dyn HttpFetcher>),
}

impl Dependency {
    pub fn kind(&self) -> &'static str {
        match self {
            Dependency::Store(_) => "store",
            Dependency::Inference(_) => "inference",
            Dependency::Http(_) => "http",
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dependency::{}", self.kind())
    }
}

/// Provider function run against the container at call time.
pub type Provider = fn(&DependencyContainer) -> Dependency;

/// Marker placed as a parameter default: "inject from this provider".
#[derive(Clone, Copy)]
pub struct Depends(pub Provider);

impl fmt::Debug for Depends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Depends(..)")
    }
}

pub fn store_provider(container: &DependencyContainer) -> Dependency {
    Dependency::Store(container.store())
}

pub fn inference_provider(container: &DependencyContainer) -> Dependency {
    Dependency::Inference(container.inference())
}

pub fn http_provider(container: &DependencyContainer) -> Dependency {
    Dependency::Http(container.http())
}

/// Dependencies resolved for one call.
#[derive(Debug, Clone, Default)]
pub struct ResolvedDependencies {
    values: HashMap<String, Dependency>,
}

impl ResolvedDependencies {
    pub fn insert(&mut self, name: impl Into<String>, dependency: Dependency) {
        self.values.insert(name.into(), dependency);
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.values.get(name)
    }

    pub fn store(&self, name: &str) -> Option<Arc<dyn JournalStore>> {
        match self.values.get(name)? {
            Dependency::Store(store) => Some(store.clone()),
            _ => None,
        }
    }

    pub fn inference(&self, name: &str) -> Option<Arc<dyn InferenceClient>> {
        match self.values.get(name)? {
            Dependency::Inference(client) => Some(client.clone()),
            _ => None,
        }
    }

    pub fn http(&self, name: &str) -> Option<Arc<dyn HttpFetcher>> {
        match self.values.get(name)? {
            Dependency::Http(fetcher) => Some(fetcher.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// =============================================================================
// Container
// =============================================================================

/// Binds each capability slot to one live instance.
///
/// Slots are filled lazily with production defaults on first access.
/// `override_*` takes `&mut self`, so bindings can only change while the
/// container is still exclusively owned (test setup), never once shared.
pub struct DependencyContainer {
    config: CapabilityConfig,
    http_client: OnceLock<reqwest::Client>,
    store: OnceLock<Arc<dyn JournalStore>>,
    inference: OnceLock<Arc<dyn InferenceClient>>,
    http: OnceLock<Arc<dyn HttpFetcher>>,
}

impl fmt::Debug for DependencyContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyContainer")
            .field("store_bound", &self.store.get().is_some())
            .field("inference_bound", &self.inference.get().is_some())
            .field("http_bound", &self.http.get().is_some())
            .finish_non_exhaustive()
    }
}

impl Default for DependencyContainer {
    fn default() -> Self {
        Self::new(CapabilityConfig::default())
    }
}

static PROCESS_CONTAINER: OnceLock<DependencyContainer> = OnceLock::new();

impl DependencyContainer {
    pub fn new(config: CapabilityConfig) -> Self {
        Self {
            config,
            http_client: OnceLock::new(),
            store: OnceLock::new(),
            inference: OnceLock::new(),
            http: OnceLock::new(),
        }
    }

    /// Process-wide container used when a caller passes none.
    pub fn process_default() -> &'static DependencyContainer {
        PROCESS_CONTAINER.get_or_init(DependencyContainer::default)
    }

    fn http_client(&self) -> reqwest::Client {
        self.http_client
            .get_or_init(|| {
                reqwest::Client::builder()
                    .timeout(self.config.http_timeout)
                    .user_agent(self.config.user_agent.clone())
                    .build()
                    .unwrap_or_else(|err| {
                        tracing::warn!(error = %err, "http client build failed, using defaults");
                        reqwest::Client::new()
                    })
            })
            .clone()
    }

    pub fn store(&self) -> Arc<dyn JournalStore> {
        self.store
            .get_or_init(|| {
                tracing::debug!("binding default journal store");
                let store: Arc<dyn JournalStore> = Arc::new(MemoryStore::new());
                store
            })
            .clone()
    }

    pub fn inference(&self) -> Arc<dyn InferenceClient> {
        self.inference
            .get_or_init(|| {
                tracing::debug!(url = %self.config.inference_url, "binding default inference client");
                let client: Arc<dyn InferenceClient> =
                    Arc::new(HttpInferenceClient::new(self.http_client(), &self.config));
                client
            })
            .clone()
    }

    pub fn http(&self) -> Arc<dyn HttpFetcher> {
        self.http
            .get_or_init(|| {
                let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(self.http_client()));
                fetcher
            })
            .clone()
    }

    pub fn override_store(&mut self, store: Arc<dyn JournalStore>) {
        self.store = OnceLock::from(store);
    }

    pub fn override_inference(&mut self, client: Arc<dyn InferenceClient>) {
        self.inference = OnceLock::from(client);
    }

    pub fn override_http(&mut self, fetcher: Arc<dyn HttpFetcher>) {
        self.http = OnceLock::from(fetcher);
    }
}

/// Run the `Depends` provider of every injected parameter.
///
/// Parameters without a `Depends` default are left for the caller. With no
/// container, the process default is used.
pub fn resolve_dependencies(
    params: &[ParamDef],
    container: Option<&DependencyContainer>,
) -> ResolvedDependencies {
    let container = match container {
        Some(container) => container,
        None => DependencyContainer::process_default(),
    };
    let mut resolved = ResolvedDependencies::default();
    for param in params {
        if let ParamDefault::Depends(Depends(provider)) = &param.default {
            resolved.insert(param.name.clone(), provider(container));
        }
    }
    resolved
}
