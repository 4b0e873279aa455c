//! Tool registry merge and provider lifecycle.
//!
//! Providers are initialised in parallel and their tool sets merged into one
//! name → tool mapping, later providers winning on name collisions. Every
//! tool is wrapped in an [`IsolatedTool`].
//!
//! A [`ToolProviderCache`] keeps one merged registry for the whole process.
//! Leases served from the cache own no providers; uncached leases own fresh
//! providers that the caller tears down with [`teardown`] once the run is
//! over.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stepweave_config::ToolsConfig;
use stepweave_core::tool::{Tool, ToolDefinition, ToolProvider};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::isolation::IsolatedTool;

/// How merged tools are wrapped.
#[derive(Debug, Clone)]
pub struct IsolationPolicy {
    pub call_timeout: Duration,
    pub require_approval: HashSet<String>,
}

impl IsolationPolicy {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            require_approval: config.require_approval.iter().cloned().collect(),
        }
    }

    fn wrap(&self, tool: Arc<dyn Tool>) -> IsolatedTool {
        let required = self.require_approval.contains(tool.name());
        IsolatedTool::new(tool, self.call_timeout).with_approval(required)
    }
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(90),
            require_approval: HashSet::new(),
        }
    }
}

/// The merged, isolated tool set of a run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<IsolatedTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn insert(&mut self, tool: IsolatedTool) -> Option<Arc<IsolatedTool>> {
        self.tools.insert(tool.name().to_string(), Arc::new(tool))
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<IsolatedTool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// All registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Initialise all providers in parallel and merge their tools.
///
/// A provider that fails to initialise is logged and skipped.
pub async fn merge_providers(
    providers: &[Arc<dyn ToolProvider>],
    policy: &IsolationPolicy,
) -> ToolRegistry {
    merge_counting_failures(providers, policy).await.0
}

/// [`merge_providers`], also reporting how many providers failed.
async fn merge_counting_failures(
    providers: &[Arc<dyn ToolProvider>],
    policy: &IsolationPolicy,
) -> (ToolRegistry, usize) {
    let results = join_all(providers.iter().map(|p| async move { (p.name(), p.tools().await) })).await;

    let mut registry = ToolRegistry::new();
    let mut failed = 0;
    for (provider, result) in results {
        match result {
            Ok(tools) => {
                debug!(provider, count = tools.len(), "Provider initialised");
                for tool in tools {
                    if registry.insert(policy.wrap(tool)).is_some() {
                        debug!(provider, "Tool name collision, later provider wins");
                    }
                }
            }
            Err(e) => {
                failed += 1;
                warn!(provider, error = %e, "Tool provider failed to initialise, skipping");
            }
        }
    }
    (registry, failed)
}

/// Shut down providers owned by a finished run. Errors are logged only.
pub async fn teardown(owned: Vec<Arc<dyn ToolProvider>>) {
    if owned.is_empty() {
        return;
    }
    for provider in owned {
        if let Err(e) = provider.shutdown().await {
            warn!(provider = provider.name(), error = %e, "Tool provider shutdown failed");
        }
    }
}

/// A registry handed to one run, plus the providers the run must tear down.
pub struct ToolLease {
    pub registry: Arc<ToolRegistry>,
    /// Empty when served from the process cache.
    pub owned: Vec<Arc<dyn ToolProvider>>,
}

pub type ProviderFactory = Arc<dyn Fn() -> Vec<Arc<dyn ToolProvider>> + Send + Sync>;

/// Process-lifetime cache of the merged registry.
pub struct ToolProviderCache {
    factory: ProviderFactory,
    policy: IsolationPolicy,
    enabled: bool,
    cached: OnceCell<(Arc<ToolRegistry>, Vec<Arc<dyn ToolProvider>>)>,
}

impl ToolProviderCache {
    pub fn new(factory: ProviderFactory, policy: IsolationPolicy, enabled: bool) -> Self {
        Self {
            factory,
            policy,
            enabled,
            cached: OnceCell::new(),
        }
    }

    /// Get a registry for one run.
    ///
    /// With caching enabled, concurrent first callers share one
    /// initialisation and every lease owns nothing. An initialisation in
    /// which a provider failed, or that produced no tools, is not cached:
    /// that lease owns its providers and the next lease tries again.
    pub async fn lease(&self) -> ToolLease {
        if !self.enabled {
            let providers = (self.factory)();
            let registry = merge_providers(&providers, &self.policy).await;
            return ToolLease {
                registry: Arc::new(registry),
                owned: providers,
            };
        }

        let cached = self
            .cached
            .get_or_try_init(|| async {
                let providers = (self.factory)();
                let (registry, failed) = merge_counting_failures(&providers, &self.policy).await;
                if failed > 0 || registry.is_empty() {
                    warn!(
                        failed,
                        tools = registry.len(),
                        "Incomplete tool provider initialisation, not caching"
                    );
                    return Err(ToolLease {
                        registry: Arc::new(registry),
                        owned: providers,
                    });
                }
                info!(tools = registry.len(), providers = providers.len(), "Tool provider cache initialised");
                Ok((Arc::new(registry), providers))
            })
            .await;

        match cached {
            Ok((registry, _)) => ToolLease {
                registry: Arc::clone(registry),
                owned: Vec::new(),
            },
            Err(uncached) => uncached,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cached.initialized()
    }

    /// Tear down cached providers at process exit.
    pub async fn shutdown(&self) {
        if let Some((_, providers)) = self.cached.get() {
            teardown(providers.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stepweave_core::error::ToolError;
    use stepweave_core::tool::{ToolContext, ToolOutput};

    struct Named {
        name: &'static str,
        marker: &'static str,
    }

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            self.marker
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn invoke(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::Value(json!(self.marker)))
        }
    }

    struct TestProvider {
        name: &'static str,
        tools: Vec<(&'static str, &'static str)>,
        fail: bool,
        inits: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl TestProvider {
        fn new(name: &'static str, tools: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                name,
                tools,
                fail: false,
                inits: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ToolProvider for TestProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                return Err(ToolError::ProviderUnavailable {
                    provider: self.name.into(),
                    reason: "unreachable".into(),
                });
            }
            Ok(self
                .tools
                .iter()
                .map(|&(name, marker)| Arc::new(Named { name, marker }) as Arc<dyn Tool>)
                .collect())
        }

        async fn shutdown(&self) -> Result<(), ToolError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn later_provider_wins_collisions() {
        let providers: Vec<Arc<dyn ToolProvider>> = vec![
            Arc::new(TestProvider::new("a", vec![("search", "from-a"), ("calc", "a")])),
            Arc::new(TestProvider::new("b", vec![("search", "from-b")])),
        ];
        let registry = merge_providers(&providers, &IsolationPolicy::default()).await;

        assert_eq!(registry.names(), vec!["calc", "search"]);
        assert_eq!(registry.get("search").unwrap().description(), "from-b");
    }

    #[tokio::test]
    async fn failing_provider_is_skipped() {
        let mut broken = TestProvider::new("broken", vec![("x", "x")]);
        broken.fail = true;
        let providers: Vec<Arc<dyn ToolProvider>> = vec![
            Arc::new(broken),
            Arc::new(TestProvider::new("ok", vec![("calc", "ok")])),
        ];
        let registry = merge_providers(&providers, &IsolationPolicy::default()).await;
        assert_eq!(registry.len(), 1);
        assert!(registry.get("x").is_none());
    }

    #[tokio::test]
    async fn approval_policy_marks_tools() {
        let providers: Vec<Arc<dyn ToolProvider>> =
            vec![Arc::new(TestProvider::new("a", vec![("delete", "d"), ("read", "r")]))];
        let policy = IsolationPolicy {
            call_timeout: Duration::from_secs(5),
            require_approval: HashSet::from(["delete".to_string()]),
        };
        let registry = merge_providers(&providers, &policy).await;
        assert!(registry.get("delete").unwrap().needs_approval());
        assert!(!registry.get("read").unwrap().needs_approval());
    }

    fn counting_factory(inits: Arc<AtomicUsize>, shutdowns: Arc<AtomicUsize>) -> ProviderFactory {
        Arc::new(move || {
            let mut provider = TestProvider::new("p", vec![("calc", "c")]);
            provider.inits = inits.clone();
            provider.shutdowns = shutdowns.clone();
            vec![Arc::new(provider) as Arc<dyn ToolProvider>]
        })
    }

    #[tokio::test]
    async fn cache_initialises_once_and_owns_nothing() {
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(ToolProviderCache::new(
            counting_factory(inits.clone(), shutdowns.clone()),
            IsolationPolicy::default(),
            true,
        ));

        let leases = join_all((0..8).map(|_| {
            let cache = cache.clone();
            async move { cache.lease().await }
        }))
        .await;

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(cache.is_initialized());
        for lease in leases {
            assert!(lease.owned.is_empty());
            assert_eq!(lease.registry.len(), 1);
            teardown(lease.owned).await;
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

        cache.shutdown().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncached_leases_own_fresh_providers() {
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let cache = ToolProviderCache::new(
            counting_factory(inits.clone(), shutdowns.clone()),
            IsolationPolicy::default(),
            false,
        );

        let first = cache.lease().await;
        let second = cache.lease().await;
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(first.owned.len(), 1);

        teardown(first.owned).await;
        teardown(second.owned).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        assert!(!cache.is_initialized());
    }

    #[tokio::test]
    async fn failed_initialisation_is_retried_on_next_lease() {
        let inits = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory: ProviderFactory = {
            let (inits, shutdowns) = (inits.clone(), shutdowns.clone());
            Arc::new(move || {
                let mut provider = TestProvider::new("flaky", vec![("calc", "c")]);
                provider.fail = attempts.fetch_add(1, Ordering::SeqCst) == 0;
                provider.inits = inits.clone();
                provider.shutdowns = shutdowns.clone();
                vec![Arc::new(provider) as Arc<dyn ToolProvider>]
            })
        };
        let cache = ToolProviderCache::new(factory, IsolationPolicy::default(), true);

        let first = cache.lease().await;
        assert!(first.registry.is_empty());
        assert_eq!(first.owned.len(), 1);
        assert!(!cache.is_initialized());
        teardown(first.owned).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let second = cache.lease().await;
        assert_eq!(second.registry.names(), vec!["calc"]);
        assert!(second.owned.is_empty());
        assert!(cache.is_initialized());

        cache.lease().await;
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_initialisation_is_not_cached() {
        let inits = Arc::new(AtomicUsize::new(0));
        let factory: ProviderFactory = {
            let inits = inits.clone();
            Arc::new(move || {
                let mut provider = TestProvider::new("empty", Vec::new());
                provider.inits = inits.clone();
                vec![Arc::new(provider) as Arc<dyn ToolProvider>]
            })
        };
        let cache = ToolProviderCache::new(factory, IsolationPolicy::default(), true);

        cache.lease().await;
        cache.lease().await;
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert!(!cache.is_initialized());
    }

    #[tokio::test]
    async fn teardown_of_nothing_is_a_no_op() {
        teardown(Vec::new()).await;
    }
}
