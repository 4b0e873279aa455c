//! Tool execution for Stepweave.
//!
//! - [`isolation`]: the per-call wrapper that turns panics, errors and
//!   hangs into `ToolError` values.
//! - [`registry`]: parallel provider initialisation, name merge, the
//!   process-lifetime provider cache and teardown.
//! - [`builtin`], [`process`]: concrete providers.
//! - [`documents`]: document tools streaming content into the run's
//!   side channel.

pub mod builtin;
pub mod documents;
pub mod isolation;
pub mod process;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;
use stepweave_config::ToolsConfig;
use stepweave_core::model::Model;
use stepweave_core::store::ChatStore;
use stepweave_core::tool::{Tool, ToolProvider};

pub use builtin::StaticToolProvider;
pub use documents::{CreateDocumentTool, UpdateDocumentTool};
pub use isolation::IsolatedTool;
pub use process::ProcessToolProvider;
pub use registry::{
    IsolationPolicy, ProviderFactory, ToolLease, ToolProviderCache, ToolRegistry, merge_providers,
    teardown,
};

/// Build the provider factory described by the tool configuration.
///
/// The document provider comes first, so a configured process provider
/// exposing a tool of the same name replaces it.
pub fn provider_factory(
    config: &ToolsConfig,
    artifact_model: Arc<dyn Model>,
    store: Arc<dyn ChatStore>,
) -> ProviderFactory {
    let documents = config.documents;
    let processes = config.providers.clone();
    let rpc_timeout = Duration::from_secs(config.call_timeout_secs);

    Arc::new(move || {
        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
        if documents {
            let tools: Vec<Arc<dyn Tool>> = vec![
                Arc::new(CreateDocumentTool::new(artifact_model.clone(), store.clone())),
                Arc::new(UpdateDocumentTool::new(artifact_model.clone(), store.clone())),
            ];
            providers.push(Arc::new(StaticToolProvider::new("documents", tools)));
        }
        for process in &processes {
            providers.push(Arc::new(
                ProcessToolProvider::new(process.clone()).with_timeout(rpc_timeout),
            ));
        }
        providers
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stepweave_config::ProcessProviderConfig;
    use stepweave_core::error::ModelError;
    use stepweave_core::model::{ModelRequest, ModelStream};
    use stepweave_store::InMemoryChatStore;

    struct Silent;

    #[async_trait]
    impl Model for Silent {
        fn id(&self) -> &str {
            "silent"
        }
        async fn run(&self, _request: ModelRequest) -> Result<ModelStream, ModelError> {
            Err(ModelError::NotConfigured("silent".into()))
        }
    }

    #[tokio::test]
    async fn factory_registers_document_tools() {
        let factory = provider_factory(
            &ToolsConfig::default(),
            Arc::new(Silent),
            Arc::new(InMemoryChatStore::default()),
        );
        let providers = factory();
        assert_eq!(providers.len(), 1);

        let registry = merge_providers(&providers, &IsolationPolicy::default()).await;
        assert_eq!(registry.names(), vec!["create_document", "update_document"]);
    }

    #[test]
    fn factory_adds_process_providers_and_respects_toggle() {
        let config = ToolsConfig {
            documents: false,
            providers: vec![ProcessProviderConfig {
                name: "search".into(),
                command: "search-server".into(),
                args: Vec::new(),
                env: Default::default(),
                required_env: vec!["SEARCH_API_KEY".into()],
            }],
            ..ToolsConfig::default()
        };
        let factory = provider_factory(
            &config,
            Arc::new(Silent),
            Arc::new(InMemoryChatStore::default()),
        );
        let providers = factory();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "search");
    }
}
