//! Model router: resolves a model id to a ready-to-run [`Model`].
//!
//! Routing rules, in order:
//! 1. explicitly registered models (scripted models, tests);
//! 2. a `-thinking` suffix is stripped and the resolved model is wrapped in
//!    [`ExtractReasoning`] with the `thinking` tag;
//! 3. a `<prefix>/` with a configured endpoint is served there with the
//!    prefix stripped (`deepseek/deepseek-chat` → `deepseek-chat`);
//! 4. everything else goes to the default endpoint with the id unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use stepweave_config::{AppConfig, EndpointConfig};
use stepweave_core::model::Model;
use tracing::debug;

use crate::openai_compat::OpenAiCompatModel;
use crate::reasoning::ExtractReasoning;

const THINKING_SUFFIX: &str = "-thinking";

/// Routes model ids to model backends.
pub struct ModelRouter {
    registered: HashMap<String, Arc<dyn Model>>,
    endpoints: HashMap<String, EndpointConfig>,
    default_endpoint: EndpointConfig,
    /// Fallback key for endpoints without their own
    api_key: Option<String>,
    default_model: String,
}

impl ModelRouter {
    pub fn new(default_endpoint: EndpointConfig, default_model: impl Into<String>) -> Self {
        Self {
            registered: HashMap::new(),
            endpoints: HashMap::new(),
            default_endpoint,
            api_key: None,
            default_model: default_model.into(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Serve `<prefix>/*` model ids from `endpoint`.
    #[must_use]
    pub fn with_endpoint(mut self, prefix: impl Into<String>, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(prefix.into(), endpoint);
        self
    }

    /// Register a model under its own id, bypassing endpoint routing.
    pub fn register(&mut self, model: Arc<dyn Model>) {
        self.registered.insert(model.id().to_string(), model);
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Resolve a model id. `None` resolves the default model.
    pub fn resolve(&self, model_id: Option<&str>) -> Arc<dyn Model> {
        let model_id = model_id.unwrap_or(&self.default_model);

        if let Some(model) = self.registered.get(model_id) {
            return model.clone();
        }

        if let Some(base) = model_id.strip_suffix(THINKING_SUFFIX) {
            debug!(model = %model_id, "Routing with <thinking> reasoning extraction");
            let inner = self.endpoint_model(model_id, base);
            return Arc::new(ExtractReasoning::new(inner, "thinking"));
        }

        self.endpoint_model(model_id, model_id)
    }

    /// Build an endpoint-backed model reporting `id` and requesting `routed`.
    fn endpoint_model(&self, id: &str, routed: &str) -> Arc<dyn Model> {
        let (endpoint, api_model) = self.route(routed);

        let api_key = endpoint
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .unwrap_or_default();

        Arc::new(OpenAiCompatModel::new(
            id,
            api_model,
            &endpoint.api_url,
            api_key,
        ))
    }

    /// Pick the endpoint for `model_id` and the model name sent to it.
    fn route<'a>(&'a self, model_id: &'a str) -> (&'a EndpointConfig, &'a str) {
        match model_id.split_once('/') {
            Some((prefix, rest)) => match self.endpoints.get(prefix) {
                Some(endpoint) => (endpoint, rest),
                None => (&self.default_endpoint, model_id),
            },
            None => (&self.default_endpoint, model_id),
        }
    }
}

/// Build the router from configuration.
pub fn build_from_config(config: &AppConfig) -> ModelRouter {
    let mut router = ModelRouter::new(
        config.models.default_endpoint.clone(),
        &config.models.default_model,
    )
    .with_api_key(config.api_key.clone());

    for (prefix, endpoint) in &config.models.endpoints {
        router = router.with_endpoint(prefix.clone(), endpoint.clone());
    }

    router
}
