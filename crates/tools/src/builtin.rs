//! Static in-process provider.

use async_trait::async_trait;
use std::sync::Arc;
use stepweave_core::error::ToolError;
use stepweave_core::tool::{Tool, ToolProvider};

/// A provider with a fixed tool set and nothing to tear down.
pub struct StaticToolProvider {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolProvider {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

#[async_trait]
impl ToolProvider for StaticToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        Ok(self.tools.clone())
    }
}
