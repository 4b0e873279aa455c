//! Tool isolation wrapper.
//!
//! [`IsolatedTool`] runs every invocation on its own task under a deadline,
//! so a tool that panics, fails or hangs yields a `ToolError` value instead
//! of taking the run down with it.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepweave_core::error::ToolError;
use stepweave_core::tool::{Tool, ToolContext, ToolOutput};
use tracing::{debug, warn};

/// A tool wrapped with a per-call deadline and panic capture.
pub struct IsolatedTool {
    inner: Arc<dyn Tool>,
    timeout: Duration,
    needs_approval: bool,
}

impl IsolatedTool {
    pub fn new(inner: Arc<dyn Tool>, timeout: Duration) -> Self {
        let needs_approval = inner.needs_approval();
        Self {
            inner,
            timeout,
            needs_approval,
        }
    }

    /// Require user approval regardless of what the tool itself declares.
    #[must_use]
    pub fn with_approval(mut self, required: bool) -> Self {
        self.needs_approval |= required;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Tool for IsolatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    fn needs_approval(&self) -> bool {
        self.needs_approval
    }

    /// Always resolves, at the latest when the deadline passes.
    ///
    /// The deadline covers producing the output. A streamed output is handed
    /// back as is and its consumption is not timed.
    async fn invoke(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool_name = self.inner.name().to_string();
        let tool = Arc::clone(&self.inner);
        let started = Instant::now();

        let handle = tokio::spawn(async move { tool.invoke(input, ctx).await });
        let abort = handle.abort_handle();

        let result = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!(tool = %tool_name, %message, "Tool panicked");
                Err(ToolError::Panicked { tool_name, message })
            }
            Ok(Err(join_err)) => Err(ToolError::ExecutionFailed {
                tool_name,
                reason: join_err.to_string(),
            }),
            Err(_) => {
                abort.abort();
                warn!(tool = %tool_name, timeout_secs = self.timeout.as_secs(), "Tool timed out");
                Err(ToolError::Timeout {
                    tool_name,
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        debug!(
            tool = %self.inner.name(),
            ok = result.is_ok(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool invocation settled"
        );
        result
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
