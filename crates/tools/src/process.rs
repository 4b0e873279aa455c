//! Subprocess tool provider.
//!
//! Starts a tool server as a child process and talks line-delimited
//! JSON-RPC 2.0 over its stdin/stdout:
//!
//! - `tools/list` → `{ "tools": [{ "name", "description", "inputSchema" }] }`
//! - `tools/call` with `{ "name", "arguments" }` → `{ "content": …, "isError"? }`
//!
//! Calls on one connection are serialised and each waits at most the
//! provider's timeout for its response. Shutdown kills the child.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use stepweave_config::ProcessProviderConfig;
use stepweave_core::error::ToolError;
use stepweave_core::tool::{Tool, ToolContext, ToolOutput, ToolProvider};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(90);

/// One live JSON-RPC connection to a child process.
struct RpcConnection {
    provider: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    timeout: Duration,
}

impl RpcConnection {
    fn spawn(config: &ProcessProviderConfig, timeout: Duration) -> Result<Self, ToolError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(&config.name, format!("spawn {}: {e}", config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable(&config.name, "child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable(&config.name, "child stdout not captured"))?;

        Ok(Self {
            provider: config.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            timeout,
        })
    }

    /// Send one request and wait for the response with the same id.
    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange(method, params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %self.provider, method, ?timeout, "Tool process did not answer in time");
                Err(unavailable(
                    &self.provider,
                    format!("{method} timed out after {}s", timeout.as_secs_f32()),
                ))
            }
        }
    }

    async fn exchange(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
            .to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| unavailable(&self.provider, format!("write: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| unavailable(&self.provider, format!("flush: {e}")))?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| unavailable(&self.provider, format!("read: {e}")))?
                .ok_or_else(|| unavailable(&self.provider, "process closed stdout"))?;

            let Ok(response) = serde_json::from_str::<RpcResponse>(&line) else {
                trace!(provider = %self.provider, line = %line, "Skipping non-JSON-RPC output");
                continue;
            };
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                return Err(ToolError::ExecutionFailed {
                    tool_name: method.to_string(),
                    reason: error.message,
                });
            }
            return Ok(response.result.unwrap_or(serde_json::Value::Null));
        }
    }
}

fn unavailable(provider: &str, reason: impl Into<String>) -> ToolError {
    ToolError::ProviderUnavailable {
        provider: provider.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_schema")]
    input_schema: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    json!({ "type": "object" })
}

/// Provider backed by a child process.
pub struct ProcessToolProvider {
    config: ProcessProviderConfig,
    timeout: Duration,
    connection: Mutex<Option<Arc<Mutex<RpcConnection>>>>,
}

impl ProcessToolProvider {
    pub fn new(config: ProcessProviderConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_RPC_TIMEOUT,
            connection: Mutex::new(None),
        }
    }

    /// Upper bound on each JSON-RPC round trip, `tools/list` included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn missing_env(&self) -> Option<&str> {
        self.config
            .required_env
            .iter()
            .find(|var| std::env::var_os(var.as_str()).is_none() && !self.config.env.contains_key(*var))
            .map(String::as_str)
    }
}

#[async_trait]
impl ToolProvider for ProcessToolProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
        if let Some(var) = self.missing_env() {
            info!(provider = %self.config.name, var, "Required environment variable not set, provider disabled");
            return Ok(Vec::new());
        }

        let mut connection = RpcConnection::spawn(&self.config, self.timeout)?;
        let listed = connection.request("tools/list", json!({})).await?;
        let listed: Vec<ListedTool> = serde_json::from_value(listed["tools"].clone())
            .map_err(|e| unavailable(&self.config.name, format!("bad tools/list result: {e}")))?;

        debug!(provider = %self.config.name, count = listed.len(), "Listed process tools");

        let connection = Arc::new(Mutex::new(connection));
        if let Some(previous) = self.connection.lock().await.replace(connection.clone()) {
            let _ = previous.lock().await.child.kill().await;
        }

        Ok(listed
            .into_iter()
            .map(|t| {
                Arc::new(ProcessTool {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                    connection: connection.clone(),
                }) as Arc<dyn Tool>
            })
            .collect())
    }

    async fn shutdown(&self) -> Result<(), ToolError> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        let mut connection = connection.lock().await;
        debug!(provider = %self.config.name, "Killing tool process");
        connection
            .child
            .kill()
            .await
            .map_err(|e| unavailable(&self.config.name, format!("kill: {e}")))
    }
}

/// A tool exposed by a child process.
struct ProcessTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    connection: Arc<Mutex<RpcConnection>>,
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let result = self
            .connection
            .lock()
            .await
            .request("tools/call", json!({ "name": self.name, "arguments": input }))
            .await?;

        if result["isError"].as_bool() == Some(true) {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: result["content"].to_string(),
            });
        }
        Ok(ToolOutput::Value(result))
    }
}
