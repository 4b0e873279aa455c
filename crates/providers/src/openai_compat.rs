//! OpenAI-compatible streaming model implementation.
//!
//! Works with: OpenAI, OpenRouter, DeepSeek, Ollama, vLLM and any endpoint
//! exposing a streaming `/chat/completions`.
//!
//! The SSE byte stream is decoded on a spawned task into [`ModelEvent`]s:
//! text and reasoning deltas as they arrive, tool input fragments per call,
//! then the complete tool calls and one `StepFinish` once the response ends.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use stepweave_core::error::ModelError;
use stepweave_core::model::{
    FinishReason, Model, ModelEvent, ModelMessage, ModelRequest, ModelStream, ReasoningOptions,
    Usage,
};
use stepweave_core::tool::{ToolCall, ToolDefinition};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// A model served by an OpenAI-compatible endpoint.
pub struct OpenAiCompatModel {
    /// Routed id, e.g. "deepseek/deepseek-chat"
    id: String,
    /// Name sent to the endpoint, e.g. "deepseek-chat"
    api_model: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(
        id: impl Into<String>,
        api_model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            id: id.into(),
            api_model: api_model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn api_model(&self) -> &str {
        &self.api_model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the JSON body of a streaming completion request.
    fn request_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.api_model,
            "messages": to_api_messages(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.options.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        match &request.options.reasoning {
            Some(ReasoningOptions::Budget { budget_tokens }) => {
                body["reasoning"] = serde_json::json!({ "max_tokens": budget_tokens });
            }
            Some(ReasoningOptions::Level {
                level,
                include_thoughts,
            }) => {
                body["reasoning"] = serde_json::json!({
                    "effort": level,
                    "exclude": !include_thoughts,
                });
            }
            None => {}
        }

        body
    }
}

#[async_trait]
impl Model for OpenAiCompatModel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(&request);

        debug!(model = %self.id, api_model = %self.api_model, tools = request.tools.len(), "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ModelError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ModelError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status == 404 {
            return Err(ModelError::ModelNotFound(self.id.clone()));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Model endpoint streaming error");
            return Err(ModelError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let model_id = self.id.clone();

        // Spawn task to read the SSE byte stream and decode events
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for event in decoder.push(&bytes) {
                    if tx.send(Ok(event)).await.is_err() {
                        return; // receiver dropped
                    }
                }
                if decoder.is_done() {
                    break;
                }
            }

            trace!(model = %model_id, "Model stream ended");
            for event in decoder.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Convert model history to OpenAI API format.
fn to_api_messages(messages: &[ModelMessage]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| match m {
            ModelMessage::System { text } => ApiMessage::text("system", text),
            ModelMessage::User { text, files } => {
                if files.is_empty() {
                    return ApiMessage::text("user", text);
                }
                let mut content = vec![serde_json::json!({ "type": "text", "text": text })];
                for file in files {
                    if file.media_type.starts_with("image/") {
                        content.push(serde_json::json!({
                            "type": "image_url",
                            "image_url": { "url": file.url },
                        }));
                    } else {
                        let name = file.name.as_deref().unwrap_or("attachment");
                        content.push(serde_json::json!({
                            "type": "text",
                            "text": format!("[{name}]({})", file.url),
                        }));
                    }
                }
                ApiMessage {
                    role: "user".into(),
                    content: Some(serde_json::Value::Array(content)),
                    tool_calls: None,
                    tool_call_id: None,
                }
            }
            ModelMessage::Assistant {
                text, tool_calls, ..
            } => ApiMessage {
                role: "assistant".into(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::String(text.clone()))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.input.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: None,
            },
            ModelMessage::Tool {
                call_id, output, ..
            } => ApiMessage {
                role: "tool".into(),
                content: Some(serde_json::Value::String(match output {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            },
        })
        .collect()
}

/// Convert tool definitions to OpenAI API format.
fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

// --- SSE decoding ---

/// Incremental decoder from SSE text to model events.
#[derive(Default)]
struct SseDecoder {
    // Raw bytes; a read may end inside a multibyte character
    buffer: Vec<u8>,
    // Keyed by the call index of the response
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes; returns the events completed by them.
    ///
    /// Only complete lines are decoded.
    fn push(&mut self, bytes: impl AsRef<[u8]>) -> Vec<ModelEvent> {
        self.buffer.extend_from_slice(bytes.as_ref());
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                self.done = true;
                break;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(chunk) => self.apply(chunk, &mut events),
                Err(e) => {
                    trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                }
            }
        }

        events
    }

    fn apply(&mut self, chunk: StreamResponse, events: &mut Vec<ModelEvent>) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        let delta = choice.delta;

        if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning)
            && !reasoning.is_empty()
        {
            events.push(ModelEvent::ReasoningDelta(reasoning));
        }

        if let Some(content) = delta.content
            && !content.is_empty()
        {
            events.push(ModelEvent::TextDelta(content));
        }

        for tc_delta in delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(tc_delta.index).or_default();

            if let Some(id) = tc_delta.id {
                acc.id = id;
            }
            if let Some(func) = tc_delta.function {
                if let Some(name) = func.name {
                    acc.name = name;
                }
                if !acc.started && !acc.id.is_empty() && !acc.name.is_empty() {
                    acc.started = true;
                    events.push(ModelEvent::ToolInputStart {
                        call_id: acc.id.clone(),
                        tool_name: acc.name.clone(),
                    });
                }
                if let Some(args) = func.arguments
                    && !args.is_empty()
                {
                    acc.arguments.push_str(&args);
                    if acc.started {
                        events.push(ModelEvent::ToolInputDelta {
                            call_id: acc.id.clone(),
                            delta: args,
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    /// Complete tool calls followed by the step-finish marker.
    fn finish(&mut self) -> Vec<ModelEvent> {
        let mut events: Vec<ModelEvent> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .filter(|acc| !acc.name.is_empty())
            .map(|acc| ModelEvent::ToolCall(acc.into_tool_call()))
            .collect();

        let reason = match self.finish_reason.as_deref() {
            Some(reason) => FinishReason::from_wire(reason),
            None if !events.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };
        events.push(ModelEvent::StepFinish {
            reason,
            usage: self.usage,
        });
        events
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ToolCall {
        let input = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments)
                .unwrap_or(serde_json::Value::String(self.arguments))
        };
        ToolCall {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(serde_json::Value::String(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    /// DeepSeek
    #[serde(default)]
    reasoning_content: Option<String>,
    /// OpenRouter
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta. Arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_core::message::FileRef;
    use stepweave_core::model::ModelOptions;

    fn model() -> OpenAiCompatModel {
        OpenAiCompatModel::new(
            "deepseek/deepseek-chat",
            "deepseek-chat",
            "https://api.deepseek.com/v1/",
            "sk-test",
        )
    }

    #[test]
    fn constructor_trims_base_url() {
        let m = model();
        assert_eq!(m.id(), "deepseek/deepseek-chat");
        assert_eq!(m.base_url(), "https://api.deepseek.com/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![
            ModelMessage::System {
                text: "You are helpful".into(),
            },
            ModelMessage::User {
                text: "Hello".into(),
                files: vec![],
            },
        ];
        let api = to_api_messages(&messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[1].content, Some(serde_json::json!("Hello")));
    }

    #[test]
    fn user_images_become_content_parts() {
        let messages = vec![ModelMessage::User {
            text: "What is this?".into(),
            files: vec![FileRef {
                url: "https://example.com/cat.png".into(),
                media_type: "image/png".into(),
                name: None,
            }],
        }];
        let api = to_api_messages(&messages);
        let content = api[0].content.as_ref().unwrap();
        assert_eq!(content[1]["type"], "image_url");
    }

    #[test]
    fn tool_call_and_result_conversion() {
        let messages = vec![
            ModelMessage::Assistant {
                text: String::new(),
                reasoning: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "search".into(),
                    input: serde_json::json!({"q": "rust"}),
                }],
            },
            ModelMessage::Tool {
                call_id: "call_1".into(),
                tool_name: "search".into(),
                output: serde_json::json!({"hits": 1}),
            },
        ];
        let api = to_api_messages(&messages);
        assert!(api[0].content.is_none());
        let tc = api[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].function.arguments, r#"{"q":"rust"}"#);
        assert_eq!(api[1].role, "tool");
        assert_eq!(api[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(api[1].content, Some(serde_json::json!(r#"{"hits":1}"#)));
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "search".into(),
            description: "Search the web".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let api_tools = to_api_tools(&tools);
        assert_eq!(api_tools[0].function.name, "search");
        assert_eq!(api_tools[0].r#type, "function");
    }

    #[test]
    fn request_body_carries_reasoning_options() {
        let request = ModelRequest {
            messages: vec![],
            tools: vec![],
            options: ModelOptions {
                reasoning: Some(ReasoningOptions::Budget {
                    budget_tokens: 10_000,
                }),
                ..ModelOptions::default()
            },
        };
        let body = model().request_body(&request);
        assert_eq!(body["model"], "deepseek-chat");
        assert_eq!(body["stream"], true);
        assert_eq!(body["reasoning"]["max_tokens"], 10_000);
        assert!(body.get("tools").is_none());
    }

    // --- SSE decoding tests ---

    #[test]
    fn decodes_text_split_across_reads() {
        let mut decoder = SseDecoder::default();
        let mut events = decoder.push("data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(events.is_empty());
        events.extend(decoder.push("lo\"},\"finish_reason\":null}]}\n\n"));
        events.extend(decoder.push("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n"));
        assert!(decoder.is_done());
        events.extend(decoder.finish());

        assert_eq!(
            events,
            vec![
                ModelEvent::TextDelta("Hello".into()),
                ModelEvent::StepFinish {
                    reason: FinishReason::Stop,
                    usage: None,
                },
            ]
        );
    }

    #[test]
    fn multibyte_character_split_across_reads() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"},\"finish_reason\":null}]}\n";
        let bytes = frame.as_bytes();
        // Cut between the two bytes of "é"
        let cut = frame.find('é').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        let mut events = decoder.push(&bytes[..cut]);
        assert!(events.is_empty());
        events.extend(decoder.push(&bytes[cut..]));

        assert_eq!(events, vec![ModelEvent::TextDelta("café".into())]);
    }

    #[test]
    fn decodes_reasoning_content() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\"},\"finish_reason\":null}]}\n",
        );
        assert_eq!(events, vec![ModelEvent::ReasoningDelta("hmm".into())]);
    }

    #[test]
    fn accumulates_tool_calls_in_index_order() {
        let mut decoder = SseDecoder::default();
        let mut events = decoder.push(concat!(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"calc","arguments":""}},{"index":0,"id":"call_a","function":{"name":"search","arguments":""}}]},"finish_reason":null}]}"#,
            "\n",
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]},"finish_reason":null}]}"#,
            "\n",
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            "\n",
            r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            "\n",
        ));
        events.extend(decoder.finish());

        assert_eq!(
            events[0],
            ModelEvent::ToolInputStart {
                call_id: "call_b".into(),
                tool_name: "calc".into()
            }
        );
        assert_eq!(
            events[2],
            ModelEvent::ToolInputDelta {
                call_id: "call_a".into(),
                delta: "{\"q\":".into()
            }
        );
        let calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::ToolCall(tc) => Some(tc.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].input, serde_json::json!({"q": "rust"}));
        assert_eq!(calls[1].input, serde_json::json!({}));

        match events.last().unwrap() {
            ModelEvent::StepFinish { reason, usage } => {
                assert_eq!(*reason, FinishReason::ToolCalls);
                assert_eq!(usage.unwrap().total_tokens, 15);
            }
            other => panic!("expected StepFinish, got {other:?}"),
        }
    }

    #[test]
    fn ignores_comments_and_garbage() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(": keep-alive\n\ndata: not json\n\nevent: ping\n");
        assert!(events.is_empty());
        assert!(!decoder.is_done());
    }
}
