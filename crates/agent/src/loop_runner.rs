//! The agent loop.
//!
//! A run alternates model calls and tool execution:
//!
//! 1. **Resolve** calls carried in from an approval flow (answered by the
//!    user in an earlier request) without calling the model again
//! 2. **Call the model** with the history, the tool definitions and the
//!    reasoning options of the model id
//! 3. **Dispatch** every requested tool call on its own task as soon as the
//!    model emits it
//! 4. **Join** all calls of the step and append their results to the history
//! 5. Loop back to 2, until a step requests no tools, the step ceiling is
//!    reached, the model fails or the run deadline passes
//!
//! Everything the run does is written to a [`UiStreamWriter`] as it happens.

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepweave_config::AgentConfig;
use stepweave_core::error::{ModelError, ToolError};
use stepweave_core::event::{DomainEvent, EventBus};
use stepweave_core::message::{Message, Role, ToolInvocation, ToolState, generate_id};
use stepweave_core::model::{
    Model, ModelEvent, ModelMessage, ModelOptions, ModelRequest, ReasoningOptions,
};
use stepweave_core::stream::{UiEvent, UiStreamWriter};
use stepweave_core::tool::{Tool, ToolCall, ToolContext, ToolOutput};
use stepweave_tools::{IsolatedTool, ToolRegistry};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::convert::{convert_to_model_messages, denial};
use crate::multiplexer::interruption_events;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A step finished without requesting tools.
    Finished,
    /// The step ceiling was reached.
    MaxSteps,
    /// The model failed.
    Fatal(String),
    /// The whole-run deadline passed.
    TimedOut,
}

impl StopReason {
    /// `finishReason` of the closing `finish` event.
    pub fn finish_reason(&self) -> &'static str {
        match self {
            Self::Finished => "stop",
            Self::MaxSteps => "length",
            Self::Fatal(_) | Self::TimedOut => "error",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::MaxSteps => "max_steps",
            Self::Fatal(_) => "fatal",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopPhase {
    Running,
    AwaitingModel,
    ExecutingTools,
    Stopped(StopReason),
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub stop_reason: StopReason,
    pub steps: usize,
}

/// Reasoning options for a model id.
///
/// Ids naming a reasoning or thinking variant get a token budget; Gemini 3
/// models get the `high` thinking level with thoughts included.
pub fn reasoning_options(model_id: &str, budget_tokens: u32) -> Option<ReasoningOptions> {
    if model_id.contains("reasoning") || model_id.contains("thinking") {
        Some(ReasoningOptions::Budget { budget_tokens })
    } else if model_id.starts_with("google/gemini-3") {
        Some(ReasoningOptions::Level {
            level: "high".into(),
            include_thoughts: true,
        })
    } else {
        None
    }
}

/// How a tool call resolved.
#[derive(Debug, Clone)]
enum Resolution {
    /// The tool produced a value.
    Output(serde_json::Value),
    /// The tool failed; the `{error}` payload was reported as its output.
    Failed(serde_json::Value),
    /// The call could not be run at all.
    Error(String),
    Denied(Option<String>),
}

impl Resolution {
    fn model_value(&self) -> serde_json::Value {
        match self {
            Self::Output(v) | Self::Failed(v) => v.clone(),
            Self::Error(message) => json!({ "error": message }),
            Self::Denied(reason) => denial(reason.clone()),
        }
    }

    fn apply(&self, inv: &mut ToolInvocation) {
        match self {
            Self::Output(v) | Self::Failed(v) => {
                inv.state = ToolState::OutputAvailable;
                inv.output = Some(v.clone());
                inv.preliminary = false;
            }
            Self::Error(message) => {
                inv.state = ToolState::OutputError;
                inv.error_text = Some(message.clone());
            }
            Self::Denied(_) => inv.state = ToolState::OutputDenied,
        }
    }
}

struct LoopState {
    run_id: String,
    phase: LoopPhase,
    steps: usize,
    history: Vec<ModelMessage>,
    /// Calls dispatched in the current step that have no result yet.
    unresolved: Vec<String>,
}

impl LoopState {
    fn enter(&mut self, phase: LoopPhase) {
        debug!(run_id = %self.run_id, from = ?self.phase, to = ?phase, "Loop phase");
        self.phase = phase;
    }
}

/// The agent loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    model: Arc<dyn Model>,

    /// Merged, isolated tools of this run
    tools: Arc<ToolRegistry>,

    approvals: Arc<ApprovalGate>,

    event_bus: Arc<EventBus>,

    system_prompt: String,

    /// Maximum model invocations per run
    max_steps: usize,

    run_timeout: Duration,

    reasoning_budget_tokens: u32,

    temperature: Option<f32>,

    user_id: Option<String>,

    chat_id: Option<String>,
}

impl AgentLoop {
    pub fn new(model: Arc<dyn Model>, tools: Arc<ToolRegistry>) -> Self {
        Self::from_config(model, tools, &AgentConfig::default())
    }

    pub fn from_config(model: Arc<dyn Model>, tools: Arc<ToolRegistry>, config: &AgentConfig) -> Self {
        Self {
            model,
            tools,
            approvals: Arc::new(ApprovalGate::new()),
            event_bus: Arc::new(EventBus::default()),
            system_prompt: config.system_prompt.clone(),
            max_steps: config.max_steps.max(1),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            reasoning_budget_tokens: config.reasoning_budget_tokens,
            temperature: config.temperature,
            user_id: None,
            chat_id: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Share an approval gate with the transport answering approvals.
    pub fn with_approvals(mut self, approvals: Arc<ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Run the loop over `messages` and write everything to `writer`.
    ///
    /// When the last message is an assistant message with answered approval
    /// requests, the run continues that message: its id is reused and the
    /// answered calls are resolved before the first model call.
    pub async fn run(&self, mut messages: Vec<Message>, writer: UiStreamWriter) -> RunOutcome {
        let continuing = messages.last().is_some_and(|m| {
            m.role == Role::Assistant
                && m.tool_invocations()
                    .any(|inv| inv.state == ToolState::ApprovalResponded)
        });
        let carried = if continuing { messages.pop() } else { None };
        let message_id = carried
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_else(generate_id);

        let mut state = LoopState {
            run_id: generate_id(),
            phase: LoopPhase::Running,
            steps: 0,
            history: Vec::new(),
            unresolved: Vec::new(),
        };

        info!(
            run_id = %state.run_id,
            model = %self.model.id(),
            messages = messages.len(),
            continuing,
            "Starting agent run"
        );
        self.event_bus.publish(DomainEvent::RunStarted {
            run_id: state.run_id.clone(),
            chat_id: self.chat_id.clone().unwrap_or_default(),
            model: self.model.id().to_string(),
            timestamp: Utc::now(),
        });

        writer.write(UiEvent::start(message_id));

        let driven = tokio::time::timeout(
            self.run_timeout,
            self.drive(&mut state, messages, carried, &writer),
        )
        .await;
        let stop_reason = match driven {
            Ok(reason) => reason,
            Err(_) => {
                self.abandon(&mut state, &writer).await;
                StopReason::TimedOut
            }
        };

        match &stop_reason {
            StopReason::Fatal(cause) => {
                for event in interruption_events(cause) {
                    writer.write(event);
                }
            }
            StopReason::TimedOut => {
                let cause = format!("Run timed out after {}s", self.run_timeout.as_secs());
                for event in interruption_events(&cause) {
                    writer.write(event);
                }
            }
            reason => writer.write(UiEvent::finish(reason.finish_reason())),
        }

        info!(
            run_id = %state.run_id,
            reason = stop_reason.as_str(),
            steps = state.steps,
            "Agent run stopped"
        );
        self.event_bus.publish(DomainEvent::RunStopped {
            run_id: state.run_id.clone(),
            reason: stop_reason.as_str().to_string(),
            steps: state.steps,
            timestamp: Utc::now(),
        });
        state.enter(LoopPhase::Stopped(stop_reason.clone()));

        RunOutcome {
            run_id: state.run_id,
            stop_reason,
            steps: state.steps,
        }
    }

    async fn drive(
        &self,
        state: &mut LoopState,
        mut messages: Vec<Message>,
        carried: Option<Message>,
        writer: &UiStreamWriter,
    ) -> StopReason {
        if let Some(mut message) = carried {
            self.resolve_carried(state, &mut message, writer).await;
            messages.push(message);
        }

        state.history = vec![ModelMessage::System {
            text: self.system_prompt.clone(),
        }];
        state.history.extend(convert_to_model_messages(&messages));

        loop {
            let step = self.step(state, writer).await;
            state.steps += 1;
            match step {
                Err(e) => {
                    warn!(run_id = %state.run_id, error = %e, "Model call failed");
                    return StopReason::Fatal(e.to_string());
                }
                Ok(0) => return StopReason::Finished,
                Ok(_) if state.steps >= self.max_steps => {
                    warn!(run_id = %state.run_id, steps = state.steps, "Step ceiling reached");
                    return StopReason::MaxSteps;
                }
                Ok(_) => state.enter(LoopPhase::Running),
            }
        }
    }

    /// Resolve calls the user answered before this request.
    async fn resolve_carried(
        &self,
        state: &mut LoopState,
        message: &mut Message,
        writer: &UiStreamWriter,
    ) {
        let answered: Vec<ToolInvocation> = message
            .tool_invocations()
            .filter(|inv| inv.state == ToolState::ApprovalResponded)
            .cloned()
            .collect();
        debug!(run_id = %state.run_id, count = answered.len(), "Resolving answered approvals");

        state.enter(LoopPhase::ExecutingTools);
        let mut tasks = JoinSet::new();
        for inv in &answered {
            let call = ToolCall {
                id: inv.tool_call_id.clone(),
                name: inv.tool_name.clone(),
                input: inv.input.clone().unwrap_or_else(|| json!({})),
            };
            let decision = ApprovalDecision {
                approved: inv.approval_answer() == Some(true),
                reason: inv.approval.as_ref().and_then(|a| a.reason.clone()),
            };
            state.unresolved.push(call.id.clone());
            self.dispatch(&mut tasks, &state.run_id, call, Some(decision), writer);
        }

        let mut results = self.join_calls(&mut tasks, state, writer).await;
        for mut inv in answered {
            if let Some(resolution) = results.remove(&inv.tool_call_id) {
                resolution.apply(&mut inv);
                message.upsert_tool_invocation(inv);
            }
        }
        state.enter(LoopPhase::Running);
    }

    /// One model call plus the tool calls it requested.
    ///
    /// Returns the number of tool calls.
    async fn step(&self, state: &mut LoopState, writer: &UiStreamWriter) -> Result<usize, ModelError> {
        state.enter(LoopPhase::AwaitingModel);
        writer.write(UiEvent::StartStep);

        let request = ModelRequest {
            messages: state.history.clone(),
            tools: self.tools.definitions(),
            options: ModelOptions {
                reasoning: reasoning_options(self.model.id(), self.reasoning_budget_tokens),
                temperature: self.temperature,
                max_output_tokens: None,
            },
        };

        let mut stream = match self.model.run(request).await {
            Ok(stream) => stream,
            Err(e) => {
                writer.write(UiEvent::FinishStep);
                return Err(e);
            }
        };

        let mut blocks = Blocks::new(writer);
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut tasks = JoinSet::new();
        let mut failure = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(ModelEvent::TextDelta(delta)) => blocks.text(&delta),
                Ok(ModelEvent::ReasoningDelta(delta)) => blocks.reasoning(&delta),
                Ok(ModelEvent::ToolInputStart { call_id, tool_name }) => {
                    // Later text belongs after the tool part
                    blocks.end_open();
                    writer.write(UiEvent::tool_input_start(call_id, tool_name));
                }
                Ok(ModelEvent::ToolInputDelta { call_id, delta }) => {
                    writer.write(UiEvent::tool_input_delta(call_id, delta));
                }
                Ok(ModelEvent::ToolCall(call)) => {
                    debug!(run_id = %state.run_id, tool = %call.name, call_id = %call.id, "Dispatching tool call");
                    blocks.end_open();
                    writer.write(UiEvent::tool_input_available(
                        &call.id,
                        &call.name,
                        call.input.clone(),
                    ));
                    state.unresolved.push(call.id.clone());
                    self.dispatch(&mut tasks, &state.run_id, call.clone(), None, writer);
                    calls.push(call);
                }
                Ok(ModelEvent::StepFinish { reason, usage }) => {
                    debug!(run_id = %state.run_id, ?reason, ?usage, "Model step finished");
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let (text, reasoning) = blocks.close();

        state.enter(LoopPhase::ExecutingTools);
        let mut results = self.join_calls(&mut tasks, state, writer).await;

        state.history.push(ModelMessage::Assistant {
            text,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: calls.clone(),
        });
        for call in &calls {
            let output = results
                .remove(&call.id)
                .map(|r| r.model_value())
                .unwrap_or_else(|| json!({ "error": "Tool call produced no result" }));
            state.history.push(ModelMessage::Tool {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output,
            });
        }

        writer.write(UiEvent::FinishStep);
        self.event_bus.publish(DomainEvent::StepCompleted {
            run_id: state.run_id.clone(),
            step: state.steps + 1,
            tool_calls: calls.len(),
            timestamp: Utc::now(),
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(calls.len()),
        }
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<(String, Resolution)>,
        run_id: &str,
        call: ToolCall,
        answered: Option<ApprovalDecision>,
        writer: &UiStreamWriter,
    ) {
        let env = CallEnv {
            tool: self.tools.get(&call.name),
            writer: writer.clone(),
            approvals: Arc::clone(&self.approvals),
            event_bus: Arc::clone(&self.event_bus),
            run_id: run_id.to_string(),
            user_id: self.user_id.clone(),
            chat_id: self.chat_id.clone(),
        };
        tasks.spawn(env.run(call, answered));
    }

    /// Wait for every dispatched call. A call whose task died resolves as
    /// `output-error`.
    async fn join_calls(
        &self,
        tasks: &mut JoinSet<(String, Resolution)>,
        state: &mut LoopState,
        writer: &UiStreamWriter,
    ) -> HashMap<String, Resolution> {
        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((call_id, resolution)) => {
                    state.unresolved.retain(|id| id != &call_id);
                    results.insert(call_id, resolution);
                }
                Err(e) => warn!(run_id = %state.run_id, error = %e, "Tool task failed"),
            }
        }

        for call_id in state.unresolved.drain(..) {
            let message = "Tool task failed".to_string();
            writer.write(UiEvent::tool_output_error(&call_id, &message));
            results.insert(call_id, Resolution::Error(message));
        }
        results
    }

    /// Close calls left open by the run deadline.
    ///
    /// Calls parked on an approval keep their `approval-requested` state so
    /// a later request can continue them; everything else is failed.
    async fn abandon(&self, state: &mut LoopState, writer: &UiStreamWriter) {
        for call_id in state.unresolved.drain(..) {
            if let Some(approval_id) = self.approvals.pending_for_call(&call_id).await {
                self.approvals.withdraw(&approval_id).await;
                info!(run_id = %state.run_id, call_id = %call_id, approval_id = %approval_id, "Approval left open");
                continue;
            }
            writer.write(UiEvent::tool_output_error(&call_id, "Run timed out"));
        }
    }
}

/// Everything a spawned tool call needs.
struct CallEnv {
    tool: Option<Arc<IsolatedTool>>,
    writer: UiStreamWriter,
    approvals: Arc<ApprovalGate>,
    event_bus: Arc<EventBus>,
    run_id: String,
    user_id: Option<String>,
    chat_id: Option<String>,
}

impl CallEnv {
    async fn run(self, call: ToolCall, answered: Option<ApprovalDecision>) -> (String, Resolution) {
        let call_id = call.id.clone();
        let Some(tool) = self.tool.clone() else {
            let error = ToolError::NotFound(call.name.clone()).to_string();
            warn!(run_id = %self.run_id, tool = %call.name, "Model requested an unknown tool");
            self.writer.write(UiEvent::tool_output_error(&call_id, &error));
            return (call_id, Resolution::Error(error));
        };

        let decision = match answered {
            Some(decision) => Some(decision),
            None if tool.needs_approval() => Some(self.ask(&call).await),
            None => None,
        };
        if let Some(decision) = decision
            && !decision.approved
        {
            info!(run_id = %self.run_id, tool = %call.name, "Tool call denied");
            self.writer.write(UiEvent::tool_output_denied(&call_id));
            return (call_id, Resolution::Denied(decision.reason));
        }

        let resolution = self.invoke(&tool, call).await;
        (call_id, resolution)
    }

    /// Park the call until the user answers.
    async fn ask(&self, call: &ToolCall) -> ApprovalDecision {
        let approval_id = generate_id();
        let answer = self
            .approvals
            .register(&approval_id, &call.id, self.chat_id.as_deref())
            .await;
        self.writer
            .write(UiEvent::tool_approval_request(&approval_id, &call.id));
        info!(run_id = %self.run_id, tool = %call.name, approval_id = %approval_id, "Waiting for approval");

        let decision = answer
            .await
            .unwrap_or_else(|_| ApprovalDecision::deny("Approval withdrawn"));
        self.writer.write(UiEvent::tool_approval_response(
            approval_id,
            &call.id,
            decision.approved,
            decision.reason.clone(),
        ));
        decision
    }

    async fn invoke(&self, tool: &IsolatedTool, call: ToolCall) -> Resolution {
        let started = Instant::now();
        let mut ctx = ToolContext::new(&call.id, self.writer.clone());
        ctx.user_id = self.user_id.clone();
        ctx.chat_id = self.chat_id.clone();

        let resolution = match tool.invoke(call.input, ctx).await {
            Ok(ToolOutput::Value(value)) => {
                self.writer.write(UiEvent::tool_output(&call.id, value.clone()));
                Resolution::Output(value)
            }
            Ok(ToolOutput::Stream(mut items)) => {
                let mut last = serde_json::Value::Null;
                while let Some(item) = items.next().await {
                    self.writer
                        .write(UiEvent::tool_output_preliminary(&call.id, item.clone()));
                    last = item;
                }
                self.writer.write(UiEvent::tool_output(&call.id, last.clone()));
                Resolution::Output(last)
            }
            Err(e) => {
                warn!(run_id = %self.run_id, tool = %call.name, error = %e, "Tool call failed");
                let output = e.to_output();
                self.writer.write(UiEvent::tool_output(&call.id, output.clone()));
                Resolution::Failed(output)
            }
        };

        self.event_bus.publish(DomainEvent::ToolExecuted {
            run_id: self.run_id.clone(),
            tool_name: call.name,
            success: matches!(resolution, Resolution::Output(_)),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        resolution
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Reasoning,
}

/// Opens and closes text and reasoning blocks around model deltas.
struct Blocks<'a> {
    writer: &'a UiStreamWriter,
    open: Option<(BlockKind, String)>,
    text: String,
    reasoning: String,
}

impl<'a> Blocks<'a> {
    fn new(writer: &'a UiStreamWriter) -> Self {
        Self {
            writer,
            open: None,
            text: String::new(),
            reasoning: String::new(),
        }
    }

    fn text(&mut self, delta: &str) {
        let id = self.switch_to(BlockKind::Text);
        self.writer.write(UiEvent::text_delta(id, delta));
        self.text.push_str(delta);
    }

    fn reasoning(&mut self, delta: &str) {
        let id = self.switch_to(BlockKind::Reasoning);
        self.writer.write(UiEvent::reasoning_delta(id, delta));
        self.reasoning.push_str(delta);
    }

    fn switch_to(&mut self, kind: BlockKind) -> String {
        if let Some((open, id)) = &self.open
            && *open == kind
        {
            return id.clone();
        }
        self.end_open();
        let id = generate_id();
        self.writer.write(match kind {
            BlockKind::Text => UiEvent::text_start(&id),
            BlockKind::Reasoning => UiEvent::reasoning_start(&id),
        });
        self.open = Some((kind, id.clone()));
        id
    }

    fn end_open(&mut self) {
        if let Some((kind, id)) = self.open.take() {
            self.writer.write(match kind {
                BlockKind::Text => UiEvent::text_end(id),
                BlockKind::Reasoning => UiEvent::reasoning_end(id),
            });
        }
    }

    /// End the open block and return the accumulated text and reasoning.
    fn close(mut self) -> (String, String) {
        self.end_open();
        (self.text, self.reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::MessageAssembler;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stepweave_core::message::{Approval, Part};
    use stepweave_core::model::{FinishReason, ModelStream};
    use stepweave_core::stream::UiEventReceiver;

    type Script = Vec<Result<ModelEvent, ModelError>>;

    /// Plays one script per step; the last script repeats.
    struct ScriptedModel {
        id: String,
        steps: Vec<Script>,
        calls: AtomicUsize,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Script>) -> Self {
            Self {
                id: "scripted".into(),
                steps,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn request(&self, index: usize) -> ModelRequest {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl Model for ScriptedModel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let script = self.steps[index.min(self.steps.len() - 1)].clone();
            Ok(futures::stream::iter(script).boxed())
        }
    }

    fn call(id: &str, name: &str, input: serde_json::Value) -> Script {
        vec![
            Ok(ModelEvent::ToolInputStart {
                call_id: id.into(),
                tool_name: name.into(),
            }),
            Ok(ModelEvent::ToolCall(ToolCall {
                id: id.into(),
                name: name.into(),
                input,
            })),
            Ok(ModelEvent::StepFinish {
                reason: FinishReason::ToolCalls,
                usage: None,
            }),
        ]
    }

    fn say(text: &str) -> Script {
        vec![
            Ok(ModelEvent::TextDelta(text.into())),
            Ok(ModelEvent::StepFinish {
                reason: FinishReason::Stop,
                usage: None,
            }),
        ]
    }

    enum Act {
        Echo,
        Hang,
        Progress,
    }

    struct TestTool {
        name: &'static str,
        act: Act,
        approval: bool,
    }

    #[async_trait]
    impl Tool for TestTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn needs_approval(&self) -> bool {
            self.approval
        }
        async fn invoke(
            &self,
            input: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            match self.act {
                Act::Echo => Ok(ToolOutput::Value(json!({ "echo": input }))),
                Act::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ToolOutput::Value(json!(null)))
                }
                Act::Progress => Ok(ToolOutput::Stream(
                    futures::stream::iter(vec![json!({"pct": 50}), json!({"pct": 100})]).boxed(),
                )),
            }
        }
    }

    fn registry(tools: Vec<TestTool>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.insert(IsolatedTool::new(Arc::new(tool), Duration::from_secs(2)));
        }
        Arc::new(registry)
    }

    fn echo(name: &'static str) -> TestTool {
        TestTool {
            name,
            act: Act::Echo,
            approval: false,
        }
    }

    async fn drain(mut rx: UiEventReceiver) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn assemble(events: &[UiEvent]) -> Vec<Message> {
        let mut assembler = MessageAssembler::new();
        for event in events {
            assembler.push(event);
        }
        assert_eq!(assembler.rejected_transitions(), 0);
        assembler.finish()
    }

    async fn run(agent: &AgentLoop, messages: Vec<Message>) -> (RunOutcome, Vec<UiEvent>) {
        let (writer, rx) = UiStreamWriter::channel();
        let outcome = agent.run(messages, writer).await;
        (outcome, drain(rx).await)
    }

    #[tokio::test]
    async fn tool_call_then_text_finishes() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "lookup", json!({"q": "rust"})),
            say("Rust is a language."),
        ]));
        let agent = AgentLoop::new(model.clone(), registry(vec![echo("lookup")]));

        let (outcome, events) = run(&agent, vec![Message::user("what is rust?")]).await;

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(outcome.steps, 2);
        assert_eq!(events.last(), Some(&UiEvent::finish("stop")));

        let messages = assemble(&events);
        assert_eq!(messages.len(), 1);
        let parts = &messages[0].parts;
        let tool_index = parts
            .iter()
            .position(|p| matches!(p, Part::ToolInvocation(inv) if inv.state == ToolState::OutputAvailable))
            .unwrap();
        let text_index = parts.iter().position(|p| matches!(p, Part::Text { .. })).unwrap();
        assert!(tool_index < text_index);

        let second = model.request(1);
        assert!(second.messages.iter().any(|m| matches!(m,
            ModelMessage::Tool { output, .. } if output["echo"]["q"] == "rust")));
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn text_after_a_tool_call_gets_its_own_part() {
        let mut first = vec![Ok(ModelEvent::TextDelta("Looking it up. ".into()))];
        first.extend(call("c1", "lookup", json!({})));
        first.insert(first.len() - 1, Ok(ModelEvent::TextDelta("One moment.".into())));
        let model = Arc::new(ScriptedModel::new(vec![first, say("Found it.")]));
        let agent = AgentLoop::new(model, registry(vec![echo("lookup")]));

        let (_, events) = run(&agent, vec![Message::user("go")]).await;

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                UiEvent::TextStart { id } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.len(), 3);

        let parts = &assemble(&events)[0].parts;
        let kinds: Vec<&str> = parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::ToolInvocation(_) => Some("<tool>"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["Looking it up. ", "<tool>", "One moment.", "Found it."]);
    }

    #[tokio::test]
    async fn always_calling_model_stops_at_ceiling() {
        let model = Arc::new(ScriptedModel::new(vec![call("c", "lookup", json!({}))]));
        let agent = AgentLoop::new(model.clone(), registry(vec![echo("lookup")])).with_max_steps(3);

        let (outcome, events) = run(&agent, vec![Message::user("loop")]).await;

        assert_eq!(outcome.stop_reason, StopReason::MaxSteps);
        assert_eq!(outcome.steps, 3);
        assert_eq!(model.calls(), 3);
        assert_eq!(events.last(), Some(&UiEvent::finish("length")));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_tool_reports_error_output_and_loop_continues() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "slow", json!({})),
            say("The tool timed out."),
        ]));
        let tools = registry(vec![TestTool {
            name: "slow",
            act: Act::Hang,
            approval: false,
        }]);
        let agent = AgentLoop::new(model.clone(), tools);

        let (outcome, events) = run(&agent, vec![Message::user("go")]).await;

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(model.calls(), 2);
        let inv = assemble(&events)[0].tool_invocation("c1").cloned().unwrap();
        assert_eq!(inv.state, ToolState::OutputAvailable);
        assert_eq!(inv.output.unwrap()["error"], "Tool \"slow\" timed out after 2s");
    }

    #[tokio::test]
    async fn unknown_tool_is_output_error() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "missing", json!({})),
            say("Sorry."),
        ]));
        let agent = AgentLoop::new(model.clone(), registry(vec![]));

        let (outcome, events) = run(&agent, vec![Message::user("go")]).await;

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        let inv = assemble(&events)[0].tool_invocation("c1").cloned().unwrap();
        assert_eq!(inv.state, ToolState::OutputError);
        assert_eq!(inv.error_text.as_deref(), Some("Tool not found: missing"));
    }

    #[tokio::test]
    async fn streamed_output_is_preliminary_until_last() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "report", json!({})),
            say("Done."),
        ]));
        let tools = registry(vec![TestTool {
            name: "report",
            act: Act::Progress,
            approval: false,
        }]);
        let agent = AgentLoop::new(model.clone(), tools);

        let (_, events) = run(&agent, vec![Message::user("go")]).await;

        let outputs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UiEvent::ToolOutputAvailable {
                    output,
                    preliminary,
                    ..
                } => Some((output.clone(), preliminary.unwrap_or(false))),
                _ => None,
            })
            .collect();
        assert_eq!(
            outputs,
            vec![
                (json!({"pct": 50}), true),
                (json!({"pct": 100}), true),
                (json!({"pct": 100}), false)
            ]
        );
    }

    #[tokio::test]
    async fn denied_approval_is_fed_to_the_model() {
        let model = Arc::new(ScriptedModel::new(vec![
            call("c1", "delete", json!({"path": "/tmp/x"})),
            say("I did not delete it."),
        ]));
        let gate = Arc::new(ApprovalGate::new());
        let tools = registry(vec![TestTool {
            name: "delete",
            act: Act::Echo,
            approval: true,
        }]);
        let agent = Arc::new(AgentLoop::new(model.clone(), tools).with_approvals(gate.clone()));

        let (writer, mut rx) = UiStreamWriter::channel();
        let handle = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(vec![Message::user("delete it")], writer).await }
        });

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let UiEvent::ToolApprovalRequest { approval_id, .. } = &event {
                gate.respond(approval_id, ApprovalDecision::deny("too risky"))
                    .await
                    .unwrap();
            }
            events.push(event);
        }
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(model.calls(), 2);
        let inv = assemble(&events)[0].tool_invocation("c1").cloned().unwrap();
        assert_eq!(inv.state, ToolState::OutputDenied);
        assert_eq!(inv.approval.unwrap().reason.as_deref(), Some("too risky"));

        assert!(model.request(1).messages.iter().any(|m| matches!(m,
            ModelMessage::Tool { output, .. } if output == &json!({"denied": true, "reason": "too risky"}))));
    }

    #[tokio::test]
    async fn answered_approval_is_resolved_without_repeating_the_model_call() {
        let model = Arc::new(ScriptedModel::new(vec![say("Deleted.")]));
        let tools = registry(vec![TestTool {
            name: "delete",
            act: Act::Echo,
            approval: true,
        }]);
        let agent = AgentLoop::new(model.clone(), tools);

        let mut answered = ToolInvocation::new("c1", "delete", ToolState::ApprovalResponded);
        answered.input = Some(json!({"path": "/tmp/x"}));
        answered.approval = Some(Approval {
            id: "a1".into(),
            approved: Some(true),
            reason: None,
        });
        let carried = Message::new("m-prev", Role::Assistant)
            .with_part(Part::StepStart)
            .with_part(Part::ToolInvocation(answered));

        let (writer, rx) = UiStreamWriter::channel();
        let outcome = agent
            .run(vec![Message::user("delete it"), carried.clone()], writer)
            .await;
        let events = drain(rx).await;

        assert_eq!(outcome.stop_reason, StopReason::Finished);
        assert_eq!(model.calls(), 1);
        assert_eq!(events[0], UiEvent::start("m-prev"));
        assert!(!events.iter().any(|e| matches!(e, UiEvent::ToolApprovalRequest { .. })));

        let mut assembler = MessageAssembler::continuing(carried);
        for event in &events {
            assembler.push(event);
        }
        let messages = assembler.finish();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m-prev");
        let inv = messages[0].tool_invocation("c1").unwrap();
        assert_eq!(inv.state, ToolState::OutputAvailable);
        assert_eq!(messages[0].text_content(), "Deleted.");
    }

    #[tokio::test]
    async fn model_failure_is_fatal_and_reported() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            Ok(ModelEvent::TextDelta("Partial".into())),
            Err(ModelError::StreamInterrupted("connection reset".into())),
        ]]));
        let agent = AgentLoop::new(model, registry(vec![]));

        let (outcome, events) = run(&agent, vec![Message::user("go")]).await;

        assert!(matches!(outcome.stop_reason, StopReason::Fatal(_)));
        assert_eq!(events.last(), Some(&UiEvent::finish("error")));
        assert!(events.iter().any(|e| matches!(e, UiEvent::Error { .. })));
        let messages = assemble(&events);
        let text = messages[0].text_content();
        assert!(text.starts_with("Partial"));
        assert!(text.contains("Something went wrong and the response stopped: Stream interrupted"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_leaves_parked_approval_open() {
        let model = Arc::new(ScriptedModel::new(vec![call("c1", "delete", json!({}))]));
        let gate = Arc::new(ApprovalGate::new());
        let tools = registry(vec![TestTool {
            name: "delete",
            act: Act::Echo,
            approval: true,
        }]);
        let agent = AgentLoop::new(model, tools)
            .with_approvals(gate.clone())
            .with_run_timeout(Duration::from_secs(5));

        let (outcome, events) = run(&agent, vec![Message::user("delete it")]).await;

        assert_eq!(outcome.stop_reason, StopReason::TimedOut);
        assert_eq!(events.last(), Some(&UiEvent::finish("error")));
        let inv = assemble(&events)[0].tool_invocation("c1").cloned().unwrap();
        assert_eq!(inv.state, ToolState::ApprovalRequested);
        assert!(gate.pending_for_call("c1").await.is_none());
    }

    #[tokio::test]
    async fn domain_events_are_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let model = Arc::new(ScriptedModel::new(vec![say("hi")]));
        let agent = AgentLoop::new(model, registry(vec![])).with_event_bus(bus);

        run(&agent, vec![Message::user("hello")]).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event.as_ref() {
                DomainEvent::RunStarted { .. } => "started",
                DomainEvent::StepCompleted { .. } => "step",
                DomainEvent::RunStopped { .. } => "stopped",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "step", "stopped"]);
    }

    #[test]
    fn reasoning_options_follow_model_id() {
        assert_eq!(
            reasoning_options("anthropic/claude-sonnet-thinking", 10_000),
            Some(ReasoningOptions::Budget {
                budget_tokens: 10_000
            })
        );
        assert_eq!(
            reasoning_options("xai/grok-reasoning", 500),
            Some(ReasoningOptions::Budget { budget_tokens: 500 })
        );
        assert!(matches!(
            reasoning_options("google/gemini-3-pro", 10_000),
            Some(ReasoningOptions::Level { ref level, include_thoughts: true }) if level == "high"
        ));
        assert_eq!(reasoning_options("openai/gpt-4o-mini", 10_000), None);
    }
}
