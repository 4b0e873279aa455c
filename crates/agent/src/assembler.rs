//! Folding the output event stream into finished messages.
//!
//! The assembler is the server-side mirror of what a client renders: text
//! and reasoning blocks become parts, tool lifecycle events advance one
//! tool-invocation part per call id, non-transient `data-*` events become
//! data parts. Transitions the state machine does not allow are dropped.

use std::collections::HashMap;
use stepweave_core::message::{
    Approval, Message, Part, Role, ToolInvocation, ToolState, generate_id,
};
use stepweave_core::stream::UiEvent;
use tracing::warn;

#[derive(Default)]
pub struct MessageAssembler {
    /// Message a continuation run appends to.
    seed: Option<Message>,
    current: Option<Message>,
    finished: Vec<Message>,
    open_text: HashMap<String, usize>,
    open_reasoning: HashMap<String, usize>,
    errors: Vec<String>,
    rejected: usize,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue `message` when a `start` event names its id.
    pub fn continuing(message: Message) -> Self {
        Self {
            seed: Some(message),
            ..Self::default()
        }
    }

    pub fn push(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Start { message_id } => {
                self.close_current();
                let message = match (self.seed.take(), message_id) {
                    (Some(seed), Some(id)) if &seed.id == id => seed,
                    (seed, id) => {
                        self.seed = seed;
                        Message::new(id.clone().unwrap_or_else(generate_id), Role::Assistant)
                    }
                };
                self.current = Some(message);
            }
            UiEvent::StartStep => self.message().parts.push(Part::StepStart),
            UiEvent::FinishStep => {}
            UiEvent::Finish { .. } => self.close_current(),
            UiEvent::Error { error_text } => self.errors.push(error_text.clone()),

            UiEvent::TextStart { id } => {
                let index = self.push_part(Part::text(""));
                self.open_text.insert(id.clone(), index);
            }
            UiEvent::TextDelta { id, delta } => {
                if let Some(&index) = self.open_text.get(id)
                    && let Some(Part::Text { text }) = self.message().parts.get_mut(index)
                {
                    text.push_str(delta);
                }
            }
            UiEvent::TextEnd { id } => {
                self.open_text.remove(id);
            }

            UiEvent::ReasoningStart { id } => {
                let index = self.push_part(Part::Reasoning {
                    text: String::new(),
                });
                self.open_reasoning.insert(id.clone(), index);
            }
            UiEvent::ReasoningDelta { id, delta } => {
                if let Some(&index) = self.open_reasoning.get(id)
                    && let Some(Part::Reasoning { text }) = self.message().parts.get_mut(index)
                {
                    text.push_str(delta);
                }
            }
            UiEvent::ReasoningEnd { id } => {
                self.open_reasoning.remove(id);
            }

            UiEvent::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                self.advance(tool_call_id, Some(tool_name.as_str()), ToolState::InputStreaming, |_| {});
            }
            // Input is persisted once complete.
            UiEvent::ToolInputDelta { .. } => {}
            UiEvent::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.advance(tool_call_id, Some(tool_name.as_str()), ToolState::InputAvailable, |inv| {
                    inv.input = Some(input.clone());
                });
            }
            UiEvent::ToolApprovalRequest {
                approval_id,
                tool_call_id,
            } => {
                self.advance(tool_call_id, None, ToolState::ApprovalRequested, |inv| {
                    inv.approval = Some(Approval {
                        id: approval_id.clone(),
                        approved: None,
                        reason: None,
                    });
                });
            }
            UiEvent::ToolApprovalResponse {
                approval_id,
                tool_call_id,
                approved,
                reason,
            } => {
                self.advance(tool_call_id, None, ToolState::ApprovalResponded, |inv| {
                    inv.approval = Some(Approval {
                        id: approval_id.clone(),
                        approved: Some(*approved),
                        reason: reason.clone(),
                    });
                });
            }
            UiEvent::ToolOutputAvailable {
                tool_call_id,
                output,
                preliminary,
            } => {
                self.advance(tool_call_id, None, ToolState::OutputAvailable, |inv| {
                    inv.output = Some(output.clone());
                    inv.preliminary = preliminary.unwrap_or(false);
                });
            }
            UiEvent::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                self.advance(tool_call_id, None, ToolState::OutputError, |inv| {
                    inv.error_text = Some(error_text.clone());
                });
            }
            UiEvent::ToolOutputDenied { tool_call_id } => {
                self.advance(tool_call_id, None, ToolState::OutputDenied, |_| {});
            }

            UiEvent::Data {
                data_type,
                data,
                transient,
            } => {
                if transient != &Some(true) {
                    self.push_part(Part::Data {
                        data_type: data_type.clone(),
                        data: data.clone(),
                    });
                }
            }
        }
    }

    /// Error texts seen on the stream.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Number of tool events dropped as illegal transitions.
    pub fn rejected_transitions(&self) -> usize {
        self.rejected
    }

    /// Close any message still open and return everything assembled.
    pub fn finish(mut self) -> Vec<Message> {
        self.close_current();
        self.finished
    }

    fn message(&mut self) -> &mut Message {
        self.current
            .get_or_insert_with(|| Message::new(generate_id(), Role::Assistant))
    }

    fn push_part(&mut self, part: Part) -> usize {
        let message = self.message();
        message.parts.push(part);
        message.parts.len() - 1
    }

    fn close_current(&mut self) {
        self.open_text.clear();
        self.open_reasoning.clear();
        if let Some(message) = self.current.take() {
            self.finished.push(message);
        }
    }

    fn advance(
        &mut self,
        call_id: &str,
        tool_name: Option<&str>,
        next: ToolState,
        apply: impl FnOnce(&mut ToolInvocation),
    ) {
        let existing = self.message().tool_invocation(call_id).cloned();
        let mut inv = match (existing, tool_name) {
            (Some(inv), _) if inv.state.can_advance_to(next) => inv,
            (None, Some(name)) if matches!(next, ToolState::InputStreaming | ToolState::InputAvailable) => {
                ToolInvocation::new(call_id, name, next)
            }
            (existing, _) => {
                warn!(
                    call_id,
                    from = existing.as_ref().map(|inv| inv.state.as_str()),
                    to = next.as_str(),
                    "Dropping illegal tool state transition"
                );
                self.rejected += 1;
                return;
            }
        };
        inv.state = next;
        apply(&mut inv);
        self.message().upsert_tool_invocation(inv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assemble(events: &[UiEvent]) -> (Vec<Message>, usize) {
        let mut assembler = MessageAssembler::new();
        for event in events {
            assembler.push(event);
        }
        let rejected = assembler.rejected_transitions();
        (assembler.finish(), rejected)
    }

    #[test]
    fn builds_tool_then_text_message() {
        let (messages, rejected) = assemble(&[
            UiEvent::start("m1"),
            UiEvent::StartStep,
            UiEvent::tool_input_start("c1", "search"),
            UiEvent::tool_input_delta("c1", "{\"q\":"),
            UiEvent::tool_input_available("c1", "search", json!({"q": "rust"})),
            UiEvent::tool_output("c1", json!({"hits": 1})),
            UiEvent::FinishStep,
            UiEvent::StartStep,
            UiEvent::text_start("t1"),
            UiEvent::text_delta("t1", "One "),
            UiEvent::text_delta("t1", "hit."),
            UiEvent::text_end("t1"),
            UiEvent::FinishStep,
            UiEvent::finish("stop"),
        ]);

        assert_eq!(rejected, 0);
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.id, "m1");
        let inv = message.tool_invocation("c1").unwrap();
        assert_eq!(inv.state, ToolState::OutputAvailable);
        assert_eq!(inv.output, Some(json!({"hits": 1})));
        assert!(matches!(message.parts.last(), Some(Part::Text { text }) if text == "One hit."));
    }

    #[test]
    fn preliminary_outputs_are_replaced_in_place() {
        let (messages, rejected) = assemble(&[
            UiEvent::start("m1"),
            UiEvent::tool_input_available("c1", "report", json!({})),
            UiEvent::tool_output_preliminary("c1", json!({"progress": 50})),
            UiEvent::tool_output("c1", json!({"progress": 100})),
            UiEvent::finish("stop"),
        ]);
        assert_eq!(rejected, 0);
        let invocations: Vec<_> = messages[0].tool_invocations().collect();
        assert_eq!(invocations.len(), 1);
        assert!(!invocations[0].preliminary);
        assert_eq!(invocations[0].output, Some(json!({"progress": 100})));
    }

    #[test]
    fn illegal_transitions_are_dropped() {
        let (messages, rejected) = assemble(&[
            UiEvent::start("m1"),
            UiEvent::tool_output("ghost", json!(1)),
            UiEvent::tool_input_available("c1", "search", json!({})),
            UiEvent::tool_output_error("c1", "boom"),
            UiEvent::tool_output("c1", json!("late")),
            UiEvent::finish("stop"),
        ]);
        assert_eq!(rejected, 2);
        let inv = messages[0].tool_invocation("c1").unwrap();
        assert_eq!(inv.state, ToolState::OutputError);
        assert!(messages[0].tool_invocation("ghost").is_none());
    }

    #[test]
    fn transient_data_is_not_persisted() {
        let (messages, _) = assemble(&[
            UiEvent::start("m1"),
            UiEvent::transient("textDelta", json!("x")),
            UiEvent::data("weather", json!({"temp": 20})),
            UiEvent::finish("stop"),
        ]);
        assert_eq!(messages[0].parts.len(), 1);
        assert!(matches!(&messages[0].parts[0], Part::Data { data_type, .. } if data_type == "data-weather"));
    }

    #[test]
    fn continuation_appends_to_seed_message() {
        let mut parked = ToolInvocation::new("c1", "delete", ToolState::ApprovalResponded);
        parked.approval = Some(Approval {
            id: "a1".into(),
            approved: Some(false),
            reason: None,
        });
        let seed = Message::new("m1", Role::Assistant)
            .with_part(Part::StepStart)
            .with_part(Part::ToolInvocation(parked));

        let mut assembler = MessageAssembler::continuing(seed);
        for event in [
            UiEvent::start("m1"),
            UiEvent::tool_output_denied("c1"),
            UiEvent::StartStep,
            UiEvent::text_start("t"),
            UiEvent::text_delta("t", "Skipped."),
            UiEvent::text_end("t"),
            UiEvent::finish("stop"),
        ] {
            assembler.push(&event);
        }
        let messages = assembler.finish();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].tool_invocation("c1").unwrap().state, ToolState::OutputDenied);
        assert_eq!(messages[0].text_content(), "Skipped.");
    }

    #[test]
    fn errors_are_collected_and_open_message_is_closed() {
        let mut assembler = MessageAssembler::new();
        assembler.push(&UiEvent::start("m1"));
        assembler.push(&UiEvent::error("model down"));
        assert_eq!(assembler.errors(), ["model down".to_string()]);
        assert_eq!(assembler.finish().len(), 1);
    }
}
