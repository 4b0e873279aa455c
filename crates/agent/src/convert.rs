//! Conversion of stored messages into the model-facing history.
//!
//! An assistant message holds a whole multi-step turn. It is split at its
//! `step-start` parts; each step becomes one assistant entry followed by one
//! tool entry per resolved call. Calls that never reached a terminal state
//! are left out so the model never sees a call without a result.

use serde_json::json;
use stepweave_core::message::{FileRef, Message, Part, Role, ToolInvocation, ToolState};
use stepweave_core::model::ModelMessage;
use stepweave_core::tool::ToolCall;

/// Convert stored messages, oldest first, into model messages.
pub fn convert_to_model_messages(messages: &[Message]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            Role::System => out.push(ModelMessage::System {
                text: message.text_content(),
            }),
            Role::User => out.push(ModelMessage::User {
                text: message.text_content(),
                files: files(message),
            }),
            Role::Assistant => {
                for step in message.parts.split(|p| matches!(p, Part::StepStart)) {
                    convert_step(step, &mut out);
                }
            }
        }
    }
    out
}

fn files(message: &Message) -> Vec<FileRef> {
    message
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::File(file) => Some(file.clone()),
            _ => None,
        })
        .collect()
}

fn convert_step(parts: &[Part], out: &mut Vec<ModelMessage>) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut resolved: Vec<&ToolInvocation> = Vec::new();

    for part in parts {
        match part {
            Part::Text { text: t } => text.push_str(t),
            Part::Reasoning { text: t } => reasoning.push_str(t),
            Part::ToolInvocation(inv) if inv.state.is_terminal() => resolved.push(inv),
            _ => {}
        }
    }

    if text.is_empty() && reasoning.is_empty() && resolved.is_empty() {
        return;
    }

    out.push(ModelMessage::Assistant {
        text,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: resolved
            .iter()
            .map(|inv| ToolCall {
                id: inv.tool_call_id.clone(),
                name: inv.tool_name.clone(),
                input: inv.input.clone().unwrap_or_else(|| json!({})),
            })
            .collect(),
    });

    for inv in resolved {
        out.push(ModelMessage::Tool {
            call_id: inv.tool_call_id.clone(),
            tool_name: inv.tool_name.clone(),
            output: tool_result(inv),
        });
    }
}

/// What the model sees as the result of a terminal call.
pub fn tool_result(inv: &ToolInvocation) -> serde_json::Value {
    match inv.state {
        ToolState::OutputAvailable => inv.output.clone().unwrap_or(serde_json::Value::Null),
        ToolState::OutputDenied => denial(inv.approval.as_ref().and_then(|a| a.reason.clone())),
        _ => json!({ "error": inv.error_text.clone().unwrap_or_else(|| "Tool call failed".into()) }),
    }
}

/// Result fed to the model for a call the user refused.
pub fn denial(reason: Option<String>) -> serde_json::Value {
    json!({ "denied": true, "reason": reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepweave_core::message::Approval;

    fn invocation(id: &str, state: ToolState) -> ToolInvocation {
        let mut inv = ToolInvocation::new(id, "search", state);
        inv.input = Some(json!({"q": id}));
        inv
    }

    #[test]
    fn splits_assistant_turn_at_step_boundaries() {
        let mut done = invocation("c1", ToolState::OutputAvailable);
        done.output = Some(json!({"hits": 3}));

        let assistant = Message::assistant()
            .with_part(Part::StepStart)
            .with_part(Part::text("Let me search."))
            .with_part(Part::ToolInvocation(done))
            .with_part(Part::StepStart)
            .with_part(Part::text("Found three."));

        let history = convert_to_model_messages(&[Message::user("find it"), assistant]);
        assert_eq!(history.len(), 4);
        assert!(matches!(&history[0], ModelMessage::User { text, .. } if text == "find it"));
        match &history[1] {
            ModelMessage::Assistant { text, tool_calls, .. } => {
                assert_eq!(text, "Let me search.");
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].input, json!({"q": "c1"}));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&history[2], ModelMessage::Tool { output, .. } if output["hits"] == 3));
        assert!(matches!(&history[3], ModelMessage::Assistant { text, tool_calls, .. }
            if text == "Found three." && tool_calls.is_empty()));
    }

    #[test]
    fn unresolved_calls_are_left_out() {
        let mut parked = invocation("c1", ToolState::ApprovalRequested);
        parked.approval = Some(Approval {
            id: "a1".into(),
            approved: None,
            reason: None,
        });
        let assistant = Message::assistant()
            .with_part(Part::StepStart)
            .with_part(Part::ToolInvocation(parked));

        assert!(convert_to_model_messages(&[assistant]).is_empty());
    }

    #[test]
    fn denied_and_failed_calls_carry_their_reason() {
        let mut denied = invocation("c1", ToolState::OutputDenied);
        denied.approval = Some(Approval {
            id: "a1".into(),
            approved: Some(false),
            reason: Some("too risky".into()),
        });
        assert_eq!(tool_result(&denied), json!({"denied": true, "reason": "too risky"}));

        let mut failed = invocation("c2", ToolState::OutputError);
        failed.error_text = Some("Tool not found: search".into());
        assert_eq!(tool_result(&failed)["error"], "Tool not found: search");
    }

    #[test]
    fn user_files_are_kept() {
        let user = Message::user("what is this").with_part(Part::File(FileRef {
            url: "https://example.com/a.png".into(),
            media_type: "image/png".into(),
            name: None,
        }));
        match &convert_to_model_messages(&[user])[0] {
            ModelMessage::User { files, .. } => assert_eq!(files.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
