//! The agent loop for Stepweave.
//!
//! A run drives repeated model calls interleaved with tool execution and
//! writes everything it does to one output stream:
//!
//! - [`loop_runner`]: the step loop, tool dispatch and stop conditions
//! - [`approval`]: the gate parking tool calls until a human answers
//! - [`multiplexer`]: the fan-in stream a run and its sibling sub-streams
//!   write to
//! - [`assembler`]: folds the stream back into persisted messages
//! - [`convert`]: stored messages to model history

pub mod approval;
pub mod assembler;
pub mod convert;
pub mod loop_runner;
pub mod multiplexer;

pub use approval::{ApprovalDecision, ApprovalError, ApprovalGate, ParkedCall};
pub use assembler::MessageAssembler;
pub use convert::convert_to_model_messages;
pub use loop_runner::{AgentLoop, LoopPhase, RunOutcome, StopReason, reasoning_options};
pub use multiplexer::{UiStream, create_ui_stream, interruption_events};
