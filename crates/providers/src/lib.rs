//! Model implementations for Stepweave.
//!
//! All models implement the `stepweave_core::Model` trait. The router turns a
//! model id into a backend.

pub mod openai_compat;
pub mod reasoning;
pub mod router;

pub use openai_compat::OpenAiCompatModel;
pub use reasoning::{ExtractReasoning, TagSplitter};
pub use router::{build_from_config, ModelRouter};
