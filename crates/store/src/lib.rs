//! Chat storage backends for Stepweave.
//!
//! All backends implement `stepweave_core::ChatStore`.

pub mod in_memory;

pub use in_memory::InMemoryChatStore;
