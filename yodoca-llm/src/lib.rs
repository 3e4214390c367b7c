//! Model and service adapters used by agents.
//!
//! Each module exposes implementations for a specific provider while sharing a
//! common trait-based interface defined in [`traits`].

#![warn(missing_docs, clippy::pedantic)]

pub mod anthropic;
pub mod context;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod traits;

mod http_client;

pub use traits::{
    AdapterError, AdapterMetadata, AdapterResult, AdapterStream, InferenceChunk,
    InferenceRequest, MessageRole, ModelAdapter, PromptMessage,
};
