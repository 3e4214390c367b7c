//! Core primitives shared across the yodoca nano-kernel runtime: validated
//! identifiers, the extension manifest, and the crate's error type.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod manifest;

/// Error type and result alias shared across the runtime.
pub use error::{Error, Result};
/// Validated identifier newtypes for extensions, agents, and tasks.
pub use ids::{AgentId, ExtensionId, TaskId};
/// Typed extension manifest, its raw YAML form, and supporting types.
pub use manifest::{
    parse_cron, AgentBlock, AgentConfigEntry, AgentLimits, EventsDecl, ExtensionManifest,
    IntegrationMode, RawManifest, ScheduleEntry, SubscribeDecl, SubscribeHandler,
};
