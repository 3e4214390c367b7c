//! Tool discovery and execution runtime for yodoca extensions.
//!
//! Extension-authored tools are annotated with `#[tool]`, which registers a
//! binding constructor through `inventory`; the loader collects every
//! submitted binding into a single [`registry::ToolRegistry`] during
//! `detect_and_wire`.

#![warn(missing_docs, clippy::pedantic)]

/// Tool registry and execution runtime.
pub mod registry;

pub use inventory;
/// Attribute macro used to register an async function as an agent-facing tool.
pub use yodoca_tools_macros::tool;
