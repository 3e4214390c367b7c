//! The nano-kernel: extension lifecycle, capability detection, message
//! routing, and model resolution for the agent process.
//!
//! Nothing in this crate holds a process-wide singleton. The binary crate
//! constructs one [`context::ContextShared`] and one [`loader::Loader`],
//! then hands `Arc` clones down through extension contexts; shutdown drops
//! them in reverse order.

#![warn(missing_docs, clippy::pedantic)]

pub mod context;
pub mod core_tools;
pub mod declarative_agent;
pub mod interfaces;
pub mod lifecycle;
pub mod loader;
pub mod model_router;
pub mod orchestrator;
pub mod router;
pub mod scheduler;

pub use context::{ContextError, ContextResult, ContextShared, ExtensionContext, ExtensionRegistry};
pub use core_tools::register_core_tools;
pub use interfaces::{
    AgentDescriptor, AgentInvocationContext, AgentInvocationOutcome, AgentInvocationStatus,
    AgentProvider, Channel, ContextProvider, Extension, ExtensionError, ExtensionResult,
    SchedulerProvider, ServiceProvider, SetupProvider, StreamingChannel, ToolProvider,
};
pub use lifecycle::{ExtensionState, Lifecycle, LifecycleError, LifecycleEvent, LifecycleResult};
pub use loader::{ExtensionRegistration, Loader, LoaderError, LoaderResult};
pub use model_router::{AdapterFactory, ModelHandle, ModelRouter, ModelRouterError, ModelRouterResult};
pub use orchestrator::{capabilities_summary, Orchestrator};
pub use router::{AgentHandle, DirectCallback, DirectEvent, MessageRouter, RegisteredChannel};
pub use scheduler::{SchedulerConfig, SchedulerError, SchedulerResult, TaskScheduler};
