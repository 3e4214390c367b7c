//! Capability detection for loaded extensions.
//!
//! The loader does not require an extension to declare its roles up front;
//! it asks each extension's [`Extension`] implementation which optional
//! interfaces it satisfies. Every accessor defaults to `None`, mirroring
//! the default-fallback dispatch the kernel has always used for per-message
//! handling, now applied to per-extension role detection instead.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use yodoca_primitives::{AgentId, IntegrationMode, ScheduleEntry};
use yodoca_tools::registry::ToolBinding;

use crate::context::ExtensionContext;

/// Result alias for extension lifecycle and capability calls.
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Errors raised by an extension's lifecycle or capability methods.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// A lifecycle phase failed.
    #[error("extension `{id}` failed during {phase}: {reason}")]
    Lifecycle {
        /// Offending extension id.
        id: String,
        /// Phase name (`initialize`, `start`, `stop`, `health_check`).
        phase: &'static str,
        /// Human-readable failure reason.
        reason: String,
    },
}

/// A destination an extension can deliver proactive or reactive text to.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable channel identifier used for routing and `send_to_channel`.
    fn channel_id(&self) -> &str;

    /// Human-readable description surfaced by `list_channels`.
    fn description(&self) -> &str;

    /// Proactive delivery; owns its own addressing.
    async fn send_message(&self, text: &str) -> ExtensionResult<()>;

    /// Reactive delivery: a direct reply to `user_id`'s inbound message.
    async fn send_to_user(&self, user_id: &str, text: &str) -> ExtensionResult<()>;
}

/// A channel that additionally supports incremental streaming delivery.
///
/// Detected structurally: any extension whose channel exposes these four
/// methods takes the streaming delivery path in the message router.
#[async_trait]
pub trait StreamingChannel: Channel {
    /// Called once before the first chunk of a streamed response.
    async fn on_stream_start(&self, user_id: &str);

    /// Called for every text delta produced by the model.
    async fn on_stream_chunk(&self, user_id: &str, delta: &str);

    /// Called for status updates such as tool-call progress.
    async fn on_stream_status(&self, user_id: &str, status: &str);

    /// Called once the stream terminates, with the full accumulated text.
    async fn on_stream_end(&self, user_id: &str, full_text: &str);
}

/// An extension that contributes callable tools to the orchestrator.
pub trait ToolProvider: Send + Sync {
    /// Returns every tool binding this extension registers.
    fn tools(&self) -> Vec<ToolBinding>;
}

/// Context handed to an [`AgentProvider`] invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocationContext {
    /// Running summary of the conversation or task so far.
    pub conversation_summary: Option<String>,
    /// Correlation id threading related invocations together.
    pub correlation_id: Option<String>,
}

/// Classification of an [`AgentProvider`] response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentInvocationStatus {
    /// The agent produced a usable response.
    Success,
    /// The invocation failed transiently and may be retried.
    Error,
    /// The agent declined to continue; not retryable.
    Refused,
}

/// Outcome of one [`AgentProvider::invoke`] call.
#[derive(Debug, Clone)]
pub struct AgentInvocationOutcome {
    /// Outcome classification.
    pub status: AgentInvocationStatus,
    /// Text content of the response.
    pub content: String,
    /// Set when the response included a `finish_task` tool-call result.
    pub finished: bool,
}

/// Descriptor advertised by an agent-extension for wiring into the
/// orchestrator (as a tool, for `integration_mode = tool`) or the router
/// (for delegation, `integration_mode = handoff`).
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    /// Agent identifier, used to build the `agent_<id>` tool name.
    pub agent_id: AgentId,
    /// Human-readable description surfaced to the orchestrator.
    pub description: String,
    /// How this agent is exposed to the rest of the runtime.
    pub integration_mode: IntegrationMode,
}

/// An extension that can itself be invoked as an agent.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Returns this agent's wiring descriptor.
    fn descriptor(&self) -> AgentDescriptor;

    /// Runs one invocation against this agent.
    async fn invoke(&self, prompt: &str, ctx: AgentInvocationContext) -> AgentInvocationOutcome;
}

/// An extension that runs ongoing background work once started.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Runs until the extension is stopped. Spawned by the loader during
    /// `start_all`.
    async fn run_background(&self) -> ExtensionResult<()>;
}

/// An extension that contributes cron-scheduled work.
pub trait SchedulerProvider: Send + Sync {
    /// Returns the schedule entries this extension wants ticked.
    fn schedules(&self) -> Vec<ScheduleEntry>;
}

/// An extension that augments the orchestrator's prompt with extra context.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Ordering key; providers run ascending by priority.
    fn context_priority(&self) -> i32;

    /// Returns the augmented prompt given the current base prompt.
    async fn provide_context(&self, base_prompt: &str) -> ExtensionResult<String>;
}

/// An extension that participates in first-run onboarding.
#[async_trait]
pub trait SetupProvider: Send + Sync {
    /// Runs onboarding, returning a process-style exit code (`0` success,
    /// `1` user cancelled, `2` retry).
    async fn run_onboarding(&self) -> ExtensionResult<i32>;
}

/// Implemented by every loaded extension. Lifecycle methods are mandatory;
/// every capability accessor defaults to `None` so extensions opt into only
/// the roles they actually implement.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Called once, in topological order, before any other phase.
    async fn initialize(&self, ctx: Arc<ExtensionContext>) -> ExtensionResult<()>;

    /// Called once detect-and-wire has completed for every extension.
    async fn start(&self) -> ExtensionResult<()>;

    /// Called on shutdown or when a health check fails.
    async fn stop(&self) -> ExtensionResult<()>;

    /// Polled every 30 seconds while the extension is `ACTIVE`.
    async fn health_check(&self) -> bool {
        true
    }

    /// Returns this extension as a [`Channel`], if it is one.
    fn as_channel(self: Arc<Self>) -> Option<Arc<dyn Channel>> {
        None
    }

    /// Returns this extension as a [`StreamingChannel`], if it is one.
    fn as_streaming_channel(self: Arc<Self>) -> Option<Arc<dyn StreamingChannel>> {
        None
    }

    /// Returns this extension as a [`ToolProvider`], if it is one.
    fn as_tool_provider(self: Arc<Self>) -> Option<Arc<dyn ToolProvider>> {
        None
    }

    /// Returns this extension as an [`AgentProvider`], if it is one.
    fn as_agent_provider(self: Arc<Self>) -> Option<Arc<dyn AgentProvider>> {
        None
    }

    /// Returns this extension as a [`ServiceProvider`], if it is one.
    fn as_service_provider(self: Arc<Self>) -> Option<Arc<dyn ServiceProvider>> {
        None
    }

    /// Returns this extension as a [`SchedulerProvider`], if it is one.
    fn as_scheduler_provider(self: Arc<Self>) -> Option<Arc<dyn SchedulerProvider>> {
        None
    }

    /// Returns this extension as a [`ContextProvider`], if it is one.
    fn as_context_provider(self: Arc<Self>) -> Option<Arc<dyn ContextProvider>> {
        None
    }

    /// Returns this extension as a [`SetupProvider`], if it is one.
    fn as_setup_provider(self: Arc<Self>) -> Option<Arc<dyn SetupProvider>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlainExtension;

    #[async_trait]
    impl Extension for PlainExtension {
        async fn initialize(&self, _ctx: Arc<ExtensionContext>) -> ExtensionResult<()> {
            Ok(())
        }

        async fn start(&self) -> ExtensionResult<()> {
            Ok(())
        }

        async fn stop(&self) -> ExtensionResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn extension_defaults_to_no_capabilities() {
        let ext: Arc<dyn Extension> = Arc::new(PlainExtension);
        assert!(ext.clone().as_channel().is_none());
        assert!(ext.clone().as_tool_provider().is_none());
        assert!(ext.clone().as_agent_provider().is_none());
        assert!(ext.health_check().await);
    }
}
