//! Per-extension handle onto the kernel, handed to `Extension::initialize`
//! and retained for the extension's lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::Span;
use yodoca_config::{SandboxPaths, SecretStore, Settings};
use yodoca_eventbus::{EventBus, EventHandler};
use yodoca_primitives::ExtensionId;
use yodoca_tools::registry::ToolRegistry;

use crate::interfaces::{Extension, ExtensionError, ExtensionResult};
use crate::model_router::ModelRouter;
use crate::router::{DirectCallback, DirectEvent, MessageRouter};

/// Result alias for extension context operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Errors raised by [`ExtensionContext`] operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// `get_extension` was called for an id outside the caller's
    /// `depends_on` declaration, or the id is not a known extension.
    #[error("extension `{requester}` has no declared dependency on `{requested}`")]
    DependencyMissing {
        /// Extension making the request.
        requester: String,
        /// Id it tried to resolve.
        requested: String,
    },

    /// `invoke_agent`/`invoke_agent_streamed` failed at the router.
    #[error("agent invocation failed: {0}")]
    Invocation(#[from] ExtensionError),

    /// `data_dir` could not be created.
    #[error("failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),

    /// Publishing an event through the event bus failed.
    #[error("event publish failed: {0}")]
    Event(#[from] yodoca_eventbus::EventError),
}

/// Shared registry of constructed (but not necessarily started) extensions,
/// populated by the loader before `initialize_all` runs.
pub type ExtensionRegistry = Arc<RwLock<HashMap<ExtensionId, Arc<dyn Extension>>>>;

/// Everything an [`ExtensionContext`] needs that is shared across every
/// extension in the process.
pub struct ContextShared {
    /// Parsed `config/settings.yaml`.
    pub settings: Arc<Settings>,
    /// Secret resolver (keyring, falling back to environment).
    pub secrets: Arc<dyn SecretStore>,
    /// Sandbox filesystem layout.
    pub paths: SandboxPaths,
    /// Durable event bus.
    pub events: Arc<EventBus>,
    /// Message router owning the agent handle and session state.
    pub router: Arc<MessageRouter>,
    /// Agent id → adapter resolver.
    pub model_router: Arc<ModelRouter>,
    /// Shared tool registry the orchestrator draws on.
    pub tools: Arc<ToolRegistry>,
    /// Constructed extensions, keyed by id.
    pub extensions: ExtensionRegistry,
    /// Signalled once to request the agent process shut down.
    pub shutdown: Arc<tokio::sync::Notify>,
}

/// Per-extension handle. One instance per loaded extension; cheap to clone
/// via `Arc` but never is, since the loader hands each extension exactly one.
pub struct ExtensionContext {
    extension_id: ExtensionId,
    depends_on: Vec<ExtensionId>,
    manifest_config: BTreeMap<String, Value>,
    resolved_tools: RwLock<Vec<String>>,
    shared: Arc<ContextShared>,
}

impl ExtensionContext {
    /// Constructs a context for `extension_id`, scoped to its declared
    /// `depends_on` and manifest `config` block.
    #[must_use]
    pub fn new(
        extension_id: ExtensionId,
        depends_on: Vec<ExtensionId>,
        manifest_config: BTreeMap<String, Value>,
        shared: Arc<ContextShared>,
    ) -> Self {
        Self {
            extension_id,
            depends_on,
            manifest_config,
            resolved_tools: RwLock::new(Vec::new()),
            shared,
        }
    }

    /// Returns this extension's id.
    #[must_use]
    pub fn extension_id(&self) -> &ExtensionId {
        &self.extension_id
    }

    /// Looks up `extensions.<id>.<key>` in global settings, then manifest
    /// `config.<key>`, else `default`.
    #[must_use]
    pub fn get_config(&self, key: &str, default: Option<&Value>) -> Option<Value> {
        self.shared
            .settings
            .extensions
            .get(self.extension_id.as_str())
            .and_then(|entries| entries.get(key))
            .cloned()
            .or_else(|| self.manifest_config.get(key).cloned())
            .or_else(|| default.cloned())
    }

    /// Resolves a named secret, returning `None` if it cannot be found.
    ///
    /// # Errors
    ///
    /// Propagates the underlying secret store's error, never the absence of
    /// a value.
    pub fn get_secret(&self, name: &str) -> Result<Option<String>, yodoca_config::SecretError> {
        self.shared.secrets.get_secret(name)
    }

    /// Returns this extension's private data directory, creating it lazily.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DataDir`] if the directory cannot be created.
    pub fn data_dir(&self) -> ContextResult<std::path::PathBuf> {
        Ok(self.shared.paths.data_dir(self.extension_id.as_str())?)
    }

    /// Returns a tracing span namespaced to this extension.
    #[must_use]
    pub fn logger(&self) -> Span {
        yodoca_telemetry::logger_span(&self.extension_id)
    }

    /// Publishes `payload` to `topic`, fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Event`] if the journal write fails.
    pub async fn emit(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> ContextResult<()> {
        self.shared
            .events
            .publish(topic, self.extension_id.as_str(), payload, correlation_id)
            .await?;
        Ok(())
    }

    /// Registers a durable event-bus subscription for `topic`.
    pub async fn subscribe_event(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.shared
            .events
            .subscribe(topic, self.extension_id.as_str(), handler)
            .await;
    }

    /// Registers an in-process, synchronous direct-callback hook for
    /// `user_message` or `agent_response`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a recognised direct-callback event.
    pub async fn subscribe(&self, name: &str, handler: Arc<dyn DirectCallback>) -> ContextResult<()> {
        let event = DirectEvent::parse(name).map_err(|reason| {
            ContextError::Invocation(ExtensionError::Lifecycle {
                id: self.extension_id.to_string(),
                phase: "subscribe",
                reason,
            })
        })?;
        self.shared
            .router
            .subscribe_direct(event, self.extension_id.as_str(), handler)
            .await;
        Ok(())
    }

    /// Removes a previously-registered direct-callback hook.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a recognised direct-callback event.
    pub async fn unsubscribe(&self, name: &str) -> ContextResult<()> {
        let event = DirectEvent::parse(name).map_err(|reason| {
            ContextError::Invocation(ExtensionError::Lifecycle {
                id: self.extension_id.to_string(),
                phase: "unsubscribe",
                reason,
            })
        })?;
        self.shared
            .router
            .unsubscribe_direct(event, self.extension_id.as_str())
            .await;
        Ok(())
    }

    /// Runs one blocking agent invocation through the router.
    ///
    /// # Errors
    ///
    /// Propagates [`ExtensionError`] from the router.
    pub async fn invoke_agent(&self, prompt: &str, agent_id: Option<&str>) -> ContextResult<String> {
        Ok(self.shared.router.invoke_agent(prompt, agent_id).await?)
    }

    /// Runs one streaming agent invocation through the router.
    ///
    /// # Errors
    ///
    /// Propagates [`ExtensionError`] from the router.
    pub async fn invoke_agent_streamed(
        &self,
        prompt: &str,
        agent_id: Option<&str>,
        on_chunk: Arc<dyn Fn(&str) + Send + Sync>,
        on_tool_call: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> ContextResult<String> {
        Ok(self
            .shared
            .router
            .invoke_agent_streamed(prompt, agent_id, on_chunk, on_tool_call)
            .await?)
    }

    /// Resolves another extension, provided `id` is in this extension's
    /// declared `depends_on`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DependencyMissing`] if `id` was not declared
    /// or is not a known extension.
    pub async fn get_extension(&self, id: &ExtensionId) -> ContextResult<Arc<dyn Extension>> {
        if !self.depends_on.contains(id) {
            return Err(ContextError::DependencyMissing {
                requester: self.extension_id.to_string(),
                requested: id.to_string(),
            });
        }

        self.shared
            .extensions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ContextError::DependencyMissing {
                requester: self.extension_id.to_string(),
                requested: id.to_string(),
            })
    }

    /// Writes the sandbox's restart-request flag.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DataDir`] if the flag file cannot be written.
    pub fn request_restart(&self) -> ContextResult<()> {
        Ok(self.shared.paths.request_restart()?)
    }

    /// Signals the supervisor to stop the agent process.
    pub fn request_shutdown(&self) {
        self.shared.shutdown.notify_one();
    }

    /// Publishes `system.user.notify`; the loader's built-in handler routes
    /// it to `channel_id` (or the first-registered channel).
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Event`] if the journal write fails.
    pub async fn notify_user(&self, text: &str, channel_id: Option<&str>) -> ContextResult<()> {
        let payload = serde_json::json!({
            "text": text,
            "channel_id": channel_id,
        });
        self.emit("system.user.notify", payload, None).await
    }

    /// Returns the model router, populated by the loader.
    #[must_use]
    pub fn model_router(&self) -> Arc<ModelRouter> {
        Arc::clone(&self.shared.model_router)
    }

    /// Returns the shared tool registry.
    #[must_use]
    pub fn tools(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.shared.tools)
    }

    /// Returns the tool names resolved for this extension's `uses_tools`, if
    /// it is an agent-extension. Populated by the loader during
    /// `detect_and_wire`.
    pub async fn resolved_tools(&self) -> Vec<String> {
        self.resolved_tools.read().await.clone()
    }

    /// Loader-only: records the resolved tool list for this extension.
    pub(crate) async fn set_resolved_tools(&self, tools: Vec<String>) {
        *self.resolved_tools.write().await = tools;
    }
}
