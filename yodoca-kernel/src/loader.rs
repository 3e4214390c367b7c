//! Extension discovery, dependency ordering, and the five-phase lifecycle
//! driver: initialize → detect-and-wire → start → health → stop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};
use yodoca_config::SandboxPaths;
use yodoca_eventbus::{EventHandler, EventRecord, EventResult};
use yodoca_primitives::{ExtensionId, ExtensionManifest, SubscribeHandler};

use crate::context::{ContextShared, ExtensionContext};
use crate::declarative_agent::DeclarativeAgentExtension;
use crate::interfaces::{ContextProvider, Extension, SetupProvider};
use crate::lifecycle::{Lifecycle, LifecycleEvent};
use crate::router::RegisteredChannel;

/// Builder function an extension crate submits via `inventory::submit!`,
/// keyed by the `entrypoint` string from its manifest.
pub struct ExtensionRegistration {
    /// `entrypoint` value this builder answers for.
    pub entrypoint: &'static str,
    /// Constructs a fresh, uninitialized instance of the extension.
    pub build: fn() -> Arc<dyn Extension>,
}

inventory::collect!(ExtensionRegistration);

/// Result alias for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors raised while discovering, ordering, or driving extensions through
/// their lifecycle.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// A manifest could not be parsed or failed validation.
    #[error(transparent)]
    Manifest(#[from] yodoca_primitives::Error),

    /// The extensions directory could not be scanned.
    #[error("failed to scan extensions directory: {0}")]
    Discovery(#[from] std::io::Error),

    /// `depends_on` edges formed a cycle.
    #[error("dependency cycle among extensions: {}", .cycle.join(" -> "))]
    DependencyCycle {
        /// Extension ids participating in the cycle, in discovery order.
        cycle: Vec<String>,
    },

    /// An entrypoint was declared but no builder registered for it.
    #[error("extension `{id}` declares entrypoint `{entrypoint}` with no registered builder")]
    UnknownEntrypoint {
        /// Offending extension id.
        id: String,
        /// Entrypoint string that could not be resolved.
        entrypoint: String,
    },

    /// A lifecycle phase failed for an extension.
    #[error(transparent)]
    Lifecycle(#[from] crate::interfaces::ExtensionError),
}

/// Discovers and validates every manifest under `paths.extensions_dir()`,
/// skipping disabled extensions entirely.
///
/// # Errors
///
/// Returns [`LoaderError::Discovery`] if the directory cannot be read, or
/// [`LoaderError::Manifest`] if a manifest fails to parse or cross-validate.
pub fn discover(paths: &SandboxPaths) -> LoaderResult<Vec<ExtensionManifest>> {
    let dir = paths.extensions_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut manifests = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let folder_name = entry.file_name().to_string_lossy().into_owned();
        let manifest_path = entry.path().join("manifest.yaml");
        if !manifest_path.exists() {
            warn!(folder = %folder_name, "extension folder has no manifest.yaml, skipping");
            continue;
        }

        let yaml = std::fs::read_to_string(&manifest_path)?;
        let manifest = ExtensionManifest::from_yaml(&yaml, &folder_name)?;

        if !manifest.enabled() {
            info!(id = %manifest.id(), "extension disabled, skipping");
            continue;
        }

        manifests.push(manifest);
    }

    let known_ids: Vec<ExtensionId> = manifests.iter().map(|m| m.id().clone()).collect();
    for manifest in &manifests {
        manifest.validate_against_folder(&known_ids)?;
    }

    Ok(manifests)
}

/// Returns `manifests` reordered so every extension precedes its dependents.
///
/// # Errors
///
/// Returns [`LoaderError::DependencyCycle`] if `depends_on` edges form a
/// cycle.
pub fn topological_order(manifests: Vec<ExtensionManifest>) -> LoaderResult<Vec<ExtensionManifest>> {
    let by_id: HashMap<ExtensionId, ExtensionManifest> =
        manifests.into_iter().map(|m| (m.id().clone(), m)).collect();

    let mut in_degree: HashMap<ExtensionId, usize> = by_id.keys().map(|id| (id.clone(), 0)).collect();
    let mut dependents: HashMap<ExtensionId, Vec<ExtensionId>> = HashMap::new();

    for (id, manifest) in &by_id {
        for dep in manifest.depends_on() {
            *in_degree.get_mut(id).expect("id present") += 1;
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }

    let mut ready: VecDeque<ExtensionId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut ordered_ids = Vec::with_capacity(by_id.len());
    while let Some(id) = ready.pop_front() {
        ordered_ids.push(id.clone());
        if let Some(children) = dependents.get(&id) {
            for child in children {
                let degree = in_degree.get_mut(child).expect("child present");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child.clone());
                }
            }
        }
    }

    if ordered_ids.len() != by_id.len() {
        let remaining: Vec<String> = by_id
            .keys()
            .filter(|id| !ordered_ids.contains(id))
            .map(ToString::to_string)
            .collect();
        return Err(LoaderError::DependencyCycle { cycle: remaining });
    }

    let mut by_id = by_id;
    Ok(ordered_ids
        .into_iter()
        .map(|id| by_id.remove(&id).expect("ordered id present"))
        .collect())
}

/// Constructs (but does not initialize) one extension from its manifest.
///
/// # Errors
///
/// Returns [`LoaderError::UnknownEntrypoint`] if an `entrypoint` is declared
/// with no matching registration.
pub fn construct(manifest: &ExtensionManifest) -> LoaderResult<Arc<dyn Extension>> {
    if let Some(entrypoint) = manifest.entrypoint() {
        for registration in inventory::iter::<ExtensionRegistration> {
            if registration.entrypoint == entrypoint {
                return Ok((registration.build)());
            }
        }
        return Err(LoaderError::UnknownEntrypoint {
            id: manifest.id().to_string(),
            entrypoint: entrypoint.to_owned(),
        });
    }

    let block = manifest
        .agent()
        .expect("manifest validation guarantees entrypoint or agent block")
        .clone();
    Ok(Arc::new(DeclarativeAgentExtension::new(manifest.id().clone(), block)))
}

/// Bridges a manifest's `events.subscribes` declaration of handler
/// `notify_user` to the shared event bus, routing payloads to the channel
/// named in the event (or the first-registered channel).
struct NotifyUserHandler {
    shared: Arc<ContextShared>,
}

#[async_trait::async_trait]
impl EventHandler for NotifyUserHandler {
    async fn handle(&self, event: &EventRecord) -> EventResult<()> {
        let text = event
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let channel_id = event
            .payload
            .get("channel_id")
            .and_then(|v| v.as_str());

        if let Err(err) = self.shared.router.notify_user(text, channel_id).await {
            warn!(%err, topic = %event.topic, "notify_user subscription failed to deliver");
        }
        Ok(())
    }
}

/// Drives the whole extension population through its five-phase lifecycle.
pub struct Loader {
    shared: Arc<ContextShared>,
    extensions: Vec<(ExtensionManifest, Arc<dyn Extension>, std::sync::Mutex<Lifecycle>)>,
    contexts: std::sync::Mutex<HashMap<ExtensionId, Arc<ExtensionContext>>>,
    context_providers: std::sync::Mutex<Vec<Arc<dyn ContextProvider>>>,
    setup_providers: std::sync::Mutex<Vec<Arc<dyn SetupProvider>>>,
}

impl Loader {
    /// Discovers, orders, and constructs every enabled extension under
    /// `paths.extensions_dir()`.
    ///
    /// # Errors
    ///
    /// Propagates any [`LoaderError`] raised during discovery, ordering, or
    /// construction.
    pub fn discover_and_construct(shared: Arc<ContextShared>, paths: &SandboxPaths) -> LoaderResult<Self> {
        let manifests = topological_order(discover(paths)?)?;

        let mut extensions = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let extension = construct(&manifest)?;
            let lifecycle = std::sync::Mutex::new(Lifecycle::new(manifest.id()));
            extensions.push((manifest, extension, lifecycle));
        }

        Ok(Self {
            shared,
            extensions,
            contexts: std::sync::Mutex::new(HashMap::new()),
            context_providers: std::sync::Mutex::new(Vec::new()),
            setup_providers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Phase 1: calls `initialize` on every extension in dependency order,
    /// registering each in the shared extension registry as it succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first [`LoaderError::Lifecycle`] encountered; extensions
    /// already initialized remain registered.
    pub async fn initialize_all(&self) -> LoaderResult<()> {
        for (manifest, extension, lifecycle) in &self.extensions {
            let ctx = Arc::new(ExtensionContext::new(
                manifest.id().clone(),
                manifest.depends_on().to_vec(),
                manifest.config().clone(),
                Arc::clone(&self.shared),
            ));

            if let Err(err) = extension.initialize(Arc::clone(&ctx)).await {
                lifecycle
                    .lock()
                    .expect("lifecycle poisoned")
                    .transition(LifecycleEvent::Fail)
                    .ok();
                error!(id = %manifest.id(), %err, "extension failed to initialize");
                return Err(err.into());
            }

            self.shared
                .extensions
                .write()
                .await
                .insert(manifest.id().clone(), Arc::clone(extension));
            self.contexts.lock().expect("lock poisoned").insert(manifest.id().clone(), ctx);

            lifecycle
                .lock()
                .expect("lifecycle poisoned")
                .transition(LifecycleEvent::Initialize)
                .ok();
        }

        Ok(())
    }

    /// Phase 2: asks each extension which capabilities it satisfies and
    /// wires it into the router, tool registry, and event-subscription
    /// bridges accordingly.
    pub async fn detect_and_wire(&self) {
        for (manifest, extension, _) in &self.extensions {
            let extension = Arc::clone(extension);

            if let Some(channel) = Arc::clone(&extension).as_channel() {
                let description = channel.description().to_owned();
                self.shared
                    .router
                    .register_channel(
                        manifest.id().as_str(),
                        &description,
                        RegisteredChannel::Plain(channel),
                    )
                    .await;
            } else if let Some(streaming) = Arc::clone(&extension).as_streaming_channel() {
                let description = streaming.description().to_owned();
                self.shared
                    .router
                    .register_channel(
                        manifest.id().as_str(),
                        &description,
                        RegisteredChannel::Streaming(streaming),
                    )
                    .await;
            }

            if let Some(provider) = Arc::clone(&extension).as_tool_provider() {
                for binding in provider.tools() {
                    if let Err(err) = self.shared.tools.register_binding(binding) {
                        warn!(id = %manifest.id(), %err, "tool registration failed");
                    }
                }
            }

            if let Some(agent) = Arc::clone(&extension).as_agent_provider() {
                self.wire_agent_provider(manifest.id(), agent);
            }

            if let Some(provider) = Arc::clone(&extension).as_context_provider() {
                self.context_providers.lock().expect("lock poisoned").push(provider);
            }

            if let Some(provider) = Arc::clone(&extension).as_setup_provider() {
                self.setup_providers.lock().expect("lock poisoned").push(provider);
            }

            for subscribe in &manifest.events().subscribes {
                match subscribe.handler {
                    SubscribeHandler::NotifyUser => {
                        let handler = Arc::new(NotifyUserHandler {
                            shared: Arc::clone(&self.shared),
                        });
                        self.shared
                            .events
                            .subscribe(&subscribe.topic, manifest.id().as_str(), handler)
                            .await;
                    }
                    SubscribeHandler::Custom => {
                        // Extension registers its own handler during `initialize`.
                    }
                }
            }
        }

        self.context_providers
            .lock()
            .expect("lock poisoned")
            .sort_by_key(|provider| provider.context_priority());

        // Every tool-provider has registered by this point; resolve each
        // agent-extension's declared `uses_tools` against what actually made
        // it into the registry and hand the filtered list to its context.
        for (manifest, _, _) in &self.extensions {
            let Some(block) = manifest.agent() else { continue };
            let mut resolved = Vec::with_capacity(block.uses_tools.len());
            for tool_name in &block.uses_tools {
                if self.shared.tools.get(tool_name).is_some() {
                    resolved.push(tool_name.clone());
                } else {
                    warn!(id = %manifest.id(), tool = %tool_name, "agent-extension declares uses_tools for an unregistered tool");
                }
            }

            let ctx = self.contexts.lock().expect("lock poisoned").get(manifest.id()).cloned();
            if let Some(ctx) = ctx {
                ctx.set_resolved_tools(resolved).await;
            }
        }
    }

    /// Returns the registered context providers, ordered ascending by
    /// `context_priority`. Populated by [`Self::detect_and_wire`].
    #[must_use]
    pub fn context_providers(&self) -> Vec<Arc<dyn ContextProvider>> {
        self.context_providers.lock().expect("lock poisoned").clone()
    }

    /// Runs onboarding for every registered setup provider, in registration
    /// order. Stops at the first provider that reports a non-zero exit code
    /// (cancelled or retry, per its own `run_onboarding` contract).
    ///
    /// # Errors
    ///
    /// Returns a [`LoaderError::Lifecycle`] if a provider's `run_onboarding`
    /// call itself fails, or names the first provider that did not report
    /// success (`0`).
    pub async fn run_onboarding(&self) -> LoaderResult<()> {
        let providers = self.setup_providers.lock().expect("lock poisoned").clone();
        for provider in providers {
            let code = provider.run_onboarding().await?;
            if code != 0 {
                return Err(LoaderError::Lifecycle(crate::interfaces::ExtensionError::Lifecycle {
                    id: "setup_provider".to_owned(),
                    phase: "run_onboarding",
                    reason: format!("onboarding exited with code {code}"),
                }));
            }
        }
        Ok(())
    }

    /// Wires an agent-extension into the orchestrator. `Tool` mode registers
    /// an `agent_<id>` tool that invokes it; `Handoff` mode is acknowledged
    /// but its delegation state machine is not implemented yet.
    fn wire_agent_provider(&self, id: &ExtensionId, agent: Arc<dyn crate::interfaces::AgentProvider>) {
        let descriptor = agent.descriptor();
        match descriptor.integration_mode {
            yodoca_primitives::IntegrationMode::Tool => {
                let tool_name = format!("agent_{id}");
                let metadata = match yodoca_tools::registry::ToolMetadata::new(tool_name.clone(), "1.0.0")
                    .map(|m| m.with_description(descriptor.description.clone()))
                {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!(%id, %err, "failed to build tool metadata for agent-extension");
                        return;
                    }
                };

                let agent = Arc::clone(&agent);
                let executor = move |input: serde_json::Value| {
                    let agent = Arc::clone(&agent);
                    async move {
                        let prompt = input
                            .get("prompt")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned();
                        let outcome = agent
                            .invoke(&prompt, crate::interfaces::AgentInvocationContext::default())
                            .await;
                        Ok(serde_json::json!({
                            "status": format!("{:?}", outcome.status),
                            "content": outcome.content,
                            "finished": outcome.finished,
                        }))
                    }
                };

                if let Err(err) = self.shared.tools.register_tool(metadata, executor) {
                    warn!(%id, %err, "failed to register agent-extension as a tool");
                }
            }
            yodoca_primitives::IntegrationMode::Handoff => {
                info!(%id, "agent-extension declares handoff integration; delegation is not wired yet");
            }
        }
    }

    /// Phase 3: starts every extension (spawning `run_background` for
    /// service providers) and advances each lifecycle to `Active`.
    ///
    /// # Errors
    ///
    /// Returns the first [`LoaderError::Lifecycle`] encountered.
    pub async fn start_all(&self) -> LoaderResult<()> {
        for (manifest, extension, lifecycle) in &self.extensions {
            if let Err(err) = extension.start().await {
                lifecycle
                    .lock()
                    .expect("lifecycle poisoned")
                    .transition(LifecycleEvent::Fail)
                    .ok();
                error!(id = %manifest.id(), %err, "extension failed to start");
                return Err(err.into());
            }

            if let Some(service) = Arc::clone(extension).as_service_provider() {
                let id = manifest.id().clone();
                tokio::spawn(async move {
                    if let Err(err) = service.run_background().await {
                        error!(%id, %err, "service provider background task exited with error");
                    }
                });
            }

            lifecycle
                .lock()
                .expect("lifecycle poisoned")
                .transition(LifecycleEvent::Start)
                .ok();
        }

        Ok(())
    }

    /// Phase 4: runs forever, polling `health_check` on every `Active`
    /// extension every 30 seconds and quarantining (`stop`, transition to
    /// `Error`) any that fail.
    pub async fn health_monitor(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            for (manifest, extension, lifecycle) in &self.extensions {
                let healthy = extension.health_check().await;
                if !healthy {
                    warn!(id = %manifest.id(), "extension failed health check, stopping");
                    if let Err(err) = extension.stop().await {
                        error!(id = %manifest.id(), %err, "extension failed to stop after health check failure");
                    }
                    lifecycle
                        .lock()
                        .expect("lifecycle poisoned")
                        .transition(LifecycleEvent::Fail)
                        .ok();
                }
            }
        }
    }

    /// Phase 5: stops every extension in reverse topological order.
    pub async fn stop_all(&self) {
        for (manifest, extension, lifecycle) in self.extensions.iter().rev() {
            if let Err(err) = extension.stop().await {
                warn!(id = %manifest.id(), %err, "extension failed to stop cleanly");
            }
            lifecycle
                .lock()
                .expect("lifecycle poisoned")
                .transition(LifecycleEvent::Stop)
                .ok();
        }
    }

    /// Returns the cron schedule entries contributed by every
    /// scheduler-providing extension, paired with the extension id that
    /// owns them.
    #[must_use]
    pub fn collect_schedules(&self) -> Vec<(ExtensionId, yodoca_primitives::ScheduleEntry)> {
        let mut schedules = Vec::new();
        for (manifest, extension, _) in &self.extensions {
            if let Some(provider) = Arc::clone(extension).as_scheduler_provider() {
                for entry in provider.schedules() {
                    schedules.push((manifest.id().clone(), entry));
                }
            }
        }
        schedules
    }

    /// Validates that every collected schedule's cron expression parses,
    /// used at startup before spawning the tick loop.
    ///
    /// # Errors
    ///
    /// Returns the first parse error encountered, as a string.
    pub fn validate_schedules(&self) -> Result<(), String> {
        for (id, entry) in self.collect_schedules() {
            yodoca_primitives::parse_cron(&entry.cron)
                .map_err(|reason| format!("extension `{id}` schedule `{}`: {reason}", entry.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, depends_on: &[&str]) -> ExtensionManifest {
        let deps = depends_on
            .iter()
            .map(|d| format!("  - {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        let yaml = format!(
            "id: {id}\nname: {id}\nversion: 1.0.0\nentrypoint: {id}::build\ndepends_on:\n{deps}\n"
        );
        ExtensionManifest::from_yaml(&yaml, id).unwrap()
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let manifests = vec![manifest("b", &["a"]), manifest("a", &[])];
        let ordered = topological_order(manifests).unwrap();
        let ids: Vec<_> = ordered.iter().map(|m| m.id().as_str().to_owned()).collect();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn detects_dependency_cycle() {
        let manifests = vec![manifest("a", &["b"]), manifest("b", &["a"])];
        let err = topological_order(manifests).expect_err("cycle should be rejected");
        assert!(matches!(err, LoaderError::DependencyCycle { .. }));
    }

    #[test]
    fn unknown_entrypoint_is_reported() {
        let manifest = manifest("lonely", &[]);
        let err = construct(&manifest).expect_err("no builder registered for this entrypoint");
        assert!(matches!(err, LoaderError::UnknownEntrypoint { .. }));
    }

    #[test]
    fn discover_returns_empty_for_missing_directory() {
        let paths = SandboxPaths::new(std::env::temp_dir().join("yodoca-loader-test-missing"));
        let manifests = discover(&paths).unwrap();
        assert!(manifests.is_empty());
    }
}
