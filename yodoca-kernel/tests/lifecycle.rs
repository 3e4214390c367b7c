//! End-to-end test: discover a manifest directory, run every lifecycle
//! phase, and drive a message through the router to a declarative agent
//! wired in as a tool.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde_json::json;
use sqlx::SqlitePool;
use yodoca_config::{EnvSecretStore, SandboxPaths, Settings};
use yodoca_eventbus::EventBus;
use yodoca_kernel::{ContextShared, Loader, MessageRouter, ModelRouter};
use yodoca_llm::{AdapterMetadata, AdapterResult, AdapterStream, InferenceChunk, InferenceRequest, ModelAdapter};
use yodoca_tools::registry::ToolRegistry;

struct StubAdapter {
    metadata: AdapterMetadata,
    reply: String,
}

#[async_trait::async_trait]
impl ModelAdapter for StubAdapter {
    fn metadata(&self) -> &AdapterMetadata {
        &self.metadata
    }

    async fn infer(&self, request: InferenceRequest) -> AdapterResult<AdapterStream> {
        let delta = if request.tools().is_empty() { self.reply.clone() } else { request.tools().join(",") };
        let chunk = InferenceChunk { delta, done: true };
        let stream: Pin<Box<dyn Stream<Item = AdapterResult<InferenceChunk>> + Send>> =
            Box::pin(futures::stream::once(async move { Ok(chunk) }));
        Ok(stream)
    }
}

fn write_manifest(dir: &std::path::Path, folder: &str, yaml: &str) {
    let path = dir.join(folder);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("manifest.yaml"), yaml).unwrap();
}

fn settings_with_researcher_agent() -> Settings {
    let mut settings = Settings::default();
    settings.providers.insert(
        "stub".to_owned(),
        yodoca_config::ProviderSettings {
            kind: "stub".to_owned(),
            base_url: None,
            api_key_secret: None,
            api_key_literal: None,
            default_headers: Default::default(),
        },
    );
    settings.agents.insert(
        "researcher".to_owned(),
        yodoca_config::AgentSettings {
            provider: "stub".to_owned(),
            model: "stub-model".to_owned(),
            temperature: None,
            max_tokens: None,
        },
    );
    settings
}

async fn shared(sandbox: &std::path::Path) -> Arc<ContextShared> {
    let paths = SandboxPaths::new(sandbox);
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let events = Arc::new(EventBus::new(pool).await.unwrap());
    let router = Arc::new(MessageRouter::new(Arc::clone(&events), std::time::Duration::from_secs(1800)));

    let settings = settings_with_researcher_agent();
    let model_router = Arc::new(ModelRouter::from_settings(&settings, &EnvSecretStore, &StubFactory).unwrap());

    Arc::new(ContextShared {
        settings: Arc::new(settings),
        secrets: Arc::new(EnvSecretStore),
        paths,
        events,
        router,
        model_router,
        tools: Arc::new(ToolRegistry::new()),
        extensions: Arc::new(tokio::sync::RwLock::new(std::collections::HashMap::new())),
        shutdown: Arc::new(tokio::sync::Notify::new()),
    })
}

struct StubFactory;

impl yodoca_kernel::AdapterFactory for StubFactory {
    fn build(
        &self,
        provider_id: &str,
        _provider: &yodoca_config::ProviderSettings,
        model: &str,
        _secrets: &dyn yodoca_config::SecretStore,
    ) -> Result<Arc<dyn ModelAdapter>, String> {
        let provider: &'static str = Box::leak(provider_id.to_owned().into_boxed_str());
        Ok(Arc::new(StubAdapter {
            metadata: AdapterMetadata::new(provider, model),
            reply: "the answer is 42".to_owned(),
        }))
    }
}

#[tokio::test]
async fn loader_wires_declarative_agent_as_tool_and_routes_a_message() {
    let sandbox = tempfile::tempdir().unwrap();
    let extensions_dir = sandbox.path().join("extensions");
    std::fs::create_dir_all(&extensions_dir).unwrap();

    write_manifest(
        &extensions_dir,
        "researcher",
        "\
id: researcher
name: Researcher
version: 1.0.0
agent:
  integration_mode: tool
  model: researcher
  instructions: \"You are a researcher.\"
",
    );

    let shared = shared(sandbox.path()).await;
    let paths = SandboxPaths::new(sandbox.path());
    let loader = Loader::discover_and_construct(Arc::clone(&shared), &paths).expect("discovery succeeds");

    loader.initialize_all().await.expect("initialize succeeds");
    loader.detect_and_wire().await;
    loader.start_all().await.expect("start succeeds");

    let tools = shared.tools.list();
    assert!(tools.iter().any(|m| m.name() == "agent_researcher"), "agent tool should be registered");

    let result = shared
        .tools
        .invoke("agent_researcher", json!({ "prompt": "what is the answer?" }))
        .await
        .expect("tool invocation succeeds");
    assert_eq!(result["status"], "Success");
    assert_eq!(result["content"], "the answer is 42");

    loader.stop_all().await;
}

struct SearchToolExtension;

#[async_trait::async_trait]
impl yodoca_kernel::Extension for SearchToolExtension {
    async fn initialize(&self, _ctx: Arc<yodoca_kernel::ExtensionContext>) -> yodoca_kernel::ExtensionResult<()> {
        Ok(())
    }

    async fn start(&self) -> yodoca_kernel::ExtensionResult<()> {
        Ok(())
    }

    async fn stop(&self) -> yodoca_kernel::ExtensionResult<()> {
        Ok(())
    }

    fn as_tool_provider(self: Arc<Self>) -> Option<Arc<dyn yodoca_kernel::ToolProvider>> {
        Some(self)
    }
}

impl yodoca_kernel::ToolProvider for SearchToolExtension {
    fn tools(&self) -> Vec<yodoca_tools::registry::ToolBinding> {
        vec![yodoca_tools::registry::ToolBinding::new(
            yodoca_tools::registry::ToolMetadata::new("search", "1.0.0").unwrap(),
            run_search,
        )]
    }
}

fn run_search(_input: serde_json::Value) -> yodoca_tools::registry::ToolFuture {
    Box::pin(async { Ok(serde_json::json!({})) })
}

inventory::submit! {
    yodoca_kernel::ExtensionRegistration {
        entrypoint: "searcher::build",
        build: || Arc::new(SearchToolExtension),
    }
}

#[tokio::test]
async fn loader_resolves_uses_tools_to_what_actually_registered() {
    let sandbox = tempfile::tempdir().unwrap();
    let extensions_dir = sandbox.path().join("extensions");
    std::fs::create_dir_all(&extensions_dir).unwrap();

    write_manifest(
        &extensions_dir,
        "searcher",
        "id: searcher\nname: Searcher\nversion: 1.0.0\nentrypoint: searcher::build\n",
    );
    write_manifest(
        &extensions_dir,
        "researcher",
        "\
id: researcher
name: Researcher
version: 1.0.0
agent:
  integration_mode: tool
  model: researcher
  instructions: \"You are a researcher.\"
  uses_tools: [search, does_not_exist]
",
    );

    let shared = shared(sandbox.path()).await;
    let paths = SandboxPaths::new(sandbox.path());
    let loader = Loader::discover_and_construct(Arc::clone(&shared), &paths).expect("discovery succeeds");

    loader.initialize_all().await.expect("initialize succeeds");
    loader.detect_and_wire().await;
    loader.start_all().await.expect("start succeeds");

    let result = shared
        .tools
        .invoke("agent_researcher", json!({ "prompt": "what can you search?" }))
        .await
        .expect("tool invocation succeeds");
    assert_eq!(result["status"], "Success");
    assert_eq!(result["content"], "search", "unregistered `does_not_exist` must be dropped from the resolved list");

    loader.stop_all().await;
}
