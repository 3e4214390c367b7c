//! The default orchestrator agent: a single-shot completion against the
//! `default` model, with every registered tool name declared on the
//! request. Installed via [`crate::router::MessageRouter::set_agent`]
//! once the loader finishes wiring extensions, so the same object also
//! backs task-engine step dispatch.
//!
//! Runs one completion per invocation rather than a runtime tool-calling
//! loop, for the same reason [`crate::declarative_agent`] does: the
//! [`yodoca_llm::ModelAdapter`] stream carries plain text deltas and no
//! structured tool-call event, so multi-round tool execution is left to
//! providers with server-side function-calling.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use yodoca_config::DEFAULT_AGENT_ID;
use yodoca_llm::{InferenceRequest, MessageRole, PromptMessage};
use yodoca_tools::registry::ToolRegistry;

use crate::interfaces::{ContextProvider, ExtensionError, ExtensionResult};
use crate::model_router::ModelRouter;
use crate::router::AgentHandle;

/// Builds the system prompt handed to every orchestrator completion:
/// fixed instructions plus a capabilities summary listing every tool the
/// loader wired in by the time `build_orchestrator` ran.
#[must_use]
pub fn capabilities_summary(tools: &ToolRegistry) -> String {
    let mut summary = String::from(
        "You are the orchestrator agent for a single-user autonomous runtime. \
         You may call any of the following tools by name when they help answer \
         the user:\n",
    );
    for metadata in tools.list() {
        summary.push_str("- ");
        summary.push_str(metadata.name());
        if let Some(description) = metadata.description() {
            summary.push_str(": ");
            summary.push_str(description);
        }
        summary.push('\n');
    }
    summary
}

/// Default [`AgentHandle`], grounded on a fixed system prompt and the
/// live tool registry rather than any one manifest's `agent:` block.
pub struct Orchestrator {
    model_router: Arc<ModelRouter>,
    tools: Arc<ToolRegistry>,
    instructions: String,
    context_providers: Vec<Arc<dyn ContextProvider>>,
}

impl Orchestrator {
    /// Builds an orchestrator that resolves `agent_id` (or `default`)
    /// against `model_router` and threads every tool name currently in
    /// `tools` onto each request. `context_providers` runs ascending by
    /// `context_priority`, each augmenting the prompt the last one produced.
    #[must_use]
    pub fn new(
        model_router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        instructions: impl Into<String>,
        mut context_providers: Vec<Arc<dyn ContextProvider>>,
    ) -> Self {
        context_providers.sort_by_key(|provider| provider.context_priority());
        Self {
            model_router,
            tools,
            instructions: instructions.into(),
            context_providers,
        }
    }

    async fn system_prompt(&self) -> ExtensionResult<String> {
        let mut prompt = self.instructions.clone();
        prompt.push_str("\n\n");
        prompt.push_str(&capabilities_summary(&self.tools));
        for provider in &self.context_providers {
            prompt = provider.provide_context(&prompt).await?;
        }
        Ok(prompt)
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.list().into_iter().map(|m| m.name().to_owned()).collect()
    }

    async fn run(&self, prompt: &str, agent_id: Option<&str>) -> ExtensionResult<InferredResponse> {
        let agent_id = agent_id.unwrap_or(DEFAULT_AGENT_ID);
        let handle = self.model_router.get_model(agent_id).map_err(|err| ExtensionError::Lifecycle {
            id: agent_id.to_owned(),
            phase: "invoke",
            reason: err.to_string(),
        })?;

        let system_prompt = self.system_prompt().await?;
        let messages = vec![PromptMessage::new(MessageRole::User, prompt)];
        let mut request = InferenceRequest::new(messages)
            .map_err(|err| ExtensionError::Lifecycle {
                id: agent_id.to_owned(),
                phase: "invoke",
                reason: err.to_string(),
            })?
            .with_system_prompt(system_prompt);

        if let Some(temperature) = handle.settings().temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = handle.settings().max_tokens {
            request = request.with_max_output_tokens(max_tokens);
        }
        let tool_names = self.tool_names();
        if !tool_names.is_empty() {
            request = request.with_tools(tool_names);
        }

        let stream = handle.adapter().infer(request).await.map_err(|err| ExtensionError::Lifecycle {
            id: agent_id.to_owned(),
            phase: "invoke",
            reason: err.to_string(),
        })?;

        Ok(InferredResponse { stream })
    }
}

struct InferredResponse {
    stream: yodoca_llm::AdapterStream,
}

#[async_trait]
impl AgentHandle for Orchestrator {
    async fn invoke(&self, prompt: &str, agent_id: Option<&str>) -> ExtensionResult<String> {
        let InferredResponse { mut stream } = self.run(prompt, agent_id).await?;
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ExtensionError::Lifecycle {
                id: agent_id.unwrap_or(DEFAULT_AGENT_ID).to_owned(),
                phase: "invoke",
                reason: err.to_string(),
            })?;
            content.push_str(&chunk.delta);
        }
        Ok(content)
    }

    async fn invoke_streamed(
        &self,
        prompt: &str,
        agent_id: Option<&str>,
        on_chunk: Arc<dyn Fn(&str) + Send + Sync>,
        _on_tool_call: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> ExtensionResult<String> {
        let InferredResponse { mut stream } = self.run(prompt, agent_id).await?;
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ExtensionError::Lifecycle {
                id: agent_id.unwrap_or(DEFAULT_AGENT_ID).to_owned(),
                phase: "invoke",
                reason: err.to_string(),
            })?;
            on_chunk(&chunk.delta);
            content.push_str(&chunk.delta);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use futures::Stream;
    use yodoca_config::{AgentSettings, EnvSecretStore, ProviderSettings, Settings};
    use yodoca_llm::{AdapterMetadata, AdapterResult, InferenceChunk, ModelAdapter};

    struct StubAdapter {
        metadata: AdapterMetadata,
    }

    #[async_trait]
    impl ModelAdapter for StubAdapter {
        fn metadata(&self) -> &AdapterMetadata {
            &self.metadata
        }

        async fn infer(&self, request: InferenceRequest) -> AdapterResult<yodoca_llm::AdapterStream> {
            let saw_tools = !request.tools().is_empty();
            let delta = if saw_tools { "used tools".to_owned() } else { "no tools".to_owned() };
            let chunk = InferenceChunk { delta, done: true };
            let stream: Pin<Box<dyn Stream<Item = AdapterResult<InferenceChunk>> + Send>> =
                Box::pin(futures::stream::once(async move { Ok(chunk) }));
            Ok(stream)
        }
    }

    struct StubFactory;
    impl crate::model_router::AdapterFactory for StubFactory {
        fn build(
            &self,
            provider_id: &str,
            _provider: &ProviderSettings,
            model: &str,
            _secrets: &dyn yodoca_config::SecretStore,
        ) -> Result<Arc<dyn ModelAdapter>, String> {
            let provider: &'static str = Box::leak(provider_id.to_owned().into_boxed_str());
            Ok(Arc::new(StubAdapter { metadata: AdapterMetadata::new(provider, model) }))
        }
    }

    struct EchoPromptAdapter {
        metadata: AdapterMetadata,
    }

    #[async_trait]
    impl ModelAdapter for EchoPromptAdapter {
        fn metadata(&self) -> &AdapterMetadata {
            &self.metadata
        }

        async fn infer(&self, request: InferenceRequest) -> AdapterResult<yodoca_llm::AdapterStream> {
            let chunk = InferenceChunk {
                delta: request.system_prompt().unwrap_or_default().to_owned(),
                done: true,
            };
            let stream: Pin<Box<dyn Stream<Item = AdapterResult<InferenceChunk>> + Send>> =
                Box::pin(futures::stream::once(async move { Ok(chunk) }));
            Ok(stream)
        }
    }

    struct EchoPromptFactory;
    impl crate::model_router::AdapterFactory for EchoPromptFactory {
        fn build(
            &self,
            provider_id: &str,
            _provider: &ProviderSettings,
            model: &str,
            _secrets: &dyn yodoca_config::SecretStore,
        ) -> Result<Arc<dyn ModelAdapter>, String> {
            let provider: &'static str = Box::leak(provider_id.to_owned().into_boxed_str());
            Ok(Arc::new(EchoPromptAdapter { metadata: AdapterMetadata::new(provider, model) }))
        }
    }

    struct TaggingContextProvider {
        priority: i32,
        tag: &'static str,
    }

    #[async_trait]
    impl ContextProvider for TaggingContextProvider {
        fn context_priority(&self) -> i32 {
            self.priority
        }

        async fn provide_context(&self, base_prompt: &str) -> ExtensionResult<String> {
            Ok(format!("{base_prompt}[{}]", self.tag))
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.providers.insert(
            "stub".to_owned(),
            ProviderSettings {
                kind: "stub".to_owned(),
                base_url: None,
                api_key_secret: None,
                api_key_literal: None,
                default_headers: Default::default(),
            },
        );
        settings.agents.insert(
            DEFAULT_AGENT_ID.to_owned(),
            AgentSettings {
                provider: "stub".to_owned(),
                model: "stub-model".to_owned(),
                temperature: None,
                max_tokens: None,
            },
        );
        settings
    }

    #[tokio::test]
    async fn invoke_threads_registered_tool_names_onto_the_request() {
        let settings = settings();
        let model_router = Arc::new(ModelRouter::from_settings(&settings, &EnvSecretStore, &StubFactory).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let metadata = yodoca_tools::registry::ToolMetadata::new("list_channels", "1.0.0").unwrap();
        tools
            .register_tool(metadata, |_input: serde_json::Value| async { Ok(serde_json::json!([])) })
            .unwrap();

        let orchestrator = Orchestrator::new(model_router, tools, "You are the orchestrator.", Vec::new());
        let reply = orchestrator.invoke("hello", None).await.unwrap();
        assert_eq!(reply, "used tools");
    }

    #[tokio::test]
    async fn invoke_streamed_forwards_every_delta() {
        let settings = settings();
        let model_router = Arc::new(ModelRouter::from_settings(&settings, &EnvSecretStore, &StubFactory).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let orchestrator = Orchestrator::new(model_router, tools, "You are the orchestrator.", Vec::new());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_cb = Arc::clone(&seen);
        let reply = orchestrator
            .invoke_streamed("hello", Some(DEFAULT_AGENT_ID), Arc::new(move |delta: &str| seen_for_cb.lock().unwrap().push(delta.to_owned())), None)
            .await
            .unwrap();

        assert_eq!(reply, "no tools");
        assert_eq!(seen.lock().unwrap().as_slice(), ["no tools"]);
    }

    #[tokio::test]
    async fn context_providers_apply_in_ascending_priority_order() {
        let settings = settings();
        let model_router = Arc::new(ModelRouter::from_settings(&settings, &EnvSecretStore, &EchoPromptFactory).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let providers: Vec<Arc<dyn ContextProvider>> = vec![
            Arc::new(TaggingContextProvider { priority: 10, tag: "second" }),
            Arc::new(TaggingContextProvider { priority: 0, tag: "first" }),
        ];

        let orchestrator = Orchestrator::new(model_router, tools, "base", providers);
        let reply = orchestrator.invoke("hello", None).await.unwrap();
        assert!(reply.starts_with("base"));
        assert!(reply.ends_with("[first][second]"));
    }
}
