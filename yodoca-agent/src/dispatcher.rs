//! Bridges the task engine's step dispatch to the same orchestrator used
//! for conversational turns, so there is exactly one place that knows how
//! to run a completion against a declared tool list.

use std::sync::Arc;

use async_trait::async_trait;
use yodoca_kernel::router::AgentHandle;
use yodoca_kernel::Orchestrator;
use yodoca_taskengine::{AgentDispatcher, DispatchContext, DispatchOutcome, DispatchStatus};

/// Adapts [`Orchestrator`] to the task engine's narrower per-step contract.
pub struct OrchestratorDispatcher {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorDispatcher {
    /// Wraps the shared orchestrator for task-engine dispatch.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl AgentDispatcher for OrchestratorDispatcher {
    async fn dispatch(&self, agent_id: &str, prompt: &str, ctx: DispatchContext) -> DispatchOutcome {
        let mut full_prompt = prompt.to_owned();
        if let Some(summary) = ctx.conversation_summary {
            full_prompt.push_str("\n\nProgress so far:\n");
            full_prompt.push_str(&summary);
        }

        match self.orchestrator.invoke(&full_prompt, Some(agent_id)).await {
            Ok(content) => DispatchOutcome {
                status: DispatchStatus::Success,
                content,
                finished: true,
            },
            Err(err) => DispatchOutcome {
                status: DispatchStatus::Error,
                content: err.to_string(),
                finished: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use futures::Stream;
    use yodoca_config::{AgentSettings, EnvSecretStore, ProviderSettings, Settings};
    use yodoca_kernel::model_router::AdapterFactory;
    use yodoca_kernel::ModelRouter;
    use yodoca_llm::{AdapterMetadata, AdapterResult, AdapterStream, InferenceChunk, InferenceRequest, ModelAdapter};
    use yodoca_tools::registry::ToolRegistry;

    struct EchoAdapter {
        metadata: AdapterMetadata,
    }

    #[async_trait]
    impl ModelAdapter for EchoAdapter {
        fn metadata(&self) -> &AdapterMetadata {
            &self.metadata
        }

        async fn infer(&self, _request: InferenceRequest) -> AdapterResult<AdapterStream> {
            let chunk = InferenceChunk { delta: "step done".to_owned(), done: true };
            let stream: Pin<Box<dyn Stream<Item = AdapterResult<InferenceChunk>> + Send>> =
                Box::pin(futures::stream::once(async move { Ok(chunk) }));
            Ok(stream)
        }
    }

    struct EchoFactory;
    impl AdapterFactory for EchoFactory {
        fn build(
            &self,
            provider_id: &str,
            _provider: &ProviderSettings,
            model: &str,
            _secrets: &dyn yodoca_config::SecretStore,
        ) -> Result<Arc<dyn ModelAdapter>, String> {
            let provider: &'static str = Box::leak(provider_id.to_owned().into_boxed_str());
            Ok(Arc::new(EchoAdapter { metadata: AdapterMetadata::new(provider, model) }))
        }
    }

    fn dispatcher() -> OrchestratorDispatcher {
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
            "worker".to_owned(),
            AgentSettings { provider: "stub".to_owned(), model: "stub-model".to_owned(), temperature: None, max_tokens: None },
        );

        let model_router = Arc::new(ModelRouter::from_settings(&settings, &EnvSecretStore, &EchoFactory).unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(model_router, tools, "You run one task-engine step.", Vec::new()));
        OrchestratorDispatcher::new(orchestrator)
    }

    #[tokio::test]
    async fn dispatch_reports_success_and_marks_the_step_finished() {
        let outcome = dispatcher()
            .dispatch("worker", "do the thing", DispatchContext { conversation_summary: None, correlation_id: "corr-1".to_owned() })
            .await;

        assert_eq!(outcome.status, DispatchStatus::Success);
        assert_eq!(outcome.content, "step done");
        assert!(outcome.finished);
    }

    #[tokio::test]
    async fn dispatch_reports_error_for_an_unresolvable_agent_id() {
        let outcome = dispatcher()
            .dispatch("no-such-agent", "do the thing", DispatchContext { conversation_summary: None, correlation_id: "corr-1".to_owned() })
            .await;

        assert_eq!(outcome.status, DispatchStatus::Error);
        assert!(!outcome.finished);
    }
}
