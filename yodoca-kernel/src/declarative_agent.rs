//! Agent-extension built directly from a manifest's `agent:` block, with no
//! accompanying entrypoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;
use yodoca_llm::{InferenceRequest, MessageRole, PromptMessage};
use yodoca_primitives::{AgentBlock, AgentId, ExtensionId, IntegrationMode};

use crate::context::ExtensionContext;
use crate::interfaces::{
    AgentDescriptor, AgentInvocationContext, AgentInvocationOutcome, AgentInvocationStatus,
    AgentProvider, Extension, ExtensionError, ExtensionResult,
};

/// An `Extension` + `AgentProvider` synthesized from a manifest's `agent`
/// block. Runs a single completion against its bound model rather than a
/// full tool-calling loop, since [`yodoca_llm::ModelAdapter`] streams plain
/// text deltas and has no structured tool-call representation.
pub struct DeclarativeAgentExtension {
    extension_id: ExtensionId,
    block: AgentBlock,
    ctx: RwLock<Option<Arc<ExtensionContext>>>,
}

impl DeclarativeAgentExtension {
    /// Builds an agent-extension from its manifest id and `agent:` block.
    #[must_use]
    pub fn new(extension_id: ExtensionId, block: AgentBlock) -> Self {
        Self {
            extension_id,
            block,
            ctx: RwLock::new(None),
        }
    }

    async fn context(&self) -> Option<Arc<ExtensionContext>> {
        self.ctx.read().await.clone()
    }
}

#[async_trait]
impl Extension for DeclarativeAgentExtension {
    async fn initialize(&self, ctx: Arc<ExtensionContext>) -> ExtensionResult<()> {
        *self.ctx.write().await = Some(ctx);
        Ok(())
    }

    async fn start(&self) -> ExtensionResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ExtensionResult<()> {
        *self.ctx.write().await = None;
        Ok(())
    }

    fn as_agent_provider(self: Arc<Self>) -> Option<Arc<dyn AgentProvider>> {
        Some(self)
    }
}

#[async_trait]
impl AgentProvider for DeclarativeAgentExtension {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: AgentId::from(self.extension_id.clone()),
            description: format!("agent-extension `{}`", self.extension_id),
            integration_mode: self.block.integration_mode,
        }
    }

    async fn invoke(&self, prompt: &str, invocation_ctx: AgentInvocationContext) -> AgentInvocationOutcome {
        let Some(ctx) = self.context().await else {
            return AgentInvocationOutcome {
                status: AgentInvocationStatus::Error,
                content: "agent-extension invoked before initialize".to_owned(),
                finished: false,
            };
        };

        let agent_id = AgentId::from(self.extension_id.clone());
        let handle = match ctx.model_router().get_model(agent_id.as_str()) {
            Ok(handle) => handle,
            Err(err) => {
                return AgentInvocationOutcome {
                    status: AgentInvocationStatus::Error,
                    content: err.to_string(),
                    finished: false,
                };
            }
        };

        let mut system_prompt = self.block.instructions.clone();
        if let Some(summary) = invocation_ctx.conversation_summary {
            system_prompt.push_str("\n\nConversation so far:\n");
            system_prompt.push_str(&summary);
        }

        let messages = vec![PromptMessage::new(MessageRole::User, prompt)];
        let mut request = match InferenceRequest::new(messages) {
            Ok(request) => request.with_system_prompt(system_prompt),
            Err(err) => {
                return AgentInvocationOutcome {
                    status: AgentInvocationStatus::Error,
                    content: err.to_string(),
                    finished: false,
                };
            }
        };

        if let Some(temperature) = handle.settings().temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = handle.settings().max_tokens {
            request = request.with_max_output_tokens(max_tokens);
        }
        let resolved_tools = ctx.resolved_tools().await;
        if !resolved_tools.is_empty() {
            request = request.with_tools(resolved_tools);
        }

        let stream = match handle.adapter().infer(request).await {
            Ok(stream) => stream,
            Err(err) => {
                return AgentInvocationOutcome {
                    status: AgentInvocationStatus::Error,
                    content: err.to_string(),
                    finished: false,
                };
            }
        };

        use futures::StreamExt;
        let mut stream = stream;
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => content.push_str(&chunk.delta),
                Err(err) => {
                    warn!(agent = %self.extension_id, %err, "agent-extension inference chunk failed");
                    return AgentInvocationOutcome {
                        status: AgentInvocationStatus::Error,
                        content,
                        finished: false,
                    };
                }
            }
        }

        let matches_handoff = matches!(self.block.integration_mode, IntegrationMode::Handoff);
        AgentInvocationOutcome {
            status: AgentInvocationStatus::Success,
            content,
            finished: !matches_handoff,
        }
    }
}

/// Maps an [`AgentInvocationOutcome`] failure into an [`ExtensionError`] for
/// callers that need a `Result` rather than the status enum.
pub fn outcome_to_result(id: &ExtensionId, outcome: AgentInvocationOutcome) -> ExtensionResult<String> {
    match outcome.status {
        AgentInvocationStatus::Success => Ok(outcome.content),
        AgentInvocationStatus::Error | AgentInvocationStatus::Refused => Err(ExtensionError::Lifecycle {
            id: id.to_string(),
            phase: "invoke",
            reason: outcome.content,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yodoca_primitives::AgentLimits;

    fn block() -> AgentBlock {
        AgentBlock {
            integration_mode: IntegrationMode::Tool,
            model: "researcher".to_owned(),
            instructions: "You are a researcher.".to_owned(),
            parameters: Default::default(),
            uses_tools: vec!["web_search".to_owned()],
            uses_skills: Vec::new(),
            limits: AgentLimits::default(),
        }
    }

    #[tokio::test]
    async fn invoking_before_initialize_errors() {
        let extension = DeclarativeAgentExtension::new(ExtensionId::new("researcher").unwrap(), block());
        let outcome = extension.invoke("hello", AgentInvocationContext::default()).await;
        assert_eq!(outcome.status, AgentInvocationStatus::Error);
    }

    #[test]
    fn descriptor_reflects_manifest_block() {
        let extension = DeclarativeAgentExtension::new(ExtensionId::new("researcher").unwrap(), block());
        let descriptor = extension.descriptor();
        assert_eq!(descriptor.agent_id.as_str(), "researcher");
        assert_eq!(descriptor.integration_mode, IntegrationMode::Tool);
    }
}
