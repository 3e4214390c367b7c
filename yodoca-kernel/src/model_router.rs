//! Model router: the only place in the kernel that resolves an agent id to
//! a concrete model adapter and its provider configuration.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use yodoca_config::{AgentSettings, ProviderSettings, SecretStore, Settings};
use yodoca_llm::ModelAdapter;

/// Reserved agent id used when a requested id has no explicit binding.
const DEFAULT_AGENT_ID: &str = "default";

/// Builds a model adapter for one configured provider.
///
/// Implemented by the binary crate that knows about concrete provider
/// adapters (OpenAI, Anthropic, Gemini, Ollama); the kernel never branches
/// on provider type directly.
pub trait AdapterFactory: Send + Sync {
    /// Constructs an adapter for `provider`, resolving credentials through
    /// `secrets`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the provider type is unknown or
    /// its credentials cannot be resolved.
    fn build(
        &self,
        provider_id: &str,
        provider: &ProviderSettings,
        model: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Arc<dyn ModelAdapter>, String>;
}

/// A resolved agent binding: its settings plus a ready-to-use adapter.
#[derive(Clone)]
pub struct ModelHandle {
    settings: AgentSettings,
    adapter: Arc<dyn ModelAdapter>,
}

impl ModelHandle {
    /// Returns the agent settings (provider id, model, sampling params).
    #[must_use]
    pub const fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Returns the adapter used to run inference for this agent.
    #[must_use]
    pub fn adapter(&self) -> Arc<dyn ModelAdapter> {
        Arc::clone(&self.adapter)
    }
}

/// Errors raised while resolving or registering model bindings.
#[derive(Debug, Error)]
pub enum ModelRouterError {
    /// No binding is registered and no `default` binding exists either.
    #[error("no model binding for agent `{agent_id}` and no default is configured")]
    NoDefault {
        /// Agent id that could not be resolved.
        agent_id: String,
    },

    /// The adapter factory could not build an adapter for a configured agent.
    #[error("failed to build adapter for agent `{agent_id}`: {reason}")]
    AdapterConstruction {
        /// Agent id whose adapter failed to build.
        agent_id: String,
        /// Reason reported by the factory.
        reason: String,
    },
}

/// Result alias for model router operations.
pub type ModelRouterResult<T> = Result<T, ModelRouterError>;

/// Maps `agent_id → ModelHandle`, built at startup from global settings and
/// extended by extensions during `initialize`.
pub struct ModelRouter {
    bindings: std::sync::RwLock<HashMap<String, ModelHandle>>,
}

impl ModelRouter {
    /// Builds the router from `settings`, resolving every configured agent
    /// eagerly so startup fails fast on a broken provider configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ModelRouterError::AdapterConstruction`] if any configured
    /// agent's adapter cannot be built.
    pub fn from_settings(
        settings: &Settings,
        secrets: &dyn SecretStore,
        factory: &dyn AdapterFactory,
    ) -> ModelRouterResult<Self> {
        let mut bindings = HashMap::new();

        for (agent_id, agent) in &settings.agents {
            let Some(provider) = settings.providers.get(&agent.provider) else {
                warn!(%agent_id, provider = %agent.provider, "agent references unconfigured provider");
                continue;
            };

            let adapter = factory
                .build(&agent.provider, provider, &agent.model, secrets)
                .map_err(|reason| ModelRouterError::AdapterConstruction {
                    agent_id: agent_id.clone(),
                    reason,
                })?;

            bindings.insert(
                agent_id.clone(),
                ModelHandle {
                    settings: agent.clone(),
                    adapter,
                },
            );
        }

        Ok(Self {
            bindings: std::sync::RwLock::new(bindings),
        })
    }

    /// Registers or replaces the binding for `agent_id`, as extensions may
    /// do during `initialize`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register(&self, agent_id: &str, handle: ModelHandle) {
        self.bindings
            .write()
            .expect("model router poisoned")
            .insert(agent_id.to_owned(), handle);
    }

    /// Resolves `agent_id`, falling back to `default` when unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ModelRouterError::NoDefault`] if neither `agent_id` nor
    /// `default` is registered.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn get_model(&self, agent_id: &str) -> ModelRouterResult<ModelHandle> {
        let bindings = self.bindings.read().expect("model router poisoned");
        bindings
            .get(agent_id)
            .or_else(|| bindings.get(DEFAULT_AGENT_ID))
            .cloned()
            .ok_or_else(|| ModelRouterError::NoDefault {
                agent_id: agent_id.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use futures::Stream;
    use yodoca_config::EnvSecretStore;
    use yodoca_llm::{AdapterMetadata, AdapterResult, AdapterStream, InferenceRequest};

    struct StubAdapter {
        metadata: AdapterMetadata,
    }

    #[async_trait::async_trait]
    impl ModelAdapter for StubAdapter {
        fn metadata(&self) -> &AdapterMetadata {
            &self.metadata
        }

        async fn infer(&self, _request: InferenceRequest) -> AdapterResult<AdapterStream> {
            let stream: Pin<Box<dyn Stream<Item = AdapterResult<yodoca_llm::InferenceChunk>> + Send>> =
                Box::pin(futures::stream::empty());
            Ok(stream)
        }
    }

    struct StubFactory;

    impl AdapterFactory for StubFactory {
        fn build(
            &self,
            provider_id: &str,
            _provider: &ProviderSettings,
            model: &str,
            _secrets: &dyn SecretStore,
        ) -> Result<Arc<dyn ModelAdapter>, String> {
            Ok(Arc::new(StubAdapter {
                metadata: AdapterMetadata::new(Box::leak(provider_id.to_owned().into_boxed_str()), model),
            }))
        }
    }

    fn settings() -> Settings {
        let yaml = "\
providers:
  openai:
    type: openai
    api_key_literal: sk-test
agents:
  default:
    provider: openai
    model: gpt-4o-mini
";
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unknown_agent_falls_back_to_default() {
        let router = ModelRouter::from_settings(&settings(), &EnvSecretStore, &StubFactory).unwrap();
        let handle = router.get_model("nonexistent").unwrap();
        assert_eq!(handle.settings().model, "gpt-4o-mini");
    }

    #[test]
    fn errors_without_any_default() {
        let router = ModelRouter::from_settings(&Settings::default(), &EnvSecretStore, &StubFactory).unwrap();
        let err = router.get_model("whatever").expect_err("no bindings at all");
        assert!(matches!(err, ModelRouterError::NoDefault { .. }));
    }
}
