//! The concrete `AdapterFactory`: the only place that branches on a
//! provider's `type` string to build a real `ModelAdapter`.

use std::sync::Arc;
use std::time::Duration;

use yodoca_config::{ProviderSettings, SecretStore};
use yodoca_llm::{anthropic, gemini, ollama, openai, ModelAdapter};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

fn resolve_api_key(provider: &ProviderSettings, secrets: &dyn SecretStore) -> Result<Option<String>, String> {
    if let Some(literal) = provider.api_key_literal.as_deref() {
        if !literal.trim().is_empty() {
            return Ok(Some(literal.to_owned()));
        }
    }
    let Some(secret_name) = &provider.api_key_secret else {
        return Ok(None);
    };
    secrets
        .get_secret(secret_name)
        .map_err(|err| format!("failed to resolve secret `{secret_name}`: {err}"))
}

/// Builds adapters for the provider families `yodoca-llm` implements.
pub struct RealAdapterFactory;

impl yodoca_kernel::AdapterFactory for RealAdapterFactory {
    fn build(
        &self,
        provider_id: &str,
        provider: &ProviderSettings,
        model: &str,
        secrets: &dyn SecretStore,
    ) -> Result<Arc<dyn ModelAdapter>, String> {
        let api_key = resolve_api_key(provider, secrets)?;

        match provider.kind.as_str() {
            "openai" => {
                let mut config = openai::OpenAiConfig::new(model);
                if let Some(key) = api_key {
                    config = config.with_api_key(key);
                }
                Ok(Arc::new(openai::OpenAiAdapter::new(config)))
            }
            "anthropic" => {
                let mut config = anthropic::AnthropicConfig::new(model).with_timeout(DEFAULT_TIMEOUT);
                if let Some(base_url) = &provider.base_url {
                    config = config.with_base_url(base_url).map_err(|err| err.to_string())?;
                }
                if let Some(key) = api_key {
                    config = config.with_api_key(key);
                }
                let adapter = anthropic::AnthropicAdapter::new(config).map_err(|err| err.to_string())?;
                Ok(Arc::new(adapter))
            }
            "gemini" => {
                let mut config = gemini::GeminiConfig::new(model).with_timeout(DEFAULT_TIMEOUT);
                if let Some(base_url) = &provider.base_url {
                    config = config.with_base_url(base_url).map_err(|err| err.to_string())?;
                }
                if let Some(key) = api_key {
                    config = config.with_api_key(key);
                }
                let adapter = gemini::GeminiAdapter::new(config).map_err(|err| err.to_string())?;
                Ok(Arc::new(adapter))
            }
            "ollama" => {
                let mut config = ollama::OllamaConfig::new(model).with_timeout(DEFAULT_TIMEOUT);
                if let Some(base_url) = &provider.base_url {
                    config = config.with_base_url(base_url).map_err(|err| err.to_string())?;
                }
                let adapter = ollama::OllamaAdapter::new(config).map_err(|err| err.to_string())?;
                Ok(Arc::new(adapter))
            }
            other => Err(format!("unknown provider type `{other}` for provider `{provider_id}`")),
        }
    }
}
