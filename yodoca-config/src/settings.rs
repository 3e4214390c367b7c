//! Typed schema for `config/settings.yaml` and the supervisor's
//! configuration-completeness gate.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SecretStore;

/// One `providers.<provider_id>` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider family (`openai`, `anthropic`, `gemini`, `ollama`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Override base URL, for self-hosted or proxy deployments.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of a secret holding the API key.
    #[serde(default)]
    pub api_key_secret: Option<String>,
    /// Literal API key, for local/throwaway setups. Prefer `api_key_secret`.
    #[serde(default)]
    pub api_key_literal: Option<String>,
    /// Headers sent with every request to this provider.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

/// One `agents.<agent_id>` entry, including the reserved `default` id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Provider id this agent resolves against.
    pub provider: String,
    /// Provider-specific model identifier.
    pub model: String,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Maximum response tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// `session.*` settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Inactivity threshold, in seconds, for session rotation.
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

const fn default_timeout_sec() -> u64 {
    1800
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_sec: default_timeout_sec(),
        }
    }
}

/// `task_engine.*` worker limits.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskEngineSettings {
    /// Maximum number of tasks claimed and run concurrently.
    #[serde(default)]
    pub max_concurrent_tasks: Option<u32>,
    /// Lease time-to-live, in seconds, for a claimed task.
    #[serde(default)]
    pub lease_ttl_sec: Option<u64>,
}

/// Reserved agent id used as the fallback when `agent_id` is unrecognised.
pub const DEFAULT_AGENT_ID: &str = "default";

/// Typed form of `config/settings.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Configured LLM providers, keyed by provider id.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Configured agent-id → provider/model bindings.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSettings>,
    /// Per-extension config overrides, keyed by extension id then key.
    #[serde(default)]
    pub extensions: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    /// Session rotation settings.
    #[serde(default)]
    pub session: SessionSettings,
    /// Task engine worker limits.
    #[serde(default)]
    pub task_engine: TaskEngineSettings,
}

impl Settings {
    /// Loads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Io`] if the file cannot be read, or
    /// [`SettingsError::Parse`] if its contents are not valid YAML for this
    /// schema.
    pub fn load(path: &Path) -> SettingsResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Looks up `extensions.<extension_id>.<key>`, falling back to `default`.
    #[must_use]
    pub fn extension_config(
        &self,
        extension_id: &str,
        key: &str,
        default: Option<&serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.extensions
            .get(extension_id)
            .and_then(|entries| entries.get(key))
            .cloned()
            .or_else(|| default.cloned())
    }

    /// Returns the agent settings for `agent_id`, falling back to `default`.
    #[must_use]
    pub fn agent_settings(&self, agent_id: &str) -> Option<&AgentSettings> {
        self.agents
            .get(agent_id)
            .or_else(|| self.agents.get(DEFAULT_AGENT_ID))
    }

    /// Evaluates the supervisor's configuration-completeness gate: the file
    /// parses, at least one provider is configured, every configured
    /// provider can resolve a credential, and `agents.default` names a
    /// configured provider.
    #[must_use]
    pub fn is_configured(&self, secrets: &dyn SecretStore) -> ConfiguredState {
        if self.providers.is_empty() {
            return ConfiguredState::incomplete("no providers configured");
        }

        for (provider_id, provider) in &self.providers {
            let has_literal = provider
                .api_key_literal
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty());
            if has_literal {
                continue;
            }

            match &provider.api_key_secret {
                None => {
                    return ConfiguredState::incomplete(format!(
                        "provider `{provider_id}` has neither api_key_literal nor api_key_secret"
                    ));
                }
                Some(secret_name) => match secrets.get_secret(secret_name) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return ConfiguredState::incomplete(format!(
                            "provider `{provider_id}` secret `{secret_name}` could not be resolved"
                        ));
                    }
                    Err(err) => {
                        return ConfiguredState::incomplete(format!(
                            "provider `{provider_id}` secret lookup failed: {err}"
                        ));
                    }
                },
            }
        }

        let Some(default_agent) = self.agents.get(DEFAULT_AGENT_ID) else {
            return ConfiguredState::incomplete("agents.default is not set");
        };

        if !self.providers.contains_key(&default_agent.provider) {
            return ConfiguredState::incomplete(format!(
                "agents.default references unconfigured provider `{}`",
                default_agent.provider
            ));
        }

        ConfiguredState::ok()
    }
}

/// Result of evaluating [`Settings::is_configured`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredState {
    ok: bool,
    reason: Option<String>,
}

impl ConfiguredState {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn incomplete(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }

    /// Returns whether configuration is sufficient to spawn the agent process.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    /// Returns the human-readable reason configuration is incomplete, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Result alias for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors raised while loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("failed to read settings file {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: std::path::PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file did not parse as valid YAML for this schema.
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: std::path::PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnvSecretStore;

    fn settings_yaml() -> &'static str {
        "\
providers:
  openai:
    type: openai
    api_key_literal: sk-test
agents:
  default:
    provider: openai
    model: gpt-4o-mini
"
    }

    #[test]
    fn parses_and_reports_configured() {
        let settings: Settings = serde_yaml::from_str(settings_yaml()).unwrap();
        let state = settings.is_configured(&EnvSecretStore);
        assert!(state.is_ok(), "{:?}", state.reason());
    }

    #[test]
    fn flags_missing_default_agent() {
        let yaml = "providers:\n  openai:\n    type: openai\n    api_key_literal: sk-test\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        let state = settings.is_configured(&EnvSecretStore);
        assert!(!state.is_ok());
        assert!(state.reason().unwrap().contains("agents.default"));
    }

    #[test]
    fn flags_unresolvable_secret() {
        let yaml = "\
providers:
  openai:
    type: openai
    api_key_secret: YODOCA_DEFINITELY_NOT_SET
agents:
  default:
    provider: openai
    model: gpt-4o-mini
";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        let state = settings.is_configured(&EnvSecretStore);
        assert!(!state.is_ok());
    }

    #[test]
    fn extension_config_falls_back_to_default() {
        let settings = Settings::default();
        let fallback = serde_json::json!("fallback");
        let value = settings.extension_config("telegram", "poll_interval", Some(&fallback));
        assert_eq!(value, Some(fallback));
    }
}
