//! Typed extension manifest, its raw YAML form, and validation.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, ExtensionId, Result};

/// Whether an agent-extension is invoked as a tool of the orchestrator or
/// takes over the conversation directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    /// The orchestrator calls the agent-extension like any other tool.
    Tool,
    /// The agent-extension takes over message routing for the session.
    Handoff,
}

/// Resource limits applied to an agent-extension's invocations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentLimits {
    /// Maximum ReAct turns before the invocation is forced to stop.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Maximum tokens spent across the invocation.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Wall-clock budget in milliseconds.
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
}

/// Declarative `agent` block signalling an extension is an agent-extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentBlock {
    /// Tool vs handoff integration with the orchestrator.
    pub integration_mode: IntegrationMode,
    /// `agent_id` this block resolves models for via the model router.
    pub model: String,
    /// Inline instructions text, or a path to a file containing them.
    pub instructions: String,
    /// Free-form model parameters (temperature, top_p, ...).
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Tool ids this agent-extension may call.
    #[serde(default)]
    pub uses_tools: Vec<String>,
    /// Skill ids this agent-extension may call.
    #[serde(default)]
    pub uses_skills: Vec<String>,
    /// Turn/token/time limits.
    #[serde(default)]
    pub limits: AgentLimits,
}

/// One entry of the `agent_config` map: provider/model override for an `agent_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfigEntry {
    /// LLM provider name (`openai`, `anthropic`, `gemini`, `ollama`, ...).
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

/// Built-in handler names an extension may request for a subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeHandler {
    /// Deliver the event payload to the user through the owning channel.
    NotifyUser,
    /// Extension registers its own in-code handler at `initialize` time.
    Custom,
}

/// One `events.subscribes` declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeDecl {
    /// Dotted topic string.
    pub topic: String,
    /// Which handler services this subscription.
    pub handler: SubscribeHandler,
}

/// `events` block: declared publish/subscribe topics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventsDecl {
    /// Topics this extension may publish to.
    #[serde(default)]
    pub publishes: Vec<String>,
    /// Topics this extension subscribes to.
    #[serde(default)]
    pub subscribes: Vec<SubscribeDecl>,
}

/// One `schedules` entry for a scheduler-providing extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Human-readable schedule name.
    pub name: String,
    /// Five-field cron expression.
    pub cron: String,
    /// Task payload goal dispatched at each tick.
    pub task: String,
}

/// Raw, directly-deserialised shape of `manifest.yaml`.
///
/// Kept separate from [`ExtensionManifest`] because the raw form allows
/// partially-specified documents that still need cross-field validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawManifest {
    /// Declared extension id; must equal the containing folder name.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Optional human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Optional entrypoint reference; absent means a declarative agent.
    #[serde(default)]
    pub entrypoint: Option<String>,
    /// Extension ids that must be `ACTIVE`/`INITIALIZED` first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form config map, read back through the extension context.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Names of secrets this extension requires to function.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// If false, the extension is skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Declarative agent-extension block.
    #[serde(default)]
    pub agent: Option<AgentBlock>,
    /// Per-`agent_id` model router overrides.
    #[serde(default)]
    pub agent_config: BTreeMap<String, AgentConfigEntry>,
    /// Declared publish/subscribe topics.
    #[serde(default)]
    pub events: EventsDecl,
    /// Scheduler entries, for extensions that provide timers.
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

const fn default_enabled() -> bool {
    true
}

/// Parses a standard five-field cron expression (`min hour day_of_month
/// month day_of_week`), the only grammar `schedules` entries accept. The
/// `cron` crate requires a leading seconds field, so a well-formed
/// five-field expression is normalized by prepending `0` before parsing;
/// anything else (including the crate's native six/seven-field syntax)
/// is rejected rather than silently accepted.
///
/// # Errors
///
/// Returns a message naming the field-count mismatch, or the underlying
/// parse error if the normalized five-field expression is still invalid.
pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, String> {
    let field_count = expr.split_whitespace().count();
    if field_count != 5 {
        return Err(format!(
            "expected a 5-field cron expression (min hour day month weekday), got {field_count} fields"
        ));
    }
    cron::Schedule::from_str(&format!("0 {expr}")).map_err(|source| source.to_string())
}

/// Validated, typed extension manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtensionManifest {
    id: ExtensionId,
    name: String,
    version: String,
    description: Option<String>,
    entrypoint: Option<String>,
    depends_on: Vec<ExtensionId>,
    config: BTreeMap<String, serde_json::Value>,
    secrets: Vec<String>,
    enabled: bool,
    agent: Option<AgentBlock>,
    agent_config: BTreeMap<String, AgentConfigEntry>,
    events: EventsDecl,
    schedules: Vec<ScheduleEntry>,
}

impl ExtensionManifest {
    /// Parses and validates a manifest's YAML source against the folder name
    /// it was discovered under.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestInvalid`] if the YAML cannot be parsed or any
    /// structural constraint from the manifest contract is violated.
    pub fn from_yaml(yaml: &str, folder_name: &str) -> Result<Self> {
        let raw: RawManifest = serde_yaml::from_str(yaml).map_err(|source| Error::ManifestInvalid {
            reason: format!("yaml parse error: {source}"),
        })?;
        Self::from_raw(raw, folder_name)
    }

    /// Validates an already-deserialised [`RawManifest`] against the folder
    /// name it was discovered under.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestInvalid`] if any structural constraint is
    /// violated: empty/mismatched id, missing entrypoint without a complete
    /// declarative agent block, an unrecognised subscribe handler, or an
    /// unparsable cron expression.
    pub fn from_raw(raw: RawManifest, folder_name: &str) -> Result<Self> {
        if raw.id.trim().is_empty() {
            return Err(Error::ManifestInvalid {
                reason: "manifest id cannot be empty".into(),
            });
        }
        if raw.id != folder_name {
            return Err(Error::ManifestInvalid {
                reason: format!(
                    "manifest id `{}` does not match extension folder `{folder_name}`",
                    raw.id
                ),
            });
        }

        let has_entrypoint = raw.entrypoint.is_some();
        let has_declarative_agent = raw
            .agent
            .as_ref()
            .is_some_and(|a| !a.model.trim().is_empty() && !a.instructions.trim().is_empty());
        if !has_entrypoint && !has_declarative_agent {
            return Err(Error::ManifestInvalid {
                reason: "either entrypoint must be set, or agent.model and agent.instructions must both be set".into(),
            });
        }

        for entry in &raw.schedules {
            parse_cron(&entry.cron).map_err(|reason| Error::ManifestInvalid {
                reason: format!("schedule `{}` has invalid cron `{}`: {reason}", entry.name, entry.cron),
            })?;
        }

        let id = ExtensionId::new(raw.id)?;
        let depends_on = raw
            .depends_on
            .into_iter()
            .map(ExtensionId::new)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            name: raw.name,
            version: raw.version,
            description: raw.description,
            entrypoint: raw.entrypoint,
            depends_on,
            config: raw.config,
            secrets: raw.secrets,
            enabled: raw.enabled,
            agent: raw.agent,
            agent_config: raw.agent_config,
            events: raw.events,
            schedules: raw.schedules,
        })
    }

    /// Validates that every `depends_on` entry refers to an id present in
    /// `known_ids`. Call once all manifests in a folder have been loaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestInvalid`] naming the first unresolved
    /// dependency.
    pub fn validate_against_folder(&self, known_ids: &[ExtensionId]) -> Result<()> {
        for dep in &self.depends_on {
            if !known_ids.contains(dep) {
                return Err(Error::ManifestInvalid {
                    reason: format!("`{}` depends_on unknown extension `{dep}`", self.id),
                });
            }
        }
        Ok(())
    }

    /// Returns the extension id.
    #[must_use]
    pub fn id(&self) -> &ExtensionId {
        &self.id
    }

    /// Returns the human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the semantic version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the entrypoint reference, if the extension ships code.
    #[must_use]
    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint.as_deref()
    }

    /// Returns ids this extension must wait on before activating.
    #[must_use]
    pub fn depends_on(&self) -> &[ExtensionId] {
        &self.depends_on
    }

    /// Returns the free-form config map.
    #[must_use]
    pub fn config(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.config
    }

    /// Returns the secret names this extension requires.
    #[must_use]
    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    /// Returns whether this extension should be loaded at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the declarative agent block, if this is an agent-extension.
    #[must_use]
    pub fn agent(&self) -> Option<&AgentBlock> {
        self.agent.as_ref()
    }

    /// Returns whether this manifest declares an agent-extension.
    #[must_use]
    pub fn is_agent_extension(&self) -> bool {
        self.agent.is_some()
    }

    /// Returns the `agent_id → config` overrides registered with the model router.
    #[must_use]
    pub fn agent_config(&self) -> &BTreeMap<String, AgentConfigEntry> {
        &self.agent_config
    }

    /// Returns the declared publish/subscribe topics.
    #[must_use]
    pub fn events(&self) -> &EventsDecl {
        &self.events
    }

    /// Returns the scheduler entries this extension provides.
    #[must_use]
    pub fn schedules(&self) -> &[ScheduleEntry] {
        &self.schedules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "id: demo\nname: Demo\nversion: 1.0.0\nentrypoint: demo::build\n"
    }

    #[test]
    fn parses_minimal_manifest() {
        let manifest = ExtensionManifest::from_yaml(minimal_yaml(), "demo").expect("valid manifest");
        assert_eq!(manifest.id().as_str(), "demo");
        assert!(!manifest.is_agent_extension());
    }

    #[test]
    fn rejects_folder_mismatch() {
        let err = ExtensionManifest::from_yaml(minimal_yaml(), "other").expect_err("mismatch should fail");
        assert!(matches!(err, Error::ManifestInvalid { .. }));
    }

    #[test]
    fn rejects_missing_entrypoint_and_agent() {
        let yaml = "id: demo\nname: Demo\nversion: 1.0.0\n";
        let err = ExtensionManifest::from_yaml(yaml, "demo").expect_err("should require one of the two");
        assert!(matches!(err, Error::ManifestInvalid { .. }));
    }

    #[test]
    fn accepts_declarative_agent_without_entrypoint() {
        let yaml = "\
id: researcher
name: Researcher
version: 1.0.0
agent:
  integration_mode: tool
  model: researcher
  instructions: \"You are a researcher.\"
";
        let manifest = ExtensionManifest::from_yaml(yaml, "researcher").expect("valid manifest");
        assert!(manifest.is_agent_extension());
    }

    #[test]
    fn rejects_invalid_cron() {
        let yaml = "\
id: scheduler
name: Scheduler
version: 1.0.0
entrypoint: scheduler::build
schedules:
  - name: daily
    cron: not-a-cron
    task: run daily digest
";
        let err = ExtensionManifest::from_yaml(yaml, "scheduler").expect_err("bad cron should fail");
        assert!(matches!(err, Error::ManifestInvalid { .. }));
    }

    #[test]
    fn accepts_five_field_cron_and_rejects_six_field_cron() {
        assert!(parse_cron("0 9 * * *").is_ok());
        assert!(parse_cron("0 0 9 * * *").is_err());
    }

    #[test]
    fn validates_dependencies_against_known_ids() {
        let yaml = "\
id: demo
name: Demo
version: 1.0.0
entrypoint: demo::build
depends_on: [missing]
";
        let manifest = ExtensionManifest::from_yaml(yaml, "demo").expect("parses");
        let known = vec![ExtensionId::new("demo").unwrap()];
        let err = manifest
            .validate_against_folder(&known)
            .expect_err("unknown dependency should fail");
        assert!(matches!(err, Error::ManifestInvalid { .. }));
    }
}
