//! Identifier types shared across the runtime.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

const MAX_ID_LEN: usize = 64;

fn validate_identifier(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("identifier cannot be empty");
    }
    if id.len() > MAX_ID_LEN {
        return Err("identifier length must be <= 64");
    }
    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err("identifier must contain alphanumeric, dash, underscore, or dot");
    }
    Ok(())
}

/// Unique identifier for an extension, validated to match its folder name on disk.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    /// Creates a new extension id after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidExtensionId`] if the identifier is empty, too
    /// long, or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_identifier(&id).map_err(|reason| Error::InvalidExtensionId {
            id: id.clone(),
            reason: reason.into(),
        })?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ExtensionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ExtensionId> for String {
    fn from(value: ExtensionId) -> Self {
        value.0
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier naming the agent execution target for a task or invocation.
///
/// Either the literal `orchestrator`, or the id of an agent-extension that
/// satisfies the agent-provider capability.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Identifier reserved for the orchestrator agent.
    pub const ORCHESTRATOR: &'static str = "orchestrator";

    /// Creates a new agent id after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAgentId`] if the identifier is empty, too
    /// long, or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_identifier(&id).map_err(|reason| Error::InvalidAgentId {
            id: id.clone(),
            reason: reason.into(),
        })?;
        Ok(Self(id))
    }

    /// Returns the identifier reserved for the orchestrator agent.
    #[must_use]
    pub fn orchestrator() -> Self {
        Self(Self::ORCHESTRATOR.to_owned())
    }

    /// Returns true if this id refers to the orchestrator.
    #[must_use]
    pub fn is_orchestrator(&self) -> bool {
        self.0 == Self::ORCHESTRATOR
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ExtensionId> for AgentId {
    fn from(value: ExtensionId) -> Self {
        Self(value.0)
    }
}

/// Unique identifier for a durable task row in the task engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a random task identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an identifier from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TaskId> for Uuid {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(Error::from)?;
        Ok(Self::from_uuid(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_task_id() {
        let id = TaskId::random();
        let parsed = id.to_string().parse::<TaskId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_empty_extension_id() {
        let err = ExtensionId::new("").expect_err("empty id should fail");
        assert!(matches!(err, Error::InvalidExtensionId { .. }));
    }

    #[test]
    fn orchestrator_is_recognised() {
        let id = AgentId::orchestrator();
        assert!(id.is_orchestrator());
        assert_eq!(id.as_str(), "orchestrator");
    }

    #[test]
    fn extension_id_converts_to_agent_id() {
        let ext = ExtensionId::new("researcher").expect("valid id");
        let agent: AgentId = ext.into();
        assert_eq!(agent.as_str(), "researcher");
    }
}
