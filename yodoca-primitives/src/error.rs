//! Shared error definitions for the primitives crate.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while constructing or validating core identifiers and manifests.
#[derive(Debug, Error)]
pub enum Error {
    /// A task identifier could not be parsed as a UUID.
    #[error("invalid task id: {source}")]
    InvalidTaskId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// An extension identifier failed validation.
    #[error("invalid extension id `{id}`: {reason}")]
    InvalidExtensionId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// An agent identifier (execution target) failed validation.
    #[error("invalid agent id `{id}`: {reason}")]
    InvalidAgentId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// The extension manifest violated one of its structural constraints.
    #[error("invalid manifest: {reason}")]
    ManifestInvalid {
        /// Human-readable reason for rejection.
        reason: String,
    },
}
