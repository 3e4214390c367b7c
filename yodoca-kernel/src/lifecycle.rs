//! Extension lifecycle state machine.
//!
//! States and transitions are driven exclusively by the loader (`C6`); no
//! other component may mutate an extension's lifecycle state directly.

use thiserror::Error;
use tracing::debug;
use yodoca_primitives::ExtensionId;

/// States an extension can occupy during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    /// Manifest parsed and construction completed; not yet initialized.
    Loaded,
    /// `initialize(context)` has returned and wiring has been performed.
    Initialized,
    /// `start()` has returned; the extension is taking part in the runtime.
    Active,
    /// A health check or lifecycle call failed; the extension is quarantined.
    Error,
    /// `stop()` has returned; no further work is dispatched to it.
    Stopped,
}

impl ExtensionState {
    /// Returns `true` if handlers may run against an extension in this state.
    ///
    /// Invariant: no handler may run against an extension in `Error` or
    /// `Stopped`.
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Initialized | Self::Active)
    }

    /// Returns `true` once the extension has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Events that trigger a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `initialize()` and detect-and-wire both completed successfully.
    Initialize,
    /// `start()` returned successfully.
    Start,
    /// A lifecycle call or health check failed.
    Fail,
    /// `stop()` returned (or is about to be called) and the extension is retired.
    Stop,
}

/// Per-extension lifecycle controller.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    extension_id_hash: u64,
    state: ExtensionState,
}

impl Lifecycle {
    /// Constructs a lifecycle controller in the initial `Loaded` state.
    #[must_use]
    pub fn new(extension_id: &ExtensionId) -> Self {
        Self {
            extension_id_hash: hash_id(extension_id),
            state: ExtensionState::Loaded,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ExtensionState {
        self.state
    }

    /// Applies a lifecycle event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// permitted from the current state.
    pub fn transition(&mut self, event: LifecycleEvent) -> LifecycleResult<ExtensionState> {
        let next = match (self.state, event) {
            (ExtensionState::Loaded, LifecycleEvent::Initialize) => Some(ExtensionState::Initialized),
            (ExtensionState::Initialized, LifecycleEvent::Start) => Some(ExtensionState::Active),
            (
                ExtensionState::Loaded | ExtensionState::Initialized | ExtensionState::Active,
                LifecycleEvent::Fail,
            ) => Some(ExtensionState::Error),
            (
                ExtensionState::Initialized | ExtensionState::Active | ExtensionState::Error,
                LifecycleEvent::Stop,
            ) => Some(ExtensionState::Stopped),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(?self.state, ?next_state, ?event, "extension lifecycle transition");
            self.state = next_state;
        }

        Ok(self.state)
    }
}

fn hash_id(id: &ExtensionId) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.as_str().hash(&mut hasher);
    hasher.finish()
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from:?} via {event:?}")]
    InvalidTransition {
        /// State prior to the attempted transition.
        from: ExtensionState,
        /// Event that triggered the failure.
        event: LifecycleEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ExtensionId {
        ExtensionId::new("demo").unwrap()
    }

    #[test]
    fn loaded_to_active_flow() {
        let mut lifecycle = Lifecycle::new(&id());
        assert_eq!(lifecycle.state(), ExtensionState::Loaded);
        lifecycle.transition(LifecycleEvent::Initialize).unwrap();
        assert_eq!(lifecycle.state(), ExtensionState::Initialized);
        lifecycle.transition(LifecycleEvent::Start).unwrap();
        assert!(lifecycle.state().accepts_work());
    }

    #[test]
    fn failure_quarantines_and_then_stops() {
        let mut lifecycle = Lifecycle::new(&id());
        lifecycle.transition(LifecycleEvent::Initialize).unwrap();
        lifecycle.transition(LifecycleEvent::Fail).unwrap();
        assert_eq!(lifecycle.state(), ExtensionState::Error);
        assert!(!lifecycle.state().accepts_work());
        lifecycle.transition(LifecycleEvent::Stop).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn cannot_start_before_initialize() {
        let mut lifecycle = Lifecycle::new(&id());
        let err = lifecycle
            .transition(LifecycleEvent::Start)
            .expect_err("start should require initialize first");
        matches!(err, LifecycleError::InvalidTransition { .. });
    }

    #[test]
    fn stop_is_terminal() {
        let mut lifecycle = Lifecycle::new(&id());
        lifecycle.transition(LifecycleEvent::Initialize).unwrap();
        lifecycle.transition(LifecycleEvent::Start).unwrap();
        lifecycle.transition(LifecycleEvent::Stop).unwrap();
        let err = lifecycle
            .transition(LifecycleEvent::Start)
            .expect_err("no transitions out of stopped");
        matches!(err, LifecycleError::InvalidTransition { .. });
    }
}
