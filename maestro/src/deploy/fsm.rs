//! Finite state machine for one deployment target

use serde::Serialize;

use crate::errors::FailureReason;

/// Pipeline state of a single host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    /// Waiting to be scheduled
    Pending,

    /// Opening the command channel
    Connecting,

    /// Checking or installing the container runtime
    Installing,

    /// Waiting on the shared image build
    Building,

    /// Replacing and starting containers
    Deploying,

    /// Containers verified running
    Succeeded,

    /// Stopped at some stage
    Failed(FailureReason),
}

impl TargetState {
    pub fn kind(&self) -> TargetStateKind {
        match self {
            TargetState::Pending => TargetStateKind::Pending,
            TargetState::Connecting => TargetStateKind::Connecting,
            TargetState::Installing => TargetStateKind::Installing,
            TargetState::Building => TargetStateKind::Building,
            TargetState::Deploying => TargetStateKind::Deploying,
            TargetState::Succeeded => TargetStateKind::Succeeded,
            TargetState::Failed(_) => TargetStateKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Succeeded | TargetState::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            TargetState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Fieldless view of [`TargetState`] used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStateKind {
    Pending,
    Connecting,
    Installing,
    Building,
    Deploying,
    Succeeded,
    Failed,
}

/// Pipeline event
#[derive(Debug, Clone)]
pub enum TargetEvent {
    Connect,
    Install,
    Build,
    Deploy,
    Succeed,
    Fail(FailureReason),
}

/// Target FSM
///
/// Transitions only move forward. `Succeeded` and `Failed` are terminal and
/// a failed target is never retried within the same run.
#[derive(Debug, Clone)]
pub struct TargetFsm {
    state: TargetState,
}

impl TargetFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: TargetState::Pending,
        }
    }

    /// Get current state
    pub fn state(&self) -> &TargetState {
        &self.state
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: TargetEvent) -> Result<&TargetState, String> {
        let new_state = match (&self.state, event) {
            (TargetState::Pending, TargetEvent::Connect) => TargetState::Connecting,
            (TargetState::Connecting, TargetEvent::Install) => TargetState::Installing,
            (TargetState::Installing, TargetEvent::Build) => TargetState::Building,
            (TargetState::Building, TargetEvent::Deploy) => TargetState::Deploying,
            (TargetState::Deploying, TargetEvent::Succeed) => TargetState::Succeeded,

            // Any stage may fail, including a target still pending at cancellation
            (state, TargetEvent::Fail(reason)) if !state.is_terminal() => TargetState::Failed(reason),

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(&self.state)
    }
}

impl Default for TargetFsm {
    fn default() -> Self {
        Self::new()
    }
}
