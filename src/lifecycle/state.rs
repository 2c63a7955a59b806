//! Lifecycle state of a fixture container.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one container instance.
///
/// ```text
/// Pending → Starting → Probing → Ready → Stopping → Removed
///              │          │                  ▲
///              └──────────┴──▶ Failed ───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Container created, not started.
    Pending,
    /// Start requested.
    Starting,
    /// Running, readiness probe in progress.
    Probing,
    /// Probe passed; the instance may be handed to a test.
    Ready,
    /// Teardown in progress.
    Stopping,
    /// Stopped and removed. Final.
    Removed,
    /// Start or probe failed.
    Failed,
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl LifecycleState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Probing)
                | (Starting, Failed)
                | (Probing, Ready)
                | (Probing, Failed)
                | (Ready, Stopping)
                | (Failed, Stopping)
                | (Stopping, Removed)
        )
    }

    /// Check and return the next state.
    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Removed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Removed => "removed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
