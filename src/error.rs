//! Error types for fixture provisioning and teardown.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::lifecycle::LifecycleState;

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Number of captured log lines rendered in a provisioning error message.
const RENDERED_LOG_LINES: usize = 40;

/// The image definition of a fixture could not be built (or pulled).
///
/// Never retried: a failing build definition fails the same way again.
#[derive(Debug, Clone, Error)]
#[error("failed to build image '{image}' for fixture '{fixture}': {reason}")]
pub struct BuildFailure {
    /// Fixture whose image was requested.
    pub fixture: String,
    /// Image key (tag or registry reference).
    pub image: String,
    /// Reason for failure.
    pub reason: String,
}

/// A container failed to start or never became ready.
///
/// By the time this error is returned the container has already been torn
/// down; `logs` holds the tail of its output for diagnostics.
#[derive(Debug, Clone)]
pub struct ProvisionFailure {
    /// Fixture being provisioned.
    pub fixture: String,
    /// Image the container was created from.
    pub image: String,
    /// Container id, if the engine got as far as creating one.
    pub container_id: Option<String>,
    /// Reason for failure.
    pub reason: String,
    /// Captured container output (oldest first).
    pub logs: Vec<String>,
}

impl fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to provision fixture '{}' from image '{}'",
            self.fixture, self.image
        )?;
        if let Some(id) = &self.container_id {
            write!(f, " (container {})", short_id(id))?;
        }
        write!(f, ": {}", self.reason)?;

        if !self.logs.is_empty() {
            let skip = self.logs.len().saturating_sub(RENDERED_LOG_LINES);
            write!(f, "\n--- container output ---")?;
            for line in &self.logs[skip..] {
                write!(f, "\n{line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ProvisionFailure {}

/// Best-effort teardown of a container did not complete cleanly.
///
/// Collected and logged, never raised in place of a test's own outcome.
#[derive(Debug, Clone, Error)]
#[error("failed to tear down container {container_id} of fixture '{fixture}': {reason}")]
pub struct TeardownFailure {
    /// Fixture the container belonged to.
    pub fixture: String,
    /// Container id.
    pub container_id: String,
    /// Reason for failure.
    pub reason: String,
}

/// Errors surfaced to test code when asking for a fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// Image resolution failed.
    #[error(transparent)]
    Build(#[from] BuildFailure),

    /// Container start or readiness failed.
    #[error(transparent)]
    Provision(Box<ProvisionFailure>),

    /// No fixture registered under this name.
    #[error("unknown fixture '{0}'")]
    UnknownFixture(String),

    /// A fixture definition was rejected at registration time.
    #[error("invalid fixture definition '{name}': {reason}")]
    Registry {
        /// Fixture name.
        name: String,
        /// Reason for rejection.
        reason: String,
    },

    /// A handle was requested from an instance that is not ready.
    #[error("fixture '{fixture}' is not ready (state: {state})")]
    NotReady {
        /// Fixture name.
        fixture: String,
        /// Current lifecycle state.
        state: LifecycleState,
    },

    /// The container engine could not be reached.
    #[error("container engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ProvisionFailure> for FixtureError {
    fn from(failure: ProvisionFailure) -> Self {
        Self::Provision(Box::new(failure))
    }
}

impl FixtureError {
    /// True when the fixture itself failed (build or provisioning), as
    /// opposed to a misuse of the API.
    pub fn is_fixture_failure(&self) -> bool {
        matches!(self, Self::Build(_) | Self::Provision(_))
    }

    /// Container output captured when provisioning failed.
    pub fn captured_logs(&self) -> &[String] {
        match self {
            Self::Provision(failure) => &failure.logs,
            _ => &[],
        }
    }
}

/// Docker-style 12 character container id prefix for messages.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
