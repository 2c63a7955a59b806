//! Container engine seam.
//!
//! [`ContainerEngine`] is the narrow set of operations the lifecycle needs
//! from a container engine. [`DockerEngine`] implements it against a local
//! Docker daemon; `crate::testing::FakeEngine` implements it in memory.

pub mod detect;
pub mod docker;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::{DockerEngine, connect_docker};

/// Label carrying the fixture name on every container we create.
pub const FIXTURE_LABEL: &str = "fixture-dock.fixture";

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors reported by a container engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine could not be reached at all.
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// The container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request had no effect (e.g. stopping a stopped container).
    #[error("not modified: {0}")]
    NotModified(String),

    /// An image build reported an error.
    #[error("build failed: {reason}")]
    Build { reason: String },

    /// Any other engine-side failure.
    #[error("{0}")]
    Api(String),
}

impl EngineError {
    /// The target is already gone or already in the requested state.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotModified(_))
    }
}

/// Everything needed to create a fixture container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image id or reference.
    pub image: String,
    /// Container ports to publish on dynamically allocated host ports.
    pub exposed_ports: BTreeSet<u16>,
    /// Host address the ports are published on.
    pub bind_host: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// A container port as published on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub host_ip: String,
    pub host_port: u16,
}

/// Engine-reported state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Published ports keyed by container port.
    pub ports: BTreeMap<u16, PublishedPort>,
}

/// Operations consumed from the container engine.
///
/// Implementations are shared between concurrently running fixture
/// lifecycles and must accept concurrent calls.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check the engine answers.
    async fn ping(&self) -> EngineResult<()>;

    /// Id of a local image, `None` if the engine does not have it.
    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>>;

    /// Pull an image and return its id.
    async fn pull_image(&self, reference: &str) -> EngineResult<String>;

    /// Build `context` with `dockerfile`, tag it `tag` and return the image id.
    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str)
    -> EngineResult<String>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerStatus>;

    /// Container output lines (stdout and stderr), at most `tail` of the
    /// most recent ones when given.
    async fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<Vec<String>>;

    /// Stop a container, killing it after `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()>;

    /// Remove a container (forcibly, with its anonymous volumes).
    async fn remove_container(&self, id: &str) -> EngineResult<()>;
}
