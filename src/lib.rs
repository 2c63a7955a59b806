//! Ephemeral Docker fixtures for end-to-end test suites.
//!
//! A test asks a [`FixtureHolder`] for a fixture by name (an SSH build agent,
//! an Xvnc display host, an echo server, ...). The holder provisions a fresh
//! container through the [`LifecycleController`], which resolves the image,
//! starts the container, waits for its readiness probe and records the
//! dynamically allocated host ports. The test receives a read-only
//! [`FixtureHandle`] and every container is torn down when the holder is
//! released.
//!
//! # Example
//!
//! ```rust,no_run
//! use fixture_dock::{FixtureEnvironment, FixtureKind};
//!
//! # async fn example() -> Result<(), fixture_dock::FixtureError> {
//! let env = FixtureEnvironment::from_env().await?;
//!
//! env.scope(async |fixtures| {
//!     let sshd = fixtures.get(FixtureKind::Sshd).await?;
//!     let port = sshd.resolved_port(22).expect("sshd publishes port 22");
//!     println!("agent reachable at {}:{}", sshd.ip_address(), port);
//!     Ok::<_, fixture_dock::FixtureError>(())
//! })
//! .await
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fixture;
pub mod handle;
pub mod holder;
pub mod image;
pub mod lifecycle;
pub mod probe;
pub mod testing;

pub use config::{ConfigError, FixtureSettings};
pub use engine::{ContainerEngine, DockerEngine, EngineError};
pub use environment::FixtureEnvironment;
pub use error::{BuildFailure, FixtureError, ProvisionFailure, Result, TeardownFailure};
pub use fixture::{Credentials, FixtureDescriptor, FixtureKind, FixtureRegistry, ImageSource, ProbeKind};
pub use handle::FixtureHandle;
pub use holder::{FixtureHolder, ReleaseReport};
pub use image::{Image, ImageCache, ImageProvider};
pub use lifecycle::{ContainerInstance, LifecycleController, LifecycleState};
