//! Fixture descriptors and the registry of fixture types.

pub mod descriptor;
pub mod registry;

pub use descriptor::{Credentials, FixtureDescriptor, ImageSource, ProbeKind};
pub use registry::{FixtureKind, FixtureRegistry};
