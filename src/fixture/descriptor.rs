//! Static metadata describing a fixture type.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the image for a fixture comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// A published image, pulled when not present locally.
    Registry {
        /// Image reference, e.g. `redis:7-alpine`.
        reference: String,
    },
    /// An image built from a local Docker build context.
    Build {
        /// Directory sent to the engine as the build context.
        context_dir: PathBuf,
        /// Dockerfile path relative to the context.
        #[serde(default = "default_dockerfile")]
        dockerfile: String,
    },
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

impl ImageSource {
    /// Build source using the context's `Dockerfile`.
    pub fn build(context_dir: impl Into<PathBuf>) -> Self {
        Self::Build {
            context_dir: context_dir.into(),
            dockerfile: default_dockerfile(),
        }
    }

    /// Registry source.
    pub fn registry(reference: impl Into<String>) -> Self {
        Self::Registry {
            reference: reference.into(),
        }
    }
}

/// How to decide that a freshly started container is usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeKind {
    /// A TCP connect to the published port succeeds.
    Tcp { port: u16 },
    /// The published port answers with an SSH protocol banner.
    SshBanner { port: u16 },
    /// The container output contains `pattern`.
    LogLine { pattern: String },
    /// An HTTP GET on the published port returns a 2xx status.
    Http {
        port: u16,
        #[serde(default = "default_http_path")]
        path: String,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

impl ProbeKind {
    /// Container port the probe connects to, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port } | Self::SshBanner { port } | Self::Http { port, .. } => Some(*port),
            Self::LogLine { .. } => None,
        }
    }
}

/// Login credentials baked into a fixture image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Immutable description of a fixture type: what to run and how to tell
/// it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDescriptor {
    /// Unique fixture name, used as the holder key and in container names.
    pub name: String,
    /// Image source.
    pub image: ImageSource,
    /// Container ports published to dynamically allocated host ports.
    pub exposed_ports: BTreeSet<u16>,
    /// Readiness probe.
    pub probe: ProbeKind,
    /// Environment variables passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Credentials for logging into the fixture, if it has any.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Overrides the global startup timeout. Written as (fractional)
    /// seconds in definition files.
    #[serde(default, rename = "startup_timeout_secs", with = "optional_secs")]
    pub startup_timeout: Option<Duration>,
}

impl FixtureDescriptor {
    /// Create a descriptor with no exposed ports yet.
    pub fn new(name: impl Into<String>, image: ImageSource, probe: ProbeKind) -> Self {
        Self {
            name: name.into(),
            image,
            exposed_ports: BTreeSet::new(),
            probe,
            env: BTreeMap::new(),
            credentials: None,
            startup_timeout: None,
        }
    }

    /// Publish a container port.
    pub fn expose(mut self, port: u16) -> Self {
        self.exposed_ports.insert(port);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Per-fixture startup timeout, if overridden.
    pub fn startup_timeout_override(&self) -> Option<Duration> {
        self.startup_timeout
    }

    /// Check the descriptor is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        {
            return Err(
                "name may only contain lowercase letters, digits, '-', '_' and '.'".to_string(),
            );
        }
        if self.startup_timeout.is_some_and(|t| t.is_zero()) {
            return Err("startup timeout must be greater than zero".to_string());
        }
        if self.exposed_ports.contains(&0) {
            return Err("port 0 cannot be exposed".to_string());
        }

        match &self.image {
            ImageSource::Registry { reference } if reference.trim().is_empty() => {
                return Err("registry reference must not be empty".to_string());
            }
            ImageSource::Build { dockerfile, .. } if dockerfile.trim().is_empty() => {
                return Err("dockerfile must not be empty".to_string());
            }
            _ => {}
        }

        match &self.probe {
            ProbeKind::LogLine { pattern } if pattern.is_empty() => {
                Err("log probe pattern must not be empty".to_string())
            }
            probe => match probe.port() {
                Some(port) if !self.exposed_ports.contains(&port) => Err(format!(
                    "probe port {port} is not among the exposed ports"
                )),
                _ => Ok(()),
            },
        }
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs_f64()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}
