//! Catalog of fixture types known to the process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{ConfigError, FixtureSettings};
use crate::error::{FixtureError, Result};
use crate::fixture::descriptor::{FixtureDescriptor, ImageSource, ProbeKind};

/// Built-in fixture types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixtureKind {
    /// SSH build agent with a JRE, login `test`/`test`.
    Sshd,
    /// SSH build agent that can also run an Xvnc display server.
    XvncAgent,
    /// TCP echo service on port 7.
    EchoServer,
}

impl FixtureKind {
    pub const ALL: [FixtureKind; 3] = [Self::Sshd, Self::XvncAgent, Self::EchoServer];

    /// Registry name of this fixture.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sshd => "sshd",
            Self::XvncAgent => "xvnc-agent",
            Self::EchoServer => "echo-server",
        }
    }

    /// Descriptor with the build context located under `context_root`.
    pub fn descriptor(self, context_root: &Path) -> FixtureDescriptor {
        let image = ImageSource::build(context_root.join(self.name()));
        match self {
            Self::Sshd => {
                FixtureDescriptor::new(self.name(), image, ProbeKind::SshBanner { port: 22 })
                    .expose(22)
                    .credentials("test", "test")
            }
            Self::XvncAgent => {
                FixtureDescriptor::new(self.name(), image, ProbeKind::SshBanner { port: 22 })
                    .expose(22)
                    .credentials("test", "test")
                    .startup_timeout(Duration::from_secs(120))
            }
            Self::EchoServer => {
                FixtureDescriptor::new(self.name(), image, ProbeKind::Tcp { port: 7 }).expose(7)
            }
        }
    }
}

impl AsRef<str> for FixtureKind {
    fn as_ref(&self) -> &str {
        self.name()
    }
}

impl fmt::Display for FixtureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default, rename = "fixture")]
    fixtures: Vec<FixtureDescriptor>,
}

/// Fixture descriptors by name, fixed once registration is done.
#[derive(Debug, Default)]
pub struct FixtureRegistry {
    descriptors: BTreeMap<String, Arc<FixtureDescriptor>>,
}

impl FixtureRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every [`FixtureKind`].
    pub fn builtin(context_root: &Path) -> Self {
        let mut registry = Self::new();
        for kind in FixtureKind::ALL {
            registry
                .descriptors
                .insert(kind.name().to_string(), Arc::new(kind.descriptor(context_root)));
        }
        registry
    }

    /// Built-in fixtures plus the definitions file named in `settings`.
    pub fn from_settings(settings: &FixtureSettings) -> Result<Self> {
        let mut registry = Self::builtin(&settings.context_root);
        if let Some(path) = &settings.definitions {
            let added = registry.load_file(path)?;
            tracing::debug!(path = %path.display(), added, "Loaded fixture definitions");
        }
        Ok(registry)
    }

    /// Validate and add a descriptor. Names must be unique.
    pub fn register(&mut self, descriptor: FixtureDescriptor) -> Result<Arc<FixtureDescriptor>> {
        self.check(&descriptor)?;
        Ok(self.insert(descriptor))
    }

    /// Register every `[[fixture]]` table in `text`. Relative build contexts
    /// are resolved against `base_dir`.
    ///
    /// All or nothing: when any entry is rejected, none are registered.
    pub fn load_toml(&mut self, text: &str, base_dir: &Path) -> Result<usize> {
        let file: DefinitionsFile = toml::from_str(text).map_err(|e| {
            FixtureError::Config(ConfigError::Definitions {
                path: base_dir.to_path_buf(),
                message: e.to_string(),
            })
        })?;

        let mut accepted: Vec<FixtureDescriptor> = Vec::with_capacity(file.fixtures.len());
        for mut descriptor in file.fixtures {
            if let ImageSource::Build { context_dir, .. } = &mut descriptor.image
                && context_dir.is_relative()
            {
                *context_dir = base_dir.join(&*context_dir);
            }
            self.check(&descriptor)?;
            if accepted.iter().any(|d| d.name == descriptor.name) {
                return Err(duplicate(descriptor.name));
            }
            accepted.push(descriptor);
        }

        let count = accepted.len();
        for descriptor in accepted {
            self.insert(descriptor);
        }
        Ok(count)
    }

    /// Register the definitions in a TOML file.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FixtureError::Config(ConfigError::Definitions {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.load_toml(&text, &base_dir)
    }

    fn check(&self, descriptor: &FixtureDescriptor) -> Result<()> {
        descriptor
            .validate()
            .map_err(|reason| FixtureError::Registry {
                name: descriptor.name.clone(),
                reason,
            })?;
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(duplicate(descriptor.name.clone()));
        }
        Ok(())
    }

    fn insert(&mut self, descriptor: FixtureDescriptor) -> Arc<FixtureDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.descriptors
            .insert(descriptor.name.clone(), Arc::clone(&descriptor));
        descriptor
    }

    pub fn get(&self, name: &str) -> Option<Arc<FixtureDescriptor>> {
        self.descriptors.get(name).cloned()
    }

    /// Like [`get`](Self::get) but an unknown name is an error.
    pub fn lookup(&self, name: &str) -> Result<Arc<FixtureDescriptor>> {
        self.get(name)
            .ok_or_else(|| FixtureError::UnknownFixture(name.to_string()))
    }

    /// Registered descriptors in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FixtureDescriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn duplicate(name: String) -> FixtureError {
    FixtureError::Registry {
        name,
        reason: "a fixture with this name is already registered".to_string(),
    }
}
