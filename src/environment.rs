//! Wiring of engine, registry, settings and controller.

use std::sync::Arc;

use crate::config::FixtureSettings;
use crate::engine::{ContainerEngine, DockerEngine};
use crate::error::Result;
use crate::fixture::FixtureRegistry;
use crate::holder::FixtureHolder;
use crate::image::ImageCache;
use crate::lifecycle::LifecycleController;

/// Everything a test needs to provision fixtures.
///
/// Cheap to share: holders keep an `Arc` to the environment they came from.
pub struct FixtureEnvironment {
    registry: Arc<FixtureRegistry>,
    controller: LifecycleController,
}

impl FixtureEnvironment {
    /// Environment using the process-wide image cache.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        settings: FixtureSettings,
        registry: FixtureRegistry,
    ) -> Arc<Self> {
        Self::with_cache(engine, settings, registry, ImageCache::global())
    }

    /// Environment with its own image cache.
    pub fn with_cache(
        engine: Arc<dyn ContainerEngine>,
        settings: FixtureSettings,
        registry: FixtureRegistry,
        cache: Arc<ImageCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(registry),
            controller: LifecycleController::new(engine, cache, settings),
        })
    }

    /// Connect to the local Docker daemon and load settings and fixture
    /// definitions from the environment.
    ///
    /// The Docker connection belongs to the calling runtime, so call this
    /// from each test rather than sharing the result across runtimes.
    pub async fn from_env() -> Result<Arc<Self>> {
        let settings = FixtureSettings::from_env()?;
        let registry = FixtureRegistry::from_settings(&settings)?;
        let engine = DockerEngine::connect().await?;

        tracing::debug!(
            fixtures = registry.len(),
            context_root = %settings.context_root.display(),
            "Fixture environment ready"
        );
        Ok(Self::new(Arc::new(engine), settings, registry))
    }

    /// A fresh holder for one test.
    pub fn holder(self: &Arc<Self>) -> FixtureHolder {
        FixtureHolder::new(Arc::clone(self))
    }

    /// Run `body` with a fresh holder and release it afterwards.
    ///
    /// See [`FixtureHolder::scope`].
    pub async fn scope<T>(self: &Arc<Self>, body: impl AsyncFnOnce(&FixtureHolder) -> T) -> T {
        FixtureHolder::scope(Arc::clone(self), body).await
    }

    pub fn registry(&self) -> &FixtureRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn settings(&self) -> &FixtureSettings {
        self.controller.settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FixtureKind;
    use crate::testing::FakeEngine;

    #[test]
    fn test_new_uses_global_cache() {
        let env = FixtureEnvironment::new(
            Arc::new(FakeEngine::new()),
            FixtureSettings::for_tests(),
            FixtureRegistry::new(),
        );
        assert!(Arc::ptr_eq(env.controller().images().cache(), &ImageCache::global()));
    }

    #[test]
    fn test_registry_is_shared() {
        let settings = FixtureSettings::for_tests();
        let registry = FixtureRegistry::builtin(&settings.context_root);
        let env = FixtureEnvironment::with_cache(
            Arc::new(FakeEngine::new()),
            settings,
            registry,
            Arc::new(ImageCache::new()),
        );

        assert!(env.registry().get(FixtureKind::Sshd.name()).is_some());
        assert_eq!(env.settings().probe_interval.as_millis(), 20);
    }
}
