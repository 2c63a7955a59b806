//! Per-test fixture access.
//!
//! A [`FixtureHolder`] belongs to one test. The first `get` for a fixture
//! provisions a fresh container; later calls in the same test return the
//! same handle. Containers never cross holders, so parallel tests asking for
//! the same fixture each get their own instance and their own host ports.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;

use crate::environment::FixtureEnvironment;
use crate::error::{Result, TeardownFailure};
use crate::handle::FixtureHandle;
use crate::lifecycle::ContainerInstance;

struct Slot {
    instance: ContainerInstance,
    handle: FixtureHandle,
}

/// Outcome of [`FixtureHolder::release_all`].
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Fixtures whose containers were torn down.
    pub released: Vec<String>,
    /// Teardowns that did not complete cleanly.
    pub failures: Vec<TeardownFailure>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn log(&self) {
        for failure in &self.failures {
            tracing::warn!(
                fixture = %failure.fixture,
                container_id = %failure.container_id,
                "{}",
                failure
            );
        }
    }
}

/// Lazily provisioned fixtures of one test.
pub struct FixtureHolder {
    env: Arc<FixtureEnvironment>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl FixtureHolder {
    pub fn new(env: Arc<FixtureEnvironment>) -> Self {
        Self {
            env,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for `fixture`, provisioning it on first use.
    ///
    /// Waits until the container is ready. A failed provisioning leaves
    /// nothing behind, so the call can be retried.
    pub async fn get(&self, fixture: impl AsRef<str>) -> Result<FixtureHandle> {
        let name = fixture.as_ref();
        let descriptor = self.env.registry().lookup(name)?;

        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(name) {
            return Ok(slot.handle.clone());
        }

        let mut instance = self.env.controller().provision(descriptor).await?;
        let handle = match instance.handle() {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(failure) = self.env.controller().teardown(&mut instance).await {
                    tracing::warn!("{}", failure);
                }
                return Err(e);
            }
        };

        slots.insert(
            name.to_string(),
            Slot {
                instance,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// Number of live fixtures.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Tear down every fixture of this holder.
    ///
    /// Every container is attempted even if earlier ones fail; failures are
    /// collected in the report rather than returned as an error.
    pub async fn release_all(&self) -> ReleaseReport {
        let slots: Vec<(String, Slot)> = self.slots.lock().await.drain().collect();
        let mut report = ReleaseReport::default();

        for (name, mut slot) in slots {
            match self.env.controller().teardown(&mut slot.instance).await {
                Ok(()) => report.released.push(name),
                Err(failure) => report.failures.push(failure),
            }
        }

        tracing::debug!(
            released = report.released.len(),
            failed = report.failures.len(),
            "Released fixtures"
        );
        report
    }

    /// Run `body` with a fresh holder, then release it.
    ///
    /// The release runs whether `body` returns normally, returns an error or
    /// panics; a panic is resumed once the containers are gone. Teardown
    /// failures are logged and never replace the body's own result.
    pub async fn scope<T>(
        env: Arc<FixtureEnvironment>,
        body: impl AsyncFnOnce(&FixtureHolder) -> T,
    ) -> T {
        let holder = FixtureHolder::new(env);
        let outcome = AssertUnwindSafe(body(&holder)).catch_unwind().await;

        holder.release_all().await.log();

        match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Dropping a holder that still owns containers starts their teardown in
/// the background. [`FixtureHolder::release_all`] and
/// [`FixtureHolder::scope`] are the supported ways to release fixtures: a
/// background teardown only runs while the runtime keeps running, which on a
/// current-thread runtime (the `#[tokio::test]` default) ends with the test.
/// [`LifecycleController::finish_background_teardowns`] waits for it.
///
/// [`LifecycleController::finish_background_teardowns`]: crate::lifecycle::LifecycleController::finish_background_teardowns
impl Drop for FixtureHolder {
    fn drop(&mut self) {
        let slots: Vec<Slot> = self.slots.get_mut().drain().map(|(_, slot)| slot).collect();
        if slots.is_empty() {
            return;
        }

        if tokio::runtime::Handle::try_current().is_err() {
            for slot in &slots {
                tracing::warn!(
                    fixture = %slot.handle.fixture_name(),
                    container_id = %slot.instance.id(),
                    "FixtureHolder dropped outside a runtime, container may remain running"
                );
            }
            return;
        }

        tracing::warn!(
            fixtures = slots.len(),
            "FixtureHolder dropped without release_all(), tearing down in the background; \
             use scope() or release_all() so teardown completes before the runtime stops"
        );

        let env = Arc::clone(&self.env);
        self.env.controller().spawn_detached(async move {
            for mut slot in slots {
                if let Err(failure) = env.controller().teardown(&mut slot.instance).await {
                    tracing::warn!("{}", failure);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::FixtureSettings;
    use crate::error::FixtureError;
    use crate::fixture::{FixtureDescriptor, FixtureRegistry, ImageSource, ProbeKind};
    use crate::image::ImageCache;
    use crate::testing::{ContainerBehaviour, FakeEngine};

    fn env(engine: &Arc<FakeEngine>) -> Arc<FixtureEnvironment> {
        let mut registry = FixtureRegistry::new();
        registry
            .register(
                FixtureDescriptor::new(
                    "echo-server",
                    ImageSource::registry("example/echo"),
                    ProbeKind::Tcp { port: 7 },
                )
                .expose(7),
            )
            .unwrap();
        registry
            .register(
                FixtureDescriptor::new(
                    "sshd",
                    ImageSource::registry("example/sshd"),
                    ProbeKind::SshBanner { port: 22 },
                )
                .expose(22),
            )
            .unwrap();
        FixtureEnvironment::with_cache(
            engine.clone(),
            FixtureSettings {
                startup_timeout: Duration::from_millis(300),
                ..FixtureSettings::for_tests()
            },
            registry,
            Arc::new(ImageCache::new()),
        )
    }

    #[tokio::test]
    async fn test_get_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        let holder = env(&engine).holder();

        let first = holder.get("echo-server").await.unwrap();
        let second = holder.get("echo-server").await.unwrap();

        assert!(first.same_instance(&second));
        assert_eq!(engine.created(), 1);
        assert_eq!(holder.len().await, 1);
        holder.release_all().await;
    }

    #[tokio::test]
    async fn test_unknown_fixture() {
        let engine = Arc::new(FakeEngine::new());
        let holder = env(&engine).holder();

        let err = holder.get("postgres").await.unwrap_err();
        assert!(matches!(err, FixtureError::UnknownFixture(ref name) if name == "postgres"));
        assert_eq!(engine.created(), 0);
    }

    #[tokio::test]
    async fn test_release_all_removes_every_container() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("sshd", ContainerBehaviour::SshBanner);
        let holder = env(&engine).holder();
        holder.get("echo-server").await.unwrap();
        holder.get("sshd").await.unwrap();

        let report = holder.release_all().await;

        assert!(report.is_clean());
        assert_eq!(report.released.len(), 2);
        assert_eq!(engine.running(), 0);
        assert!(holder.is_empty().await);
    }

    #[tokio::test]
    async fn test_release_all_collects_failures() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("sshd", ContainerBehaviour::SshBanner);
        let holder = env(&engine).holder();
        holder.get("echo-server").await.unwrap();
        holder.get("sshd").await.unwrap();

        engine.set_failing_stop(true);
        engine.set_failing_removal(true);
        let report = holder.release_all().await;

        assert_eq!(report.failures.len(), 2);
        assert!(report.released.is_empty());
        assert!(holder.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_provisioning_can_be_retried() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("sshd", ContainerBehaviour::Unresponsive);
        let holder = env(&engine).holder();

        assert!(holder.get("sshd").await.unwrap_err().is_fixture_failure());
        assert!(holder.is_empty().await);

        engine.set_behaviour("sshd", ContainerBehaviour::SshBanner);
        holder.get("sshd").await.unwrap();
        assert_eq!(engine.created(), 2);
        holder.release_all().await;
    }

    #[tokio::test]
    async fn test_scope_releases_after_error() {
        let engine = Arc::new(FakeEngine::new());
        let env = env(&engine);

        let result: Result<()> = env
            .scope(async |fixtures| {
                fixtures.get("echo-server").await?;
                fixtures.get("postgres").await?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(FixtureError::UnknownFixture(_))));
        assert_eq!(engine.created(), 1);
        assert_eq!(engine.removed(), 1);
    }

    #[tokio::test]
    async fn test_scope_releases_after_panic() {
        let engine = Arc::new(FakeEngine::new());
        let env = env(&engine);

        let outcome = AssertUnwindSafe(env.scope(async |fixtures| {
            fixtures.get("echo-server").await.unwrap();
            if fixtures.len().await == 1 {
                panic!("assertion failed inside test body");
            }
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(engine.removed(), 1);
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_get_removes_container() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("sshd", ContainerBehaviour::Unresponsive);
        let env = env(&engine);
        let holder = env.holder();

        let outcome = tokio::time::timeout(Duration::from_millis(100), holder.get("sshd")).await;
        assert!(outcome.is_err());
        assert_eq!(engine.created(), 1);

        env.controller().finish_background_teardowns().await;
        assert_eq!(engine.removed(), 1);
        assert_eq!(engine.running(), 0);
        assert!(holder.is_empty().await);
    }

    #[tokio::test]
    async fn test_drop_on_current_thread_runtime() {
        let engine = Arc::new(FakeEngine::new());
        let env = env(&engine);
        let holder = env.holder();
        holder.get("echo-server").await.unwrap();

        drop(holder);
        env.controller().finish_background_teardowns().await;

        assert_eq!(engine.removed(), 1);
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_tears_down_in_background() {
        let engine = Arc::new(FakeEngine::new());
        let holder = env(&engine).holder();
        holder.get("echo-server").await.unwrap();

        drop(holder);

        for _ in 0..100 {
            if engine.removed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.removed(), 1);
    }
}
