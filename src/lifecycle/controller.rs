//! Provisioning and teardown of fixture containers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::FixtureSettings;
use crate::engine::{ContainerEngine, ContainerSpec, FIXTURE_LABEL};
use crate::error::{ProvisionFailure, Result, TeardownFailure, short_id};
use crate::fixture::FixtureDescriptor;
use crate::image::{ImageCache, ImageProvider};
use crate::lifecycle::{ContainerInstance, LifecycleState};
use crate::probe::ProbeTarget;

/// Starts fixture containers, waits for them to become ready and tears them
/// down again.
///
/// Shared by every holder of an environment. Each call works on its own
/// container, so concurrent provisioning only meets at the image cache.
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
    images: ImageProvider,
    settings: FixtureSettings,
    detached: Mutex<JoinSet<()>>,
}

impl LifecycleController {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        cache: Arc<ImageCache>,
        settings: FixtureSettings,
    ) -> Self {
        Self {
            images: ImageProvider::new(Arc::clone(&engine), cache),
            engine,
            settings,
            detached: Mutex::new(JoinSet::new()),
        }
    }

    pub fn images(&self) -> &ImageProvider {
        &self.images
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn settings(&self) -> &FixtureSettings {
        &self.settings
    }

    /// Run `task` on the current runtime without a caller waiting for it.
    ///
    /// Returns `false` when there is no runtime to run it on.
    pub(crate) fn spawn_detached(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let mut tasks = self.detached.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, &runtime);
        true
    }

    /// Wait for teardowns started in the background by cancelled
    /// provisioning or dropped holders.
    pub async fn finish_background_teardowns(&self) {
        let mut tasks = {
            let mut pending = self.detached.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Background teardown did not finish: {}", e);
            }
        }
    }

    /// Start a fresh container for `descriptor` and wait until its readiness
    /// probe passes.
    ///
    /// On any failure after the container was created, the container output
    /// is captured and the container is torn down before the error is
    /// returned. Dropping the returned future before it completes removes
    /// the container in the background.
    pub async fn provision(&self, descriptor: Arc<FixtureDescriptor>) -> Result<ContainerInstance> {
        let image = self.images.resolve(&descriptor).await?;
        let name = container_name(&descriptor.name);

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.id.clone(),
            exposed_ports: descriptor.exposed_ports.clone(),
            bind_host: self.settings.bind_host.clone(),
            env: descriptor.env.clone(),
            labels: BTreeMap::from([(FIXTURE_LABEL.to_string(), descriptor.name.clone())]),
        };

        let id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|e| ProvisionFailure {
                fixture: descriptor.name.clone(),
                image: image.key.clone(),
                container_id: None,
                reason: format!("failed to create container: {e}"),
                logs: Vec::new(),
            })?;

        tracing::debug!(
            fixture = %descriptor.name,
            container_id = %short_id(&id),
            image = %image.key,
            "Created container {}",
            name
        );

        let mut guard = RemoveOnDrop {
            controller: self,
            fixture: descriptor.name.clone(),
            container_id: (!self.settings.keep_containers).then(|| id.clone()),
        };
        let mut instance = ContainerInstance::new(
            id,
            name,
            image.key,
            descriptor,
            self.settings.bind_host.clone(),
        );

        if let Err(reason) = self.start(&mut instance).await {
            let failure = self.abort(instance, reason).await;
            guard.disarm();
            return Err(failure.into());
        }
        guard.disarm();

        tracing::info!(
            fixture = %instance.descriptor().name,
            container_id = %short_id(instance.id()),
            ports = ?instance.host_bindings(),
            "Fixture ready at {}",
            instance.host_ip()
        );
        Ok(instance)
    }

    async fn start(&self, instance: &mut ContainerInstance) -> std::result::Result<(), String> {
        instance
            .transition(LifecycleState::Starting)
            .map_err(|e| e.to_string())?;
        self.engine
            .start_container(instance.id())
            .await
            .map_err(|e| format!("failed to start container: {e}"))?;

        instance
            .transition(LifecycleState::Probing)
            .map_err(|e| e.to_string())?;
        self.await_ready(instance).await?;

        instance
            .transition(LifecycleState::Ready)
            .map_err(|e| e.to_string())
    }

    /// Poll until the probe passes, the container exits or the startup
    /// timeout runs out.
    async fn await_ready(&self, instance: &mut ContainerInstance) -> std::result::Result<(), String> {
        let timeout = instance
            .descriptor()
            .startup_timeout_override()
            .unwrap_or(self.settings.startup_timeout);
        let deadline = Instant::now() + timeout;
        let probe = instance.descriptor().probe.probe();
        let mut last_failure = String::from("no probe attempt completed");

        loop {
            let status = self
                .engine
                .inspect_container(instance.id())
                .await
                .map_err(|e| format!("failed to inspect container: {e}"))?;

            if !status.running {
                return Err(match status.exit_code {
                    Some(code) => format!("container exited with code {code} before becoming ready"),
                    None => "container stopped before becoming ready".to_string(),
                });
            }

            let missing = instance.record_bindings(&status, &self.settings.bind_host);
            if missing.is_empty() {
                let target = ProbeTarget {
                    container_id: instance.id(),
                    host: instance.host_ip(),
                    bindings: instance.host_bindings(),
                    engine: self.engine.as_ref(),
                };
                match probe.check(&target).await {
                    Ok(()) => return Ok(()),
                    Err(reason) => {
                        tracing::trace!(
                            fixture = %instance.descriptor().name,
                            container_id = %short_id(instance.id()),
                            "Not ready yet: {}",
                            reason
                        );
                        last_failure = reason;
                    }
                }
            } else {
                last_failure = format!("ports {missing:?} not published yet");
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "{} did not pass within {}s: {}",
                    probe.describe(),
                    timeout.as_secs_f64(),
                    last_failure
                ));
            }
            tokio::time::sleep(self.settings.probe_interval.min(deadline - now)).await;
        }
    }

    /// Mark the instance failed, capture its output and tear it down.
    async fn abort(&self, mut instance: ContainerInstance, reason: String) -> ProvisionFailure {
        if let Err(e) = instance.transition(LifecycleState::Failed) {
            tracing::debug!(container_id = %short_id(instance.id()), "{}", e);
        }

        let logs = match self
            .engine
            .logs(instance.id(), Some(self.settings.log_tail_lines))
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!(
                    container_id = %short_id(instance.id()),
                    "Could not capture container output: {}",
                    e
                );
                Vec::new()
            }
        };

        tracing::warn!(
            fixture = %instance.descriptor().name,
            container_id = %short_id(instance.id()),
            image = %instance.image(),
            "Provisioning failed: {}",
            reason
        );

        if let Err(e) = self.teardown(&mut instance).await {
            tracing::warn!("{}", e);
        }

        ProvisionFailure {
            fixture: instance.descriptor().name.clone(),
            image: instance.image().to_string(),
            container_id: Some(instance.id().to_string()),
            reason,
            logs,
        }
    }

    /// Stop and remove the instance's container.
    ///
    /// Idempotent. The instance ends up `Removed` whatever the engine says;
    /// containers that are already stopped or gone are not an error.
    pub async fn teardown(
        &self,
        instance: &mut ContainerInstance,
    ) -> std::result::Result<(), TeardownFailure> {
        if instance.state() == LifecycleState::Removed {
            return Ok(());
        }
        if let Err(e) = instance.transition(LifecycleState::Stopping) {
            tracing::debug!(container_id = %short_id(instance.id()), "{}", e);
        }

        if self.settings.keep_containers {
            tracing::info!(
                fixture = %instance.descriptor().name,
                container_id = %short_id(instance.id()),
                "Keeping container {} (FIXTURE_KEEP_CONTAINERS)",
                instance.name()
            );
            instance.mark_removed();
            return Ok(());
        }

        let mut problems = Vec::new();

        match self
            .engine
            .stop_container(instance.id(), self.settings.stop_timeout)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_gone() => {}
            Err(e) => problems.push(format!("stop: {e}")),
        }

        match self.engine.remove_container(instance.id()).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => {}
            Err(e) => problems.push(format!("remove: {e}")),
        }

        instance.mark_removed();

        if problems.is_empty() {
            tracing::debug!(
                fixture = %instance.descriptor().name,
                container_id = %short_id(instance.id()),
                "Removed container {}",
                instance.name()
            );
            Ok(())
        } else {
            Err(TeardownFailure {
                fixture: instance.descriptor().name.clone(),
                container_id: instance.id().to_string(),
                reason: problems.join("; "),
            })
        }
    }
}

/// Removes a created container when provisioning does not run to the end,
/// e.g. because the caller dropped the `provision` future.
struct RemoveOnDrop<'a> {
    controller: &'a LifecycleController,
    fixture: String,
    container_id: Option<String>,
}

impl RemoveOnDrop<'_> {
    fn disarm(&mut self) {
        self.container_id = None;
    }
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        let Some(id) = self.container_id.take() else {
            return;
        };
        let fixture = std::mem::take(&mut self.fixture);

        tracing::warn!(
            fixture = %fixture,
            container_id = %short_id(&id),
            "Provisioning cancelled, removing container in the background"
        );

        let engine = Arc::clone(&self.controller.engine);
        let stop_timeout = self.controller.settings.stop_timeout;
        let spawned = self.controller.spawn_detached(async move {
            if let Err(e) = engine.stop_container(&id, stop_timeout).await
                && !e.is_gone()
            {
                tracing::warn!(fixture = %fixture, container_id = %short_id(&id), "stop: {}", e);
            }
            if let Err(e) = engine.remove_container(&id).await
                && !e.is_gone()
            {
                tracing::warn!(fixture = %fixture, container_id = %short_id(&id), "remove: {}", e);
            }
        });
        if !spawned {
            tracing::warn!("No runtime available, container may remain running");
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        // Let pending teardowns finish instead of aborting them with the set.
        self.detached
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .detach_all();
    }
}

/// `fixture-dock-<fixture>-<8 hex chars>`.
fn container_name(fixture: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("fixture-dock-{}-{}", fixture, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::error::FixtureError;
    use crate::fixture::{ImageSource, ProbeKind};
    use crate::testing::{ContainerBehaviour, FakeEngine};

    fn echo() -> Arc<FixtureDescriptor> {
        Arc::new(
            FixtureDescriptor::new(
                "echo-server",
                ImageSource::registry("example/echo"),
                ProbeKind::Tcp { port: 7 },
            )
            .expose(7),
        )
    }

    fn sshd() -> Arc<FixtureDescriptor> {
        Arc::new(
            FixtureDescriptor::new(
                "sshd",
                ImageSource::registry("example/sshd"),
                ProbeKind::SshBanner { port: 22 },
            )
            .expose(22)
            .credentials("test", "test"),
        )
    }

    fn controller(engine: &Arc<FakeEngine>) -> LifecycleController {
        controller_with(engine, FixtureSettings::for_tests())
    }

    fn controller_with(engine: &Arc<FakeEngine>, settings: FixtureSettings) -> LifecycleController {
        let engine: Arc<dyn ContainerEngine> = engine.clone();
        LifecycleController::new(engine, Arc::new(ImageCache::new()), settings)
    }

    fn short_startup() -> FixtureSettings {
        FixtureSettings {
            startup_timeout: Duration::from_millis(300),
            ..FixtureSettings::for_tests()
        }
    }

    #[test]
    fn test_container_name() {
        let name = container_name("sshd");
        assert!(name.starts_with("fixture-dock-sshd-"));
        assert_eq!(name.len(), "fixture-dock-sshd-".len() + 8);
        assert_ne!(name, container_name("sshd"));
    }

    #[tokio::test]
    async fn test_echo_server_accepts_connections_when_ready() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);

        let instance = controller.provision(echo()).await.unwrap();
        assert_eq!(instance.state(), LifecycleState::Ready);

        let handle = instance.handle().unwrap();
        let addr = handle.socket_addr(7).unwrap();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_container_is_labelled_and_named() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);

        let instance = controller.provision(echo()).await.unwrap();
        assert!(instance.name().starts_with("fixture-dock-echo-server-"));
        assert_eq!(
            engine.label(instance.id(), FIXTURE_LABEL).as_deref(),
            Some("echo-server")
        );
    }

    #[tokio::test]
    async fn test_sequential_provisions_get_distinct_containers() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);

        let first = controller.provision(echo()).await.unwrap();
        let second = controller.provision(echo()).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_ne!(first.host_bindings().get(&7), second.host_bindings().get(&7));
        assert_eq!(engine.pulls(), 1);
    }

    #[tokio::test]
    async fn test_ssh_banner_probe_waits_for_banner() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour(
            "sshd",
            ContainerBehaviour::SlowSshBanner {
                silent_connections: 3,
            },
        );
        let controller = controller(&engine);

        let instance = controller.provision(sshd()).await.unwrap();
        let handle = instance.handle().unwrap();
        assert_eq!(handle.credentials().map(|c| c.username.as_str()), Some("test"));
        assert!(engine.connections(instance.id()) > 3);
    }

    #[tokio::test]
    async fn test_probe_timeout_tears_down_and_reports_logs() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("sshd", ContainerBehaviour::Unresponsive);
        let controller = controller_with(&engine, short_startup());

        let err = controller.provision(sshd()).await.unwrap_err();
        let FixtureError::Provision(failure) = &err else {
            panic!("expected provision failure, got {err:?}");
        };

        assert_eq!(failure.fixture, "sshd");
        assert!(failure.reason.contains("ssh banner probe"));
        assert!(!failure.logs.is_empty());
        let id = failure.container_id.as_deref().unwrap();
        assert!(!engine.exists(id));
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test]
    async fn test_container_exit_fails_immediately() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("echo-server", ContainerBehaviour::Exit(3));
        let controller = controller(&engine);

        let started = std::time::Instant::now();
        let err = controller.provision(echo()).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("exited with code 3"));
        assert!(err.captured_logs().iter().any(|l| l.contains("fatal")));
        assert_eq!(engine.removed(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_creates_no_container() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine:3.20\n").unwrap();
        let engine = Arc::new(FakeEngine::new());
        engine.set_failing_builds(true);
        let controller = controller(&engine);

        let descriptor = Arc::new(
            FixtureDescriptor::new(
                "echo-server",
                ImageSource::build(dir.path()),
                ProbeKind::Tcp { port: 7 },
            )
            .expose(7),
        );
        let err = controller.provision(descriptor).await.unwrap_err();

        assert!(matches!(err, FixtureError::Build(_)));
        assert_eq!(engine.created(), 0);
    }

    #[tokio::test]
    async fn test_teardown_twice() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);
        let mut instance = controller.provision(echo()).await.unwrap();

        controller.teardown(&mut instance).await.unwrap();
        assert_eq!(instance.state(), LifecycleState::Removed);
        controller.teardown(&mut instance).await.unwrap();
        assert_eq!(instance.state(), LifecycleState::Removed);
        assert_eq!(engine.removed(), 1);
        assert!(instance.handle().is_err());
    }

    #[tokio::test]
    async fn test_teardown_of_vanished_container() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);
        let mut instance = controller.provision(echo()).await.unwrap();

        engine.remove_out_of_band(instance.id());

        controller.teardown(&mut instance).await.unwrap();
        assert_eq!(instance.state(), LifecycleState::Removed);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported_not_raised() {
        let engine = Arc::new(FakeEngine::new());
        let controller = controller(&engine);
        let mut instance = controller.provision(echo()).await.unwrap();

        engine.set_failing_removal(true);
        let failure = controller.teardown(&mut instance).await.unwrap_err();

        assert_eq!(failure.container_id, instance.id());
        assert!(failure.reason.starts_with("remove:"));
        assert_eq!(instance.state(), LifecycleState::Removed);
    }

    #[tokio::test]
    async fn test_keep_containers() {
        let engine = Arc::new(FakeEngine::new());
        let settings = FixtureSettings {
            keep_containers: true,
            ..FixtureSettings::for_tests()
        };
        let controller = controller_with(&engine, settings);
        let mut instance = controller.provision(echo()).await.unwrap();

        controller.teardown(&mut instance).await.unwrap();

        assert_eq!(instance.state(), LifecycleState::Removed);
        assert!(engine.exists(instance.id()));
        assert_eq!(engine.running(), 1);
    }

    #[tokio::test]
    async fn test_descriptor_timeout_override() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_behaviour("echo-server", ContainerBehaviour::Unresponsive);
        let controller = controller(&engine);

        let descriptor = Arc::new(
            FixtureDescriptor::new(
                "echo-server",
                ImageSource::registry("example/echo"),
                ProbeKind::Tcp { port: 7 },
            )
            .expose(7)
            .startup_timeout(Duration::from_secs(1)),
        );

        let started = std::time::Instant::now();
        let err = controller.provision(descriptor).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(err.to_string().contains("within 1s"));
    }
}
