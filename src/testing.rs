//! In-memory container engine for tests.
//!
//! Provides:
//! - [`FakeEngine`]: a [`ContainerEngine`] that keeps containers in memory and
//!   binds real loopback listeners for their published ports
//! - [`ContainerBehaviour`]: how the fake container of a fixture answers
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fixture_dock::{FixtureEnvironment, FixtureRegistry, FixtureSettings};
//! use fixture_dock::testing::{ContainerBehaviour, FakeEngine};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let engine = Arc::new(FakeEngine::new());
//!     engine.set_behaviour("sshd", ContainerBehaviour::SshBanner);
//!     let env = FixtureEnvironment::new(engine, FixtureSettings::for_tests(), FixtureRegistry::new());
//!     // env.holder(), env.scope(...)
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult, FIXTURE_LABEL,
    PublishedPort,
};

const FAKE_BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6 fixture-dock-fake\r\n";

/// How a fake container behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerBehaviour {
    /// Echo back whatever is written to any published port.
    #[default]
    Echo,
    /// Send an SSH identification line on every connection.
    SshBanner,
    /// Close the first `silent_connections` connections without a banner,
    /// then behave like [`ContainerBehaviour::SshBanner`].
    SlowSshBanner { silent_connections: usize },
    /// Publish ports but never listen on them.
    Unresponsive,
    /// Exit right after start with this code.
    Exit(i64),
}

impl ContainerBehaviour {
    fn startup_logs(self, ports: &BTreeSet<u16>) -> Vec<String> {
        match self {
            Self::Echo => ports
                .iter()
                .map(|port| format!("echo: listening on port {port}"))
                .collect(),
            Self::SshBanner | Self::SlowSshBanner { .. } => ports
                .iter()
                .map(|port| format!("Server listening on 0.0.0.0 port {port}."))
                .collect(),
            Self::Unresponsive => vec!["waiting for configuration...".to_string()],
            Self::Exit(code) => vec![
                "fatal: no host keys available".to_string(),
                format!("exiting with code {code}"),
            ],
        }
    }
}

struct FakeContainer {
    labels: BTreeMap<String, String>,
    exposed: BTreeSet<u16>,
    bind_host: String,
    running: bool,
    exit_code: Option<i64>,
    ports: BTreeMap<u16, u16>,
    logs: Vec<String>,
    connections: Arc<AtomicUsize>,
    listeners: Vec<JoinHandle<()>>,
}

impl FakeContainer {
    fn halt(&mut self) {
        for task in self.listeners.drain(..) {
            task.abort();
        }
        self.running = false;
    }
}

#[derive(Default)]
struct FakeState {
    images: HashMap<String, String>,
    containers: HashMap<String, FakeContainer>,
    names: BTreeSet<String>,
    behaviours: HashMap<String, ContainerBehaviour>,
}

/// An in-memory container engine.
///
/// Containers are plain records. Starting one binds a loopback listener per
/// exposed port, so probes and tests talk to real sockets. Every engine call
/// is counted and failures can be switched on at runtime.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    build_delay: Mutex<Duration>,
    builds: AtomicUsize,
    pulls: AtomicUsize,
    created: AtomicUsize,
    removed: AtomicUsize,
    unavailable: AtomicBool,
    failing_builds: AtomicBool,
    failing_stop: AtomicBool,
    failing_removal: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Behaviour of containers labelled with `fixture`.
    pub fn set_behaviour(&self, fixture: &str, behaviour: ContainerBehaviour) {
        self.state().behaviours.insert(fixture.to_string(), behaviour);
    }

    /// Make an image known as if it had been built or pulled earlier.
    pub fn add_image(&self, reference: &str) -> String {
        let id = fake_image_id();
        self.state().images.insert(reference.to_string(), id.clone());
        id
    }

    /// Insert an already running container that printed `logs`.
    pub fn insert_running_container(&self, logs: &[&str]) -> String {
        let id = fake_container_id();
        self.state().containers.insert(
            id.clone(),
            FakeContainer {
                labels: BTreeMap::new(),
                exposed: BTreeSet::new(),
                bind_host: "127.0.0.1".to_string(),
                running: true,
                exit_code: None,
                ports: BTreeMap::new(),
                logs: logs.iter().map(|l| l.to_string()).collect(),
                connections: Arc::new(AtomicUsize::new(0)),
                listeners: Vec::new(),
            },
        );
        id
    }

    /// Delay every image build, to widen race windows.
    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_failing_builds(&self, fail: bool) {
        self.failing_builds.store(fail, Ordering::SeqCst);
    }

    pub fn set_failing_stop(&self, fail: bool) {
        self.failing_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_failing_removal(&self, fail: bool) {
        self.failing_removal.store(fail, Ordering::SeqCst);
    }

    /// Delete a container behind the controller's back.
    pub fn remove_out_of_band(&self, id: &str) {
        if let Some(mut container) = self.state().containers.remove(id) {
            container.halt();
        }
    }

    /// Number of image builds attempted.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of image pulls.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Number of containers created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of containers removed through the engine API.
    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Number of containers currently running.
    pub fn running(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    /// Label value of a container.
    pub fn label(&self, id: &str, key: &str) -> Option<String> {
        self.state().containers.get(id)?.labels.get(key).cloned()
    }

    /// Connections accepted on any of the container's ports.
    pub fn connections(&self, id: &str) -> usize {
        self.state()
            .containers
            .get(id)
            .map(|c| c.connections.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable {
                reason: "fake engine switched off".to_string(),
            });
        }
        Ok(())
    }
}

fn fake_image_id() -> String {
    format!("sha256:{}", Uuid::new_v4().simple())
}

fn fake_container_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

async fn serve(listener: TcpListener, behaviour: ContainerBehaviour, connections: Arc<AtomicUsize>) {
    while let Ok((mut socket, _)) = listener.accept().await {
        let seen = connections.fetch_add(1, Ordering::SeqCst);
        match behaviour {
            ContainerBehaviour::Echo => {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
            ContainerBehaviour::SshBanner => {
                let _ = socket.write_all(FAKE_BANNER).await;
            }
            ContainerBehaviour::SlowSshBanner { silent_connections } => {
                if seen >= silent_connections {
                    let _ = socket.write_all(FAKE_BANNER).await;
                }
            }
            ContainerBehaviour::Unresponsive | ContainerBehaviour::Exit(_) => {}
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.check_available()
    }

    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>> {
        self.check_available()?;
        Ok(self.state().images.get(reference).cloned())
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<String> {
        self.check_available()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let id = fake_image_id();
        self.state().images.insert(reference.to_string(), id.clone());
        Ok(id)
    }

    async fn build_image(&self, context: &Path, dockerfile: &str, tag: &str) -> EngineResult<String> {
        self.check_available()?;
        self.builds.fetch_add(1, Ordering::SeqCst);

        let delay = *self.build_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing_builds.load(Ordering::SeqCst) {
            return Err(EngineError::Build {
                reason: "The command '/bin/sh -c exit 1' returned a non-zero code: 1".to_string(),
            });
        }
        if !context.join(dockerfile).is_file() {
            return Err(EngineError::Build {
                reason: format!("Cannot locate specified Dockerfile: {dockerfile}"),
            });
        }

        let id = fake_image_id();
        self.state().images.insert(tag.to_string(), id.clone());
        Ok(id)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.check_available()?;
        let mut state = self.state();
        if !state.names.insert(spec.name.clone()) {
            return Err(EngineError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let id = fake_container_id();
        state.containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                exposed: spec.exposed_ports.clone(),
                bind_host: spec.bind_host.clone(),
                running: false,
                exit_code: None,
                ports: BTreeMap::new(),
                logs: Vec::new(),
                connections: Arc::new(AtomicUsize::new(0)),
                listeners: Vec::new(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.check_available()?;
        let (behaviour, exposed, connections) = {
            let state = self.state();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
            if container.running {
                return Err(EngineError::NotModified(format!("container {id} already started")));
            }
            let behaviour = container
                .labels
                .get(FIXTURE_LABEL)
                .and_then(|fixture| state.behaviours.get(fixture))
                .copied()
                .unwrap_or_default();
            (behaviour, container.exposed.clone(), Arc::clone(&container.connections))
        };

        let mut ports = BTreeMap::new();
        let mut listeners = Vec::new();
        if !matches!(behaviour, ContainerBehaviour::Exit(_)) {
            for port in &exposed {
                let listener = TcpListener::bind("127.0.0.1:0")
                    .await
                    .map_err(|e| EngineError::Api(format!("bind for port {port}: {e}")))?;
                let host_port = listener
                    .local_addr()
                    .map_err(|e| EngineError::Api(e.to_string()))?
                    .port();
                ports.insert(*port, host_port);

                // Unresponsive containers keep the allocation but drop the socket.
                if behaviour != ContainerBehaviour::Unresponsive {
                    listeners.push(tokio::spawn(serve(
                        listener,
                        behaviour,
                        Arc::clone(&connections),
                    )));
                }
            }
        }

        let mut state = self.state();
        let Some(container) = state.containers.get_mut(id) else {
            for task in listeners {
                task.abort();
            }
            return Err(EngineError::NotFound(format!("No such container: {id}")));
        };
        container.logs.extend(behaviour.startup_logs(&exposed));
        container.ports = ports;
        container.listeners = listeners;
        match behaviour {
            ContainerBehaviour::Exit(code) => {
                container.running = false;
                container.exit_code = Some(code);
            }
            _ => container.running = true,
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerStatus> {
        self.check_available()?;
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        Ok(ContainerStatus {
            running: container.running,
            exit_code: container.exit_code,
            ports: container
                .ports
                .iter()
                .map(|(port, host_port)| {
                    (
                        *port,
                        PublishedPort {
                            host_ip: container.bind_host.clone(),
                            host_port: *host_port,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<Vec<String>> {
        self.check_available()?;
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        let skip = tail.map_or(0, |n| container.logs.len().saturating_sub(n));
        Ok(container.logs[skip..].to_vec())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> EngineResult<()> {
        self.check_available()?;
        if self.failing_stop.load(Ordering::SeqCst) {
            return Err(EngineError::Api("cannot stop container: permission denied".to_string()));
        }
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        if !container.running {
            return Err(EngineError::NotModified(format!("container {id} is not running")));
        }
        container.halt();
        container.exit_code = Some(143);
        container.logs.push("received SIGTERM, shutting down".to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.check_available()?;
        if self.failing_removal.load(Ordering::SeqCst) {
            return Err(EngineError::Api(
                "removal of container is already in progress".to_string(),
            ));
        }
        let mut container = self
            .state()
            .containers
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        container.halt();
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        for container in self.state().containers.values_mut() {
            container.halt();
        }
    }
}
