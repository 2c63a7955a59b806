//! A provisioned container and the state it is in.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::ContainerStatus;
use crate::error::{FixtureError, Result};
use crate::fixture::FixtureDescriptor;
use crate::handle::FixtureHandle;
use crate::lifecycle::state::{InvalidTransition, LifecycleState};

/// One running (or formerly running) fixture container.
///
/// Owned by the lifecycle controller until it is ready, then by exactly one
/// holder. Tests only ever see the [`FixtureHandle`].
#[derive(Debug)]
pub struct ContainerInstance {
    id: String,
    name: String,
    image: String,
    descriptor: Arc<FixtureDescriptor>,
    host_ip: String,
    host_bindings: BTreeMap<u16, u16>,
    state: LifecycleState,
    handle: Option<FixtureHandle>,
}

impl ContainerInstance {
    pub(crate) fn new(
        id: String,
        name: String,
        image: String,
        descriptor: Arc<FixtureDescriptor>,
        host_ip: String,
    ) -> Self {
        Self {
            id,
            name,
            image,
            descriptor,
            host_ip,
            host_bindings: BTreeMap::new(),
            state: LifecycleState::Pending,
            handle: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image key the container was created from.
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn descriptor(&self) -> &Arc<FixtureDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn host_ip(&self) -> &str {
        &self.host_ip
    }

    /// Engine-reported host ports keyed by container port. Empty until the
    /// container has been inspected after start.
    pub fn host_bindings(&self) -> &BTreeMap<u16, u16> {
        &self.host_bindings
    }

    /// Read-only handle. Only available once the instance is ready.
    pub fn handle(&self) -> Result<FixtureHandle> {
        match (&self.handle, self.state) {
            (Some(handle), LifecycleState::Ready) => Ok(handle.clone()),
            _ => Err(FixtureError::NotReady {
                fixture: self.descriptor.name.clone(),
                state: self.state,
            }),
        }
    }

    pub(crate) fn transition(
        &mut self,
        next: LifecycleState,
    ) -> std::result::Result<(), InvalidTransition> {
        self.state = self.state.transition(next)?;
        tracing::trace!(
            fixture = %self.descriptor.name,
            container = %self.name,
            state = %self.state,
            "Lifecycle transition"
        );
        if next == LifecycleState::Ready {
            self.handle = Some(FixtureHandle::new(
                self.descriptor.name.clone(),
                self.id.clone(),
                self.host_ip.clone(),
                self.host_bindings.clone(),
                self.descriptor.credentials.clone(),
            ));
        }
        Ok(())
    }

    /// Final state, set regardless of how teardown went.
    pub(crate) fn mark_removed(&mut self) {
        self.state = LifecycleState::Removed;
    }

    /// Record the published ports from an inspect result. Returns the
    /// exposed ports the engine has not published (yet).
    pub(crate) fn record_bindings(&mut self, status: &ContainerStatus, bind_host: &str) -> Vec<u16> {
        self.host_bindings = status
            .ports
            .iter()
            .filter(|(port, _)| self.descriptor.exposed_ports.contains(*port))
            .map(|(port, published)| (*port, published.host_port))
            .collect();

        let reported_ip = status
            .ports
            .values()
            .map(|p| p.host_ip.as_str())
            .find(|ip| !is_wildcard(ip));
        self.host_ip = reported_ip.unwrap_or(bind_host).to_string();
        if is_wildcard(&self.host_ip) {
            self.host_ip = "127.0.0.1".to_string();
        }

        self.descriptor
            .exposed_ports
            .iter()
            .copied()
            .filter(|port| !self.host_bindings.contains_key(port))
            .collect()
    }
}

fn is_wildcard(ip: &str) -> bool {
    matches!(ip, "" | "0.0.0.0" | "::" | "[::]")
}
