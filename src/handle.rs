//! Read-only view of a ready fixture, handed to test code.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;

use crate::fixture::Credentials;

#[derive(Debug, Serialize)]
struct HandleInner {
    fixture: String,
    container_id: String,
    ip_address: String,
    ports: BTreeMap<u16, u16>,
    credentials: Option<Credentials>,
}

/// Connection coordinates of a provisioned fixture.
///
/// Clones share one allocation; two handles are equal when they refer to
/// the same container.
#[derive(Clone)]
pub struct FixtureHandle {
    inner: Arc<HandleInner>,
}

impl FixtureHandle {
    pub(crate) fn new(
        fixture: String,
        container_id: String,
        ip_address: String,
        ports: BTreeMap<u16, u16>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                fixture,
                container_id,
                ip_address,
                ports,
                credentials,
            }),
        }
    }

    /// Address the fixture's ports are reachable on.
    pub fn ip_address(&self) -> &str {
        &self.inner.ip_address
    }

    /// Host port mapped to `container_port`, `None` if it is not exposed.
    pub fn resolved_port(&self, container_port: u16) -> Option<u16> {
        self.inner.ports.get(&container_port).copied()
    }

    /// Socket address for `container_port`.
    pub fn socket_addr(&self, container_port: u16) -> Option<SocketAddr> {
        let ip: IpAddr = self.inner.ip_address.parse().ok()?;
        Some(SocketAddr::new(ip, self.resolved_port(container_port)?))
    }

    /// Container port to host port mapping.
    pub fn ports(&self) -> &BTreeMap<u16, u16> {
        &self.inner.ports
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    pub fn fixture_name(&self) -> &str {
        &self.inner.fixture
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.inner.credentials.as_ref()
    }

    /// True when both handles are clones of the same allocation.
    pub fn same_instance(&self, other: &FixtureHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for FixtureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.container_id == other.inner.container_id
    }
}

impl Eq for FixtureHandle {}

impl fmt::Debug for FixtureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureHandle")
            .field("fixture", &self.inner.fixture)
            .field("container_id", &self.inner.container_id)
            .field("ip_address", &self.inner.ip_address)
            .field("ports", &self.inner.ports)
            .finish()
    }
}

impl fmt::Display for FixtureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.inner.fixture, self.inner.ip_address)?;
        let ports: Vec<String> = self
            .inner
            .ports
            .iter()
            .map(|(container, host)| format!("{container}->{host}"))
            .collect();
        write!(f, " [{}]", ports.join(", "))
    }
}

impl Serialize for FixtureHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}
