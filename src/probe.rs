//! Readiness probes.
//!
//! A probe decides whether a started container is actually usable. Probes
//! only observe the container (connect, read, fetch logs); they never change
//! its state. A failed attempt returns the reason, which the controller
//! reports if the startup timeout runs out.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use crate::engine::ContainerEngine;
use crate::fixture::ProbeKind;

/// Upper bound for a single probe attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// What a probe may look at.
pub struct ProbeTarget<'a> {
    pub container_id: &'a str,
    /// Host address the published ports are reachable on.
    pub host: &'a str,
    /// Host ports keyed by container port.
    pub bindings: &'a BTreeMap<u16, u16>,
    pub engine: &'a dyn ContainerEngine,
}

impl ProbeTarget<'_> {
    fn address(&self, container_port: u16) -> Result<String, String> {
        let host_port = self
            .bindings
            .get(&container_port)
            .ok_or_else(|| format!("port {container_port} is not published"))?;
        Ok(format!("{}:{}", self.host, host_port))
    }
}

/// A single readiness check.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Short description for logs and errors.
    fn describe(&self) -> String;

    /// `Ok(())` once ready, otherwise why not.
    async fn check(&self, target: &ProbeTarget<'_>) -> Result<(), String>;
}

impl ProbeKind {
    /// Probe implementing this kind.
    pub fn probe(&self) -> Box<dyn ReadinessProbe> {
        match self {
            ProbeKind::Tcp { port } => Box::new(TcpProbe { port: *port }),
            ProbeKind::SshBanner { port } => Box::new(SshBannerProbe { port: *port }),
            ProbeKind::LogLine { pattern } => Box::new(LogLineProbe {
                pattern: pattern.clone(),
            }),
            ProbeKind::Http { port, path } => Box::new(HttpProbe::new(*port, path)),
        }
    }
}

async fn connect(address: &str) -> Result<TcpStream, String> {
    match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(format!("connect to {address}: {e}")),
        Err(_) => Err(format!("connect to {address}: timed out")),
    }
}

/// Ready when a TCP connection to the published port succeeds.
pub struct TcpProbe {
    pub port: u16,
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp probe on port {}", self.port)
    }

    async fn check(&self, target: &ProbeTarget<'_>) -> Result<(), String> {
        let address = target.address(self.port)?;
        connect(&address).await.map(|_| ())
    }
}

/// Ready when the published port sends an SSH identification line.
///
/// A bare TCP connect is not enough here: Docker's userland proxy accepts
/// connections on the host port before sshd listens in the container.
pub struct SshBannerProbe {
    pub port: u16,
}

#[async_trait]
impl ReadinessProbe for SshBannerProbe {
    fn describe(&self) -> String {
        format!("ssh banner probe on port {}", self.port)
    }

    async fn check(&self, target: &ProbeTarget<'_>) -> Result<(), String> {
        let address = target.address(self.port)?;
        let stream = connect(&address).await?;

        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        match tokio::time::timeout(ATTEMPT_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(format!("{address} closed the connection without a banner")),
            Ok(Ok(_)) if line.starts_with("SSH-") => Ok(()),
            Ok(Ok(_)) => Err(format!("{address} sent a non-ssh banner: {}", line.trim_end())),
            Ok(Err(e)) => Err(format!("read from {address}: {e}")),
            Err(_) => Err(format!("no banner from {address}")),
        }
    }
}

/// Ready when the container output contains a pattern.
pub struct LogLineProbe {
    pub pattern: String,
}

#[async_trait]
impl ReadinessProbe for LogLineProbe {
    fn describe(&self) -> String {
        format!("log probe for '{}'", self.pattern)
    }

    async fn check(&self, target: &ProbeTarget<'_>) -> Result<(), String> {
        let lines = target
            .engine
            .logs(target.container_id, None)
            .await
            .map_err(|e| format!("read logs: {e}"))?;
        if lines.iter().any(|line| line.contains(&self.pattern)) {
            Ok(())
        } else {
            Err(format!("'{}' not seen in {} log lines", self.pattern, lines.len()))
        }
    }
}

/// Ready when an HTTP GET on the published port returns 2xx.
pub struct HttpProbe {
    pub port: u16,
    pub path: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(port: u16, path: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            port,
            path: path.to_string(),
            client,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    fn describe(&self) -> String {
        format!("http probe on port {}{}", self.port, self.path)
    }

    async fn check(&self, target: &ProbeTarget<'_>) -> Result<(), String> {
        let url = format!(
            "http://{}/{}",
            target.address(self.port)?,
            self.path.trim_start_matches('/')
        );
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("GET {url} returned {}", resp.status())),
            Err(e) => Err(format!("GET {url}: {e}")),
        }
    }
}
