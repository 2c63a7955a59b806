//! Docker implementation of [`ContainerEngine`] using bollard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding, PortMap};
use futures::StreamExt;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, EngineError, EngineResult, PublishedPort,
};

/// Request timeout for sockets found by the fallback search.
const SOCKET_TIMEOUT_SECS: u64 = 120;

/// Connect to the local Docker daemon.
///
/// Tries bollard's defaults first (`DOCKER_HOST` or `/var/run/docker.sock`),
/// then the Docker Desktop and rootless socket locations.
pub async fn connect_docker() -> EngineResult<Docker> {
    let mut last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let Some(path) = socket.to_str() else {
            continue;
        };
        match Docker::connect_with_socket(path, SOCKET_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        {
            Ok(docker) => match docker.ping().await {
                Ok(_) => {
                    tracing::debug!(socket = %path, "Connected to Docker via fallback socket");
                    return Ok(docker);
                }
                Err(e) => last_error = format!("{path}: {e}"),
            },
            Err(e) => last_error = format!("{path}: {e}"),
        }
    }

    Err(EngineError::Unavailable { reason: last_error })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".colima/default/docker.sock"));
    }
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        sockets.push(PathBuf::from(runtime_dir).join("docker.sock"));
    }
    sockets
}

fn map_err(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 304,
            message,
        } => EngineError::NotModified(message),
        other => EngineError::Api(other.to_string()),
    }
}

/// Container engine backed by a Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local daemon.
    pub async fn connect() -> EngineResult<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// The underlying bollard client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable {
                reason: e.to_string(),
            })
    }

    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>> {
        match self.docker.inspect_image(reference).await {
            Ok(info) => Ok(Some(info.id.unwrap_or_else(|| reference.to_string()))),
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<String> {
        tracing::info!(image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(map_err)?;
            if let Some(status) = info.status {
                tracing::trace!(image = %reference, "Pull status: {}", status);
            }
        }

        self.image_id(reference)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("{reference} missing after pull")))
    }

    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &str,
        tag: &str,
    ) -> EngineResult<String> {
        let context_dir = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context_dir)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| EngineError::Api(format!("build context task failed: {e}")))?
        .map_err(|e| EngineError::Build {
            reason: format!("cannot archive build context {}: {e}", context.display()),
        })?;

        tracing::info!(
            tag = %tag,
            context = %context.display(),
            bytes = archive.len(),
            "Building image"
        );

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let mut stream = self
            .docker
            .build_image(options, None, Some(bytes::Bytes::from(archive)));

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| EngineError::Build {
                reason: e.to_string(),
            })?;
            if let Some(error) = info.error {
                return Err(EngineError::Build { reason: error });
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::trace!(tag = %tag, "{}", line);
                }
            }
        }

        self.image_id(tag)
            .await?
            .ok_or_else(|| EngineError::Build {
                reason: format!("image {tag} missing after build"),
            })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut port_bindings: PortMap = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.exposed_ports {
            let key = format!("{port}/tcp");
            // Empty host port lets the daemon pick a free one.
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some(spec.bind_host.clone()),
                    host_port: Some(String::new()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_err)?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "Docker warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerStatus> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;

        let (running, exit_code) = info
            .state
            .map(|s| (s.running.unwrap_or(false), s.exit_code))
            .unwrap_or((false, None));

        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .map(published_ports)
            .unwrap_or_default();

        Ok(ContainerStatus {
            running,
            exit_code,
            ports,
        })
    }

    async fn logs(&self, id: &str, tail: Option<usize>) -> EngineResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            lines.extend(chunk.to_string().lines().map(str::to_string));
        }
        Ok(lines)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> EngineResult<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)
    }
}

/// Convert Docker's `"22/tcp" -> [bindings]` map into host ports keyed by
/// container port. Only the first binding of each TCP port is kept.
fn published_ports(map: PortMap) -> std::collections::BTreeMap<u16, PublishedPort> {
    map.into_iter()
        .filter_map(|(key, bindings)| {
            let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            if proto != "tcp" {
                return None;
            }
            let container_port: u16 = port.parse().ok()?;
            let binding = bindings?.into_iter().next()?;
            let host_port: u16 = binding.host_port?.parse().ok()?;
            Some((
                container_port,
                PublishedPort {
                    host_ip: binding.host_ip.unwrap_or_default(),
                    host_port,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_published_ports() {
        let mut map: PortMap = HashMap::new();
        map.insert(
            "22/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("32771".to_string()),
            }]),
        );
        map.insert("5900/tcp".to_string(), None);
        map.insert(
            "53/udp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("32772".to_string()),
            }]),
        );

        let ports = published_ports(map);

        assert_eq!(ports.len(), 1);
        assert_eq!(
            ports.get(&22),
            Some(&PublishedPort {
                host_ip: "127.0.0.1".to_string(),
                host_port: 32771,
            })
        );
    }

    #[test]
    fn test_map_err_status_codes() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(matches!(map_err(not_found), EngineError::NotFound(_)));

        let not_modified = BollardError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        assert!(map_err(not_modified).is_gone());

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".to_string(),
        };
        assert!(matches!(map_err(conflict), EngineError::Api(_)));
    }
}
