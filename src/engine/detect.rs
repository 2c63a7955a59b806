//! Docker availability check with platform-specific guidance.
//!
//! Used by `fixture-dock doctor` and by test suites that want to skip
//! container-backed tests on machines without a running daemon.

use std::fmt;

/// Docker daemon availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// Binary on PATH and daemon answering.
    Available,
    /// `docker` binary not found on PATH.
    NotInstalled,
    /// Binary found but the daemon does not answer.
    NotRunning,
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform, for install and startup hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/mac-install/"
            }
            Platform::Linux => "Install Docker Engine: https://docs.docker.com/engine/install/",
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/"
            }
        }
    }

    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => "Start Docker Desktop from Applications, or run: open -a Docker",
            Platform::Linux => "Start the Docker daemon: sudo systemctl start docker",
            Platform::Windows => "Start Docker Desktop from the Start menu",
        }
    }
}

/// Result of [`check_docker`].
#[derive(Debug, Clone)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
    /// Connection error when the daemon did not answer.
    pub detail: Option<String>,
}

impl DockerDetection {
    /// What the user should do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::NotInstalled => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

impl fmt::Display for DockerDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Docker: {}", self.status.as_str())?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\n  {hint}")?;
        }
        Ok(())
    }
}

/// Check whether Docker is installed and its daemon answers a ping.
pub async fn check_docker() -> DockerDetection {
    let platform = Platform::current();

    if !docker_binary_exists() {
        return DockerDetection {
            status: DockerStatus::NotInstalled,
            platform,
            detail: None,
        };
    }

    match crate::engine::connect_docker().await {
        Ok(_) => DockerDetection {
            status: DockerStatus::Available,
            platform,
            detail: None,
        },
        Err(e) => DockerDetection {
            status: DockerStatus::NotRunning,
            platform,
            detail: Some(e.to_string()),
        },
    }
}

fn docker_binary_exists() -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(finder)
        .arg("docker")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
