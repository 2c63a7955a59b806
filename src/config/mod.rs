//! Runtime settings for fixture provisioning.
//!
//! Values come from the process environment (after loading `.env` with
//! `dotenvy`). Every setting has a default so an empty environment works.

mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub(crate) use helpers::EnvReader;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be used.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// A fixture definitions file could not be read or parsed.
    #[error("failed to load fixture definitions from {path}: {message}")]
    Definitions {
        /// File path.
        path: PathBuf,
        /// Reason for failure.
        message: String,
    },
}

/// Settings shared by every fixture lifecycle in the process.
#[derive(Debug, Clone)]
pub struct FixtureSettings {
    /// Maximum time to wait for a readiness probe to pass.
    pub startup_timeout: Duration,
    /// Interval between readiness probe attempts.
    pub probe_interval: Duration,
    /// Grace period given to a container on stop before it is killed.
    pub stop_timeout: Duration,
    /// Host address container ports are published on.
    pub bind_host: String,
    /// Leave containers running after teardown (for debugging).
    pub keep_containers: bool,
    /// Number of log lines captured when provisioning fails.
    pub log_tail_lines: usize,
    /// Directory holding the build contexts of the built-in fixtures.
    pub context_root: PathBuf,
    /// Optional TOML file with additional fixture definitions.
    pub definitions: Option<PathBuf>,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            bind_host: "127.0.0.1".to_string(),
            keep_containers: false,
            log_tail_lines: 200,
            context_root: PathBuf::from("fixtures"),
            definitions: None,
        }
    }
}

impl FixtureSettings {
    /// Load settings from `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve(&EnvReader::process())
    }

    pub(crate) fn resolve(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let startup_timeout_secs = env.parse_or(
            "FIXTURE_STARTUP_TIMEOUT_SECS",
            defaults.startup_timeout.as_secs(),
        )?;
        if startup_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FIXTURE_STARTUP_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let probe_interval_ms = env.parse_or(
            "FIXTURE_PROBE_INTERVAL_MS",
            defaults.probe_interval.as_millis() as u64,
        )?;
        if probe_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "FIXTURE_PROBE_INTERVAL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            startup_timeout: Duration::from_secs(startup_timeout_secs),
            probe_interval: Duration::from_millis(probe_interval_ms),
            stop_timeout: Duration::from_secs(
                env.parse_or("FIXTURE_STOP_TIMEOUT_SECS", defaults.stop_timeout.as_secs())?,
            ),
            bind_host: env
                .optional("FIXTURE_BIND_HOST")
                .unwrap_or(defaults.bind_host),
            keep_containers: env.flag_or("FIXTURE_KEEP_CONTAINERS", defaults.keep_containers)?,
            log_tail_lines: env.parse_or("FIXTURE_LOG_TAIL_LINES", defaults.log_tail_lines)?,
            context_root: env
                .optional("FIXTURE_CONTEXT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.context_root),
            definitions: env.optional("FIXTURE_DEFINITIONS").map(PathBuf::from),
        })
    }

    /// Settings tuned for fast in-process tests.
    pub fn for_tests() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }
}
