use std::str::FromStr;

use crate::config::ConfigError;

/// Reads configuration values from an environment-like source.
///
/// Production code reads the process environment; tests pass a map so they
/// never touch global state.
pub(crate) struct EnvReader<'a> {
    lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
}

impl<'a> EnvReader<'a> {
    pub(crate) fn new(lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Process environment.
    pub(crate) fn process() -> Self {
        Self::new(|key| std::env::var(key).ok())
    }

    /// Trimmed value of `key`, `None` when unset or blank.
    pub(crate) fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("cannot parse '{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }

    pub(crate) fn flag_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("must be 'true' or 'false', got '{v}'"),
            }),
        }
    }
}
