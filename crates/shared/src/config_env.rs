use std::env;
use std::str::FromStr;

use crate::config::ConfigError;

/// Reads configuration keys through a lookup function so parsing can be
/// exercised without touching the process environment.
pub(crate) struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvReader<'a> {
    pub(crate) fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    pub(crate) fn optional_trimmed(&self, key: &str) -> Option<String> {
        (self.lookup)(key).and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub(crate) fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.optional_trimmed(key)
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    }

    pub(crate) fn string_or(&self, key: &str, default: &str) -> String {
        self.optional_trimmed(key)
            .unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn parse_int<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|_| ConfigError::ParseInt(key.to_string())),
            None => Ok(default),
        }
    }

    /// Like [`Self::parse_int`] but rejects zero.
    pub(crate) fn parse_positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialEq + Default,
    {
        let value = self.parse_int(key, default)?;
        if value == T::default() {
            return Err(ConfigError::InvalidConfiguration(format!(
                "{key} must be greater than zero"
            )));
        }
        Ok(value)
    }

    pub(crate) fn parse_with<T, E>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr<Err = E>,
        E: std::fmt::Display,
    {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| ConfigError::InvalidConfiguration(format!("{key}: {err}"))),
            None => Ok(default),
        }
    }
}

pub(crate) fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Absolute `http`/`https` URL with a host.
pub(crate) fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
    })
}
