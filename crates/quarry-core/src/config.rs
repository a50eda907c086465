use std::{collections::HashMap, env, time::Duration};

use anyhow::{Context, Result};
use quarry_domain::{HostEnvironment, PythonVersion, DEFAULT_PYTHON_VERSION};

pub const DEFAULT_INDEX_URL: &str = "https://pypi.org/simple/";
pub const DEFAULT_RETRIES: usize = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub(crate) fn flag_is_disabled(&self, key: &str) -> bool {
        self.vars.get(key).is_some_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off" | ""
            )
        })
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Settings read from `QUARRY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub index_url: String,
    pub retries: usize,
    pub timeout: Duration,
    pub python_version: PythonVersion,
    pub online: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            python_version: DEFAULT_PYTHON_VERSION,
            online: true,
        }
    }
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is set to a value that cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            index_url: snapshot
                .var("QUARRY_INDEX_URL")
                .map_or(defaults.index_url, ToOwned::to_owned),
            retries: match snapshot.var("QUARRY_RETRIES") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("QUARRY_RETRIES must be a number, got `{raw}`"))?,
                None => defaults.retries,
            },
            timeout: match snapshot.var("QUARRY_TIMEOUT") {
                Some(raw) => Duration::from_secs(
                    raw.trim()
                        .parse()
                        .with_context(|| format!("QUARRY_TIMEOUT must be seconds, got `{raw}`"))?,
                ),
                None => defaults.timeout,
            },
            python_version: match snapshot.var("QUARRY_PYTHON_VERSION") {
                Some(raw) => raw
                    .parse()
                    .context("QUARRY_PYTHON_VERSION is invalid")?,
                None => defaults.python_version,
            },
            online: !snapshot.flag_is_disabled("QUARRY_ONLINE"),
        })
    }

    /// The running machine as seen through this configuration.
    pub fn host(&self) -> HostEnvironment {
        HostEnvironment::detect(self.python_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_variables() -> Result<()> {
        let config = Config::from_snapshot(&EnvSnapshot::testing(&[]))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.index_url, "https://pypi.org/simple/");
        assert!(config.online);
        Ok(())
    }

    #[test]
    fn variables_override_defaults() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[
            ("QUARRY_INDEX_URL", "https://mirror.example/simple"),
            ("QUARRY_RETRIES", "2"),
            ("QUARRY_TIMEOUT", "7"),
            ("QUARRY_PYTHON_VERSION", "3.9"),
            ("QUARRY_ONLINE", "off"),
        ]);
        let config = Config::from_snapshot(&snapshot)?;
        assert_eq!(config.index_url, "https://mirror.example/simple");
        assert_eq!(config.retries, 2);
        assert_eq!(config.timeout, Duration::from_secs(7));
        assert_eq!(config.python_version, PythonVersion::new(3, 9));
        assert!(!config.online);
        assert_eq!(config.host().python_version, PythonVersion::new(3, 9));
        Ok(())
    }

    #[test]
    fn malformed_values_are_reported() {
        let snapshot = EnvSnapshot::testing(&[("QUARRY_RETRIES", "many")]);
        let err = Config::from_snapshot(&snapshot).expect_err("invalid retries");
        assert!(err.to_string().contains("QUARRY_RETRIES"));
    }

    #[test]
    fn online_accepts_truthy_values() -> Result<()> {
        for value in ["1", "true", "yes"] {
            let snapshot = EnvSnapshot::testing(&[("QUARRY_ONLINE", value)]);
            assert!(Config::from_snapshot(&snapshot)?.online);
        }
        Ok(())
    }
}
