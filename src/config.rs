// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Settings layout.
//!
//! Nixopus reads one settings file when it starts up, and passes the result
//! by reference to whatever needs it. The file is optional. Every field has a
//! default that matches a stock installation.
//!
//! # General Layout
//!
//! ```toml
//! [proxy]
//! admin_url = "http://127.0.0.1:2019"
//! probe_timeout_ms = 1000
//! request_timeout_ms = 10000
//!
//! [proxy.readiness]
//! max_attempts = 0
//! timeout_ms = 30000
//!
//! [proxy.publish]
//! max_attempts = 5
//!
//! [env]
//! api = "/etc/nixopus/source/api/.env"
//! view = "$HOME/nixopus/view/.env"
//! ```
//!
//! Paths in the `[env]` table go through shell expansion when parsed.

use crate::{
    proxy::PublisherConfig,
    retry::{RetryPolicy, RetrySettings},
};

use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Process-wide settings.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Reverse proxy admin API settings.
    pub proxy: ProxySettings,

    /// Environment file of each service by service name.
    pub env: BTreeMap<String, PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::default(),
            env: BTreeMap::from([
                ("api".into(), PathBuf::from("/etc/nixopus/source/api/.env")),
                ("view".into(), PathBuf::from("/etc/nixopus/source/view/.env")),
            ]),
        }
    }
}

impl Settings {
    /// Load settings from file, falling back to defaults if it is missing.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match read_to_string(path.as_ref()) {
            Ok(content) => content.parse(),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Read {
                reason: err.to_string(),
                path: path.as_ref().to_path_buf(),
            }),
        }
    }

    /// Environment file path of service.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownService`] if no path is configured.
    pub fn env_file(&self, service: impl AsRef<str>) -> Result<&Path> {
        self.env
            .get(service.as_ref())
            .map(PathBuf::as_path)
            .ok_or_else(|| ConfigError::UnknownService(service.as_ref().to_owned()))
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on environment file paths.
        for path in settings.env.values_mut() {
            *path = PathBuf::from(
                shellexpand::full(path.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            );
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Reverse proxy admin API settings.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Base URL of the admin API.
    pub admin_url: String,

    /// Timeout of one readiness probe in milliseconds.
    pub probe_timeout_ms: u64,

    /// Timeout of one load request in milliseconds.
    pub request_timeout_ms: u64,

    /// Schedule for readiness probing.
    #[serde(deserialize_with = "readiness_over_defaults")]
    pub readiness: RetrySettings,

    /// Schedule for load attempts.
    #[serde(deserialize_with = "publish_over_defaults")]
    pub publish: RetrySettings,
}

impl ProxySettings {
    fn default_readiness() -> RetrySettings {
        RetrySettings {
            max_attempts: 0,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            timeout_ms: 30_000,
        }
    }

    fn default_publish() -> RetrySettings {
        RetrySettings {
            max_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            timeout_ms: 0,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            admin_url: "http://127.0.0.1:2019".into(),
            probe_timeout_ms: 1_000,
            request_timeout_ms: 10_000,
            readiness: Self::default_readiness(),
            publish: Self::default_publish(),
        }
    }
}

/// Retry table as written in the settings file.
///
/// Fields left out keep the value of the section being overridden, not the
/// generic [`RetrySettings::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryOverrides {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

impl RetryOverrides {
    fn apply(self, base: RetrySettings) -> RetrySettings {
        RetrySettings {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
        }
    }
}

fn readiness_over_defaults<'de, D>(deserializer: D) -> Result<RetrySettings, D::Error>
where
    D: Deserializer<'de>,
{
    RetryOverrides::deserialize(deserializer)
        .map(|overrides| overrides.apply(ProxySettings::default_readiness()))
}

fn publish_over_defaults<'de, D>(deserializer: D) -> Result<RetrySettings, D::Error>
where
    D: Deserializer<'de>,
{
    RetryOverrides::deserialize(deserializer)
        .map(|overrides| overrides.apply(ProxySettings::default_publish()))
}

impl From<&ProxySettings> for PublisherConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            readiness: RetryPolicy::from(&settings.readiness),
            publish: RetryPolicy::from(&settings.publish),
        }
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read settings file.
    #[error("failed to read settings from {:?}: {reason}", path.display())]
    Read { reason: String, path: PathBuf },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// No environment file configured for service.
    #[error("no environment file configured for service {0:?}")]
    UnknownService(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("NIXOPUS_HOME", "/home/blah/nixopus")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            [proxy]
            admin_url = "http://caddy:2019"
            probe_timeout_ms = 500

            [proxy.publish]
            max_attempts = 3
            base_delay_ms = 250

            [env]
            api = "$NIXOPUS_HOME/api/.env"
            view = "/etc/nixopus/view/.env"
        "#
        .parse()?;

        let expect = Settings {
            proxy: ProxySettings {
                admin_url: "http://caddy:2019".into(),
                probe_timeout_ms: 500,
                publish: RetrySettings {
                    max_attempts: 3,
                    base_delay_ms: 250,
                    ..ProxySettings::default_publish()
                },
                ..Default::default()
            },
            env: BTreeMap::from([
                ("api".into(), PathBuf::from("/home/blah/nixopus/api/.env")),
                ("view".into(), PathBuf::from("/etc/nixopus/view/.env")),
            ]),
        };

        assert_eq!(result, expect);
        assert_eq!(result.env_file("api")?, Path::new("/home/blah/nixopus/api/.env"));
        assert!(matches!(
            result.env_file("db"),
            Err(ConfigError::UnknownService(name)) if name == "db"
        ));

        Ok(())
    }

    #[test]
    fn empty_settings_use_defaults() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());

        let config = PublisherConfig::from(&result.proxy);
        assert_eq!(config, PublisherConfig::default());

        Ok(())
    }

    #[test]
    fn partial_retry_tables_keep_section_defaults() -> anyhow::Result<()> {
        let result: Settings = indoc! {r#"
            [proxy.readiness]
            base_delay_ms = 500

            [proxy.publish]
            multiplier = 3.0
        "#}
        .parse()?;

        let expect = RetrySettings {
            base_delay_ms: 500,
            ..ProxySettings::default_readiness()
        };
        assert_eq!(result.proxy.readiness, expect);
        assert_eq!(result.proxy.readiness.timeout_ms, 30_000);

        let expect = RetrySettings {
            multiplier: 3.0,
            ..ProxySettings::default_publish()
        };
        assert_eq!(result.proxy.publish, expect);
        assert_eq!(result.proxy.publish.max_delay_ms, 10_000);

        let config = PublisherConfig::from(&result.proxy);
        assert_eq!(config.readiness.max_attempts(), None);
        assert_eq!(config.readiness.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.publish.max_attempts(), Some(5));

        Ok(())
    }

    #[test]
    fn missing_settings_file_uses_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = Settings::load(dir.path().join("config.toml"))?;
        assert_eq!(result, Settings::default());

        Ok(())
    }

    #[test]
    fn serialize_settings() {
        let mut settings = Settings::default();
        settings.proxy.admin_url = "http://localhost:2019".into();
        settings
            .env
            .insert("api".into(), PathBuf::from("/etc/nixopus/api/.env"));
        let result = settings.to_string();

        let expect = indoc! {r#"
            [proxy]
            admin_url = "http://localhost:2019"
            probe_timeout_ms = 1000
            request_timeout_ms = 10000

            [proxy.readiness]
            max_attempts = 0
            base_delay_ms = 1000
            multiplier = 2.0
            max_delay_ms = 5000
            timeout_ms = 30000

            [proxy.publish]
            max_attempts = 5
            base_delay_ms = 1000
            multiplier = 2.0
            max_delay_ms = 10000
            timeout_ms = 0

            [env]
            api = "/etc/nixopus/api/.env"
            view = "/etc/nixopus/source/view/.env"
        "#};

        assert_eq!(result, expect);
    }
}
