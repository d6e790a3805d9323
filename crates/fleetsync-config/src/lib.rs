//! Configuration for fleetsync embedders.
//!
//! A TOML file at the platform config dir merged with `FLEETSYNC_`
//! environment overrides, fallback credential resolution (env + keyring +
//! plaintext), translation to `fleetsync_core::EngineConfig`, and tracing
//! subscriber setup in [`logging`].

pub mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetsync_api::TransportConfig;
use fleetsync_core::{DeviceConfiguration, EngineConfig, FallbackCredential, Timeouts};

pub use logging::{LogFormat, LoggingConfig, init_logging};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no password found for fallback user '{username}'")]
    NoCredentials { username: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Recorded as the author of configuration history entries.
    #[serde(default = "default_actor")]
    pub actor: String,

    #[serde(default)]
    pub fallback: FallbackSection,

    #[serde(default)]
    pub timeouts: TimeoutSection,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bottom layer of every desired configuration, keyed by capability
    /// group (`[system_defaults.led]` etc.).
    #[serde(default = "empty_object")]
    pub system_defaults: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            actor: default_actor(),
            fallback: FallbackSection::default(),
            timeouts: TimeoutSection::default(),
            discovery: DiscoverySection::default(),
            scheduler: SchedulerSection::default(),
            logging: LoggingConfig::default(),
            system_defaults: empty_object(),
        }
    }
}

fn default_actor() -> String {
    "fleetsync".into()
}
fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Fleet-wide credential tried when a device's own one is missing or stale.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FallbackSection {
    #[serde(default)]
    pub enabled: bool,

    pub username: Option<String>,

    /// Plaintext password (prefer `password_env` or the keyring).
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Keyring service to look the password up under, keyed by username.
    pub keyring_service: Option<String>,
}

impl FallbackSection {
    /// Resolve the password: named env var, then keyring, then plaintext.
    pub fn resolve_password(&self, username: &str) -> Result<SecretString, ConfigError> {
        // 1. Env var
        if let Some(ref env_name) = self.password_env {
            if let Ok(pw) = std::env::var(env_name) {
                return Ok(SecretString::from(pw));
            }
        }

        // 2. Keyring, only when a service is configured
        if let Some(ref service) = self.keyring_service {
            if let Ok(entry) = keyring::Entry::new(service, username) {
                if let Ok(pw) = entry.get_password() {
                    return Ok(SecretString::from(pw));
                }
            }
        }

        // 3. Plaintext in config
        if let Some(ref pw) = self.password {
            return Ok(SecretString::from(pw.clone()));
        }

        Err(ConfigError::NoCredentials {
            username: username.into(),
        })
    }

    fn to_fallback(&self) -> Result<Option<FallbackCredential>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        let username = self
            .username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConfigError::invalid("fallback.username", "required when enabled"))?;
        let password = self.resolve_password(username)?;
        Ok(Some(FallbackCredential {
            username: username.to_owned(),
            password,
            enabled: true,
        }))
    }
}

/// Per-call budgets, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub connect_test_secs: u64,
    pub fetch_secs: u64,
    pub control_secs: u64,
    pub probe_secs: u64,
    /// Ceiling for any single HTTP exchange.
    pub http_secs: u64,
    pub connect_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_test_secs: 5,
            fetch_secs: 8,
            control_secs: 10,
            probe_secs: 2,
            http_secs: 15,
            connect_secs: 3,
        }
    }
}

impl TimeoutSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("timeouts.connect_test_secs", self.connect_test_secs),
            ("timeouts.fetch_secs", self.fetch_secs),
            ("timeouts.control_secs", self.control_secs),
            ("timeouts.probe_secs", self.probe_secs),
            ("timeouts.http_secs", self.http_secs),
            ("timeouts.connect_secs", self.connect_secs),
        ];
        for (field, value) in fields {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1 second"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Concurrent identify probes during a scan.
    pub concurrency: usize,
    /// Largest network accepted, as a prefix length.
    pub min_prefix: u8,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            concurrency: 32,
            min_prefix: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// How often the background task looks for due schedules.
    pub tick_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { tick_secs: 60 }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "fleetsync", "fleetsync").map_or_else(
        || PathBuf::from(".fleetsync").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_from_path(&config_path())
}

/// Load the config from `path` plus environment. A missing file yields
/// the defaults; `FLEETSYNC_SECTION__KEY` variables override file values.
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FLEETSYNC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Engine translation ──────────────────────────────────────────────

impl Config {
    /// Validate and build the engine's runtime configuration, resolving
    /// the fallback password on the way.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        self.timeouts.validate()?;
        if self.discovery.concurrency == 0 {
            return Err(ConfigError::invalid("discovery.concurrency", "must be at least 1"));
        }
        if self.discovery.min_prefix > 32 {
            return Err(ConfigError::invalid(
                "discovery.min_prefix",
                format!("{} is not a valid IPv4 prefix", self.discovery.min_prefix),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::invalid("scheduler.tick_secs", "must be at least 1 second"));
        }
        let system_defaults = DeviceConfiguration::from_blob(&self.system_defaults)
            .map_err(|e| ConfigError::invalid("system_defaults", e.to_string()))?;

        let t = &self.timeouts;
        Ok(EngineConfig {
            fallback: self.fallback.to_fallback()?,
            timeouts: Timeouts {
                connect_test: Duration::from_secs(t.connect_test_secs),
                fetch: Duration::from_secs(t.fetch_secs),
                control: Duration::from_secs(t.control_secs),
                probe: Duration::from_secs(t.probe_secs),
            },
            transport: TransportConfig {
                timeout: Duration::from_secs(t.http_secs),
                connect_timeout: Duration::from_secs(t.connect_secs),
            },
            discovery_concurrency: self.discovery.concurrency,
            discovery_min_prefix: self.discovery.min_prefix,
            scheduler_tick: Duration::from_secs(self.scheduler.tick_secs),
            system_defaults,
            actor: self.actor.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from_path(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.timeouts, TimeoutSection::default());
        assert_eq!(config.discovery.concurrency, 32);

        let engine = config.to_engine_config().unwrap();
        assert!(engine.fallback.is_none());
        assert_eq!(engine.timeouts, Timeouts::default());
        assert!(engine.system_defaults.is_empty());
    }

    #[test]
    fn file_values_and_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                actor = "ops"

                [fallback]
                enabled = true
                username = "admin"
                password = "from-file"

                [timeouts]
                fetch_secs = 20

                [system_defaults.led]
                status_disabled = true
                "#,
            )?;
            jail.set_env("FLEETSYNC_TIMEOUTS__FETCH_SECS", "3");
            jail.set_env("FLEETSYNC_DISCOVERY__MIN_PREFIX", "24");

            let config = load_from_path(Path::new("config.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.actor, "ops");
            assert_eq!(config.timeouts.fetch_secs, 3);
            assert_eq!(config.timeouts.control_secs, 10);
            assert_eq!(config.discovery.min_prefix, 24);

            let engine = config.to_engine_config().map_err(|e| e.to_string())?;
            assert_eq!(engine.timeouts.fetch, Duration::from_secs(3));
            let fallback = engine.fallback.ok_or("fallback missing")?;
            assert_eq!(fallback.username, "admin");
            assert_eq!(fallback.password.expose_secret(), "from-file");
            assert!(engine.system_defaults.led.is_some());
            Ok(())
        });
    }

    #[test]
    fn password_env_beats_plaintext() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PUMP_HOUSE_PW", "from-env");
            let section = FallbackSection {
                enabled: true,
                username: Some("admin".into()),
                password: Some("from-file".into()),
                password_env: Some("PUMP_HOUSE_PW".into()),
                keyring_service: None,
            };
            let pw = section.resolve_password("admin").map_err(|e| e.to_string())?;
            assert_eq!(pw.expose_secret(), "from-env");
            Ok(())
        });
    }

    #[test]
    fn enabled_fallback_without_password_is_an_error() {
        let config = Config {
            fallback: FallbackSection {
                enabled: true,
                username: Some("admin".into()),
                ..FallbackSection::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            config.to_engine_config(),
            Err(ConfigError::NoCredentials { .. })
        ));

        let no_user = Config {
            fallback: FallbackSection {
                enabled: true,
                password: Some("pw".into()),
                ..FallbackSection::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            no_user.to_engine_config(),
            Err(ConfigError::Validation { field, .. }) if field == "fallback.username"
        ));
    }

    #[test]
    fn disabled_fallback_skips_password_lookup() {
        let config = Config {
            fallback: FallbackSection {
                enabled: false,
                username: Some("admin".into()),
                ..FallbackSection::default()
            },
            ..Config::default()
        };
        assert!(config.to_engine_config().unwrap().fallback.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.timeouts.control_secs = 0;
        assert!(matches!(
            config.to_engine_config(),
            Err(ConfigError::Validation { field, .. }) if field == "timeouts.control_secs"
        ));

        let mut config = Config::default();
        config.discovery.min_prefix = 33;
        assert!(config.to_engine_config().is_err());

        let config = Config {
            system_defaults: serde_json::json!({"relay": {"default_state": "sideways"}}),
            ..Config::default()
        };
        assert!(matches!(
            config.to_engine_config(),
            Err(ConfigError::Validation { field, .. }) if field == "system_defaults"
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.scheduler.tick_secs = 15;
        config.logging.format = LogFormat::Json;
        save_config(&config, &path).unwrap();

        let loaded = load_from_path(&path).unwrap();
        assert_eq!(loaded.scheduler.tick_secs, 15);
        assert_eq!(loaded.logging.format, LogFormat::Json);
    }
}
