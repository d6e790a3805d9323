// ── Runtime engine configuration ──
//
// Describes how the engine talks to devices: the fleet-wide fallback
// credential, per-call timeouts, discovery fan-out and the scheduler
// tick. Never touches disk; `fleetsync-config` builds one from TOML/env.

use std::time::Duration;

use secrecy::SecretString;

use fleetsync_api::{Credentials, TransportConfig};

use crate::model::DeviceConfiguration;

/// Fleet-wide credential tried when a device has no working saved one.
#[derive(Debug, Clone)]
pub struct FallbackCredential {
    pub username: String,
    pub password: SecretString,
    pub enabled: bool,
}

impl FallbackCredential {
    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Per-call budgets for device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Connectivity test.
    pub connect_test: Duration,
    /// Status and configuration reads.
    pub fetch: Duration,
    /// Control commands and configuration writes.
    pub control: Duration,
    /// Unauthenticated identify probe during network discovery.
    pub probe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_test: Duration::from_secs(5),
            fetch: Duration::from_secs(8),
            control: Duration::from_secs(10),
            probe: Duration::from_secs(2),
        }
    }
}

/// Configuration for an [`Engine`](crate::Engine).
///
/// Built by the embedder and handed in; the engine never reads config files.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fallback: Option<FallbackCredential>,
    pub timeouts: Timeouts,
    pub transport: TransportConfig,
    /// Maximum concurrent identify probes during a network scan.
    pub discovery_concurrency: usize,
    /// Largest network a scan accepts, as a prefix length.
    pub discovery_min_prefix: u8,
    /// How often the background scheduler looks for due schedules.
    pub scheduler_tick: Duration,
    /// Bottom layer of every desired configuration.
    pub system_defaults: DeviceConfiguration,
    /// Recorded as `changed_by` on configuration history entries.
    pub actor: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback: None,
            timeouts: Timeouts::default(),
            transport: TransportConfig::default(),
            discovery_concurrency: 32,
            discovery_min_prefix: 16,
            scheduler_tick: Duration::from_secs(60),
            system_defaults: DeviceConfiguration::default(),
            actor: "fleetsync".into(),
        }
    }
}

impl EngineConfig {
    /// The fallback credential, if configured and enabled.
    pub fn active_fallback(&self) -> Option<Credentials> {
        self.fallback
            .as_ref()
            .filter(|f| f.enabled)
            .map(FallbackCredential::to_credentials)
    }
}
