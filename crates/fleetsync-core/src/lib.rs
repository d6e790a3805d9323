//! Configuration reconciliation engine between `fleetsync-api` and its
//! consumers.
//!
//! This crate owns the inventory, the canonical configuration model and
//! the workflows that keep a fleet of smart-home devices in line with it:
//!
//! - **[`Engine`]**: Central facade. Owns the [`RecordStore`], the
//!   [`CredentialManager`] and the background scheduler task; every
//!   operation is an `async fn` on it.
//!
//! - **Credentials** ([`credentials`]): Per-device lock, saved credential
//!   first, configured fallback second. Authenticated clients are cached
//!   per address in a [`ClientCache`].
//!
//! - **Configuration**: [`resolve`] layers system defaults, templates and
//!   per-device overrides into the desired configuration; [`convert`]
//!   translates it to and from each device generation's vocabulary.
//!
//! - **Drift**: [`diff`] compares desired and live configuration field by
//!   field; schedules, runs, reports and trends record it over time, and
//!   resolution requests push the desired values back under a policy.
//!
//! - **Discovery**: Sweeps an IPv4 range and reconciles what answers into
//!   the inventory by MAC address.

pub mod config;
pub mod configuration;
pub mod convert;
pub mod credentials;
pub mod discovery;
pub mod drift;
pub mod engine;
pub mod error;
pub mod model;
pub mod resolution;
pub mod resolver;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_support;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{EngineConfig, FallbackCredential, Timeouts};
pub use credentials::{
    AttemptOutcome, ClientCache, ClientFactory, CredentialManager, CredentialState,
    HttpClientFactory,
};
pub use discovery::{DiscoveryResult, ObservedDevice, ReconcileOutcome};
pub use drift::diff;
pub use engine::Engine;
pub use error::{CoreError, ErrorKind};
pub use resolver::{ConfigLayer, ResolvedConfiguration, resolve};
pub use store::{MemoryStore, RecordStore};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Configuration
    CapabilityGroup,
    ColorConfig,
    ConfigAction,
    ConfigHistory,
    ConfigSource,
    ConfigTemplate,
    DeviceConfigRecord,
    DeviceConfiguration,
    DimmingConfig,
    InputConfig,
    LedConfig,
    OutputDefaultState,
    PowerMeteringConfig,
    RelayConfig,
    RollerConfig,
    RollerDefaultState,
    TemplateDraft,
    TemplateScope,
    // Inventory
    Device,
    DeviceDraft,
    DeviceId,
    DeviceSettings,
    DeviceStatus,
    MacAddress,
    StoredCredential,
    TemplateId,
    // Drift
    BulkDriftReport,
    DeltaKind,
    DriftDelta,
    DriftOutcome,
    DriftReport,
    DriftReportRecord,
    DriftRun,
    DriftSchedule,
    DriftTrend,
    ReportQuery,
    RunId,
    ScheduleDraft,
    ScheduleId,
    TrendId,
    TrendQuery,
    // Resolution
    PolicyDraft,
    PolicyId,
    RequestId,
    ResolutionHistory,
    ResolutionMetrics,
    ResolutionPolicy,
    ResolutionRequest,
    ResolutionStatus,
};
