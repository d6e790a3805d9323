// ── Domain model ──
//
// Records persisted through the `RecordStore` plus the canonical
// configuration schema they carry.

pub mod configuration;
pub mod device;
pub mod drift;
pub mod ids;
pub mod resolution;
pub mod template;

pub use configuration::{
    CapabilityGroup, ColorConfig, DeviceConfiguration, DimmingConfig, InputConfig, LedConfig,
    OutputDefaultState, PowerMeteringConfig, RelayConfig, RollerConfig, RollerDefaultState,
};
pub use device::{Device, DeviceDraft, DeviceSettings, DeviceStatus, StoredCredential};
pub use drift::{
    BulkDriftReport, DeltaKind, DriftDelta, DriftOutcome, DriftReport, DriftReportRecord,
    DriftRun, DriftSchedule, DriftTrend, ReportQuery, ScheduleDraft, TrendQuery,
};
pub use ids::{
    ConfigHistoryId, DeviceId, MacAddress, PolicyId, ReportId, RequestId, ResolutionHistoryId,
    RunId, ScheduleId, TemplateId, TrendId,
};
pub use resolution::{
    PolicyDraft, ResolutionHistory, ResolutionMetrics, ResolutionPolicy, ResolutionRequest,
    ResolutionStatus,
};
pub use template::{
    ConfigAction, ConfigHistory, ConfigSource, ConfigTemplate, DeviceConfigRecord,
    TemplateDraft, TemplateScope,
};
