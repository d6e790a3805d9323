// ── Record store ──
//
// Persistence seam. The engine only talks to `dyn RecordStore`; an
// embedder plugs in its database. `MemoryStore` is the in-process
// reference implementation used by tests and single-process setups.
//
// Insert methods assign the record id and return the stored record.

mod memory;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{
    ConfigHistory, ConfigTemplate, Device, DeviceConfigRecord, DeviceId, DriftReportRecord,
    DriftRun, DriftSchedule, DriftTrend, MacAddress, PolicyId, ReportQuery, RequestId,
    ResolutionHistory, ResolutionPolicy, ResolutionRequest, RunId, ScheduleId, TemplateId,
    TrendId, TrendQuery,
};

pub use memory::MemoryStore;

/// CRUD over every record the engine persists.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Devices ──────────────────────────────────────────────────────

    /// Insert a new device. Fails with `Validation` if its hardware
    /// address is already known.
    async fn insert_device(&self, device: Device) -> Result<Device, CoreError>;

    /// Replace an existing device record. The hardware address is immutable.
    async fn update_device(&self, device: Device) -> Result<Device, CoreError>;

    /// Atomically create a device or replace the record holding the same
    /// hardware address. Returns the stored record and whether it was created.
    async fn upsert_device_by_mac(&self, device: Device) -> Result<(Device, bool), CoreError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, CoreError>;

    async fn find_device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, CoreError>;

    async fn list_devices(&self) -> Result<Vec<Device>, CoreError>;

    async fn delete_device(&self, id: DeviceId) -> Result<bool, CoreError>;

    // ── Templates ────────────────────────────────────────────────────

    /// Insert a template. Names are unique.
    async fn insert_template(&self, template: ConfigTemplate) -> Result<ConfigTemplate, CoreError>;

    async fn update_template(&self, template: ConfigTemplate) -> Result<ConfigTemplate, CoreError>;

    async fn get_template(&self, id: TemplateId) -> Result<Option<ConfigTemplate>, CoreError>;

    async fn list_templates(&self) -> Result<Vec<ConfigTemplate>, CoreError>;

    async fn delete_template(&self, id: TemplateId) -> Result<bool, CoreError>;

    // ── Stored configuration ─────────────────────────────────────────

    async fn get_config_record(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<DeviceConfigRecord>, CoreError>;

    async fn put_config_record(&self, record: DeviceConfigRecord) -> Result<(), CoreError>;

    async fn insert_config_history(&self, entry: ConfigHistory) -> Result<ConfigHistory, CoreError>;

    async fn list_config_history(&self, device_id: DeviceId)
    -> Result<Vec<ConfigHistory>, CoreError>;

    // ── Drift scheduling ─────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: DriftSchedule) -> Result<DriftSchedule, CoreError>;

    async fn update_schedule(&self, schedule: DriftSchedule) -> Result<DriftSchedule, CoreError>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<DriftSchedule>, CoreError>;

    async fn list_schedules(&self) -> Result<Vec<DriftSchedule>, CoreError>;

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, CoreError>;

    async fn insert_run(&self, run: DriftRun) -> Result<DriftRun, CoreError>;

    async fn get_run(&self, id: RunId) -> Result<Option<DriftRun>, CoreError>;

    /// Runs, oldest first, optionally limited to one schedule.
    async fn list_runs(&self, schedule_id: Option<ScheduleId>) -> Result<Vec<DriftRun>, CoreError>;

    async fn insert_report(&self, report: DriftReportRecord)
    -> Result<DriftReportRecord, CoreError>;

    async fn list_reports(&self, query: ReportQuery) -> Result<Vec<DriftReportRecord>, CoreError>;

    // ── Trends ───────────────────────────────────────────────────────

    async fn insert_trend(&self, trend: DriftTrend) -> Result<DriftTrend, CoreError>;

    async fn update_trend(&self, trend: DriftTrend) -> Result<DriftTrend, CoreError>;

    async fn get_trend(&self, id: TrendId) -> Result<Option<DriftTrend>, CoreError>;

    /// The unresolved trend for `(device, path)`, if any.
    async fn find_open_trend(
        &self,
        device_id: DeviceId,
        path: &str,
    ) -> Result<Option<DriftTrend>, CoreError>;

    async fn list_trends(&self, query: TrendQuery) -> Result<Vec<DriftTrend>, CoreError>;

    // ── Resolution ───────────────────────────────────────────────────

    async fn insert_policy(&self, policy: ResolutionPolicy)
    -> Result<ResolutionPolicy, CoreError>;

    async fn update_policy(&self, policy: ResolutionPolicy)
    -> Result<ResolutionPolicy, CoreError>;

    async fn get_policy(&self, id: PolicyId) -> Result<Option<ResolutionPolicy>, CoreError>;

    async fn list_policies(&self) -> Result<Vec<ResolutionPolicy>, CoreError>;

    async fn delete_policy(&self, id: PolicyId) -> Result<bool, CoreError>;

    async fn insert_request(
        &self,
        request: ResolutionRequest,
    ) -> Result<ResolutionRequest, CoreError>;

    async fn update_request(
        &self,
        request: ResolutionRequest,
    ) -> Result<ResolutionRequest, CoreError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<ResolutionRequest>, CoreError>;

    async fn list_requests(&self) -> Result<Vec<ResolutionRequest>, CoreError>;

    async fn insert_resolution_history(
        &self,
        entry: ResolutionHistory,
    ) -> Result<ResolutionHistory, CoreError>;

    async fn list_resolution_history(
        &self,
        request_id: Option<RequestId>,
    ) -> Result<Vec<ResolutionHistory>, CoreError>;
}
