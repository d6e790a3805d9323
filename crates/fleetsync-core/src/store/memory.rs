// ── In-memory record store ──
//
// One `Table` per record kind: a `DashMap` keyed by id plus an atomic id
// sequence. Devices carry a secondary index by hardware address, and
// templates one by name; both are claimed through `DashMap::entry` so
// uniqueness checks and writes happen under the same shard lock.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::RecordStore;
use crate::error::CoreError;
use crate::model::{
    ConfigHistory, ConfigHistoryId, ConfigTemplate, Device, DeviceConfigRecord, DeviceId,
    DriftReportRecord, DriftRun, DriftSchedule, DriftTrend, MacAddress, PolicyId, ReportId,
    ReportQuery, RequestId, ResolutionHistory, ResolutionHistoryId, ResolutionPolicy,
    ResolutionRequest, RunId, ScheduleId, TemplateId, TrendId, TrendQuery,
};

/// A record with a store-assigned integer id.
trait Record: Clone + Send + Sync + 'static {
    const ENTITY: &'static str;
    fn raw_id(&self) -> u64;
    fn set_raw_id(&mut self, id: u64);
}

macro_rules! impl_record {
    ($($ty:ty => $entity:literal, $id:ident;)+) => {
        $(
            impl Record for $ty {
                const ENTITY: &'static str = $entity;
                fn raw_id(&self) -> u64 {
                    self.id.0
                }
                fn set_raw_id(&mut self, id: u64) {
                    self.id = $id(id);
                }
            }
        )+
    };
}

impl_record! {
    Device => "device", DeviceId;
    ConfigTemplate => "template", TemplateId;
    ConfigHistory => "config_history", ConfigHistoryId;
    DriftSchedule => "schedule", ScheduleId;
    DriftRun => "run", RunId;
    DriftReportRecord => "report", ReportId;
    DriftTrend => "trend", TrendId;
    ResolutionPolicy => "policy", PolicyId;
    ResolutionRequest => "resolution_request", RequestId;
    ResolutionHistory => "resolution_history", ResolutionHistoryId;
}

struct Table<T: Record> {
    rows: DashMap<u64, T>,
    next_id: AtomicU64,
}

impl<T: Record> Table<T> {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, mut row: T) -> T {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        row.set_raw_id(id);
        self.rows.insert(id, row.clone());
        row
    }

    fn update(&self, row: T) -> Result<T, CoreError> {
        match self.rows.get_mut(&row.raw_id()) {
            Some(mut slot) => {
                *slot = row.clone();
                Ok(row)
            }
            None => Err(CoreError::not_found(T::ENTITY, row.raw_id())),
        }
    }

    fn get(&self, id: u64) -> Option<T> {
        self.rows.get(&id).map(|r| r.value().clone())
    }

    fn remove(&self, id: u64) -> Option<T> {
        self.rows.remove(&id).map(|(_, v)| v)
    }

    /// Rows matching `keep`, ordered by id.
    fn filter(&self, keep: impl Fn(&T) -> bool) -> Vec<T> {
        let mut rows: Vec<T> = self
            .rows
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.raw_id());
        rows
    }

    fn all(&self) -> Vec<T> {
        self.filter(|_| true)
    }
}

/// Thread-safe in-memory [`RecordStore`].
pub struct MemoryStore {
    devices: Table<Device>,
    devices_by_mac: DashMap<MacAddress, u64>,
    templates: Table<ConfigTemplate>,
    templates_by_name: DashMap<String, u64>,
    config_records: DashMap<DeviceId, DeviceConfigRecord>,
    config_history: Table<ConfigHistory>,
    schedules: Table<DriftSchedule>,
    runs: Table<DriftRun>,
    reports: Table<DriftReportRecord>,
    trends: Table<DriftTrend>,
    policies: Table<ResolutionPolicy>,
    requests: Table<ResolutionRequest>,
    resolution_history: Table<ResolutionHistory>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            devices: Table::new(),
            devices_by_mac: DashMap::new(),
            templates: Table::new(),
            templates_by_name: DashMap::new(),
            config_records: DashMap::new(),
            config_history: Table::new(),
            schedules: Table::new(),
            runs: Table::new(),
            reports: Table::new(),
            trends: Table::new(),
            policies: Table::new(),
            requests: Table::new(),
            resolution_history: Table::new(),
        }
    }
}

fn duplicate(what: &str, key: &str) -> CoreError {
    CoreError::validation(format!("{what} '{key}' already exists"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    // ── Devices ──────────────────────────────────────────────────────

    async fn insert_device(&self, device: Device) -> Result<Device, CoreError> {
        match self.devices_by_mac.entry(device.mac.clone()) {
            Entry::Occupied(_) => Err(duplicate("device", device.mac.as_str())),
            Entry::Vacant(slot) => {
                let stored = self.devices.insert(device);
                slot.insert(stored.id.0);
                Ok(stored)
            }
        }
    }

    async fn update_device(&self, device: Device) -> Result<Device, CoreError> {
        let existing = self
            .devices
            .get(device.id.0)
            .ok_or_else(|| CoreError::not_found("device", device.id))?;
        if existing.mac != device.mac {
            return Err(CoreError::validation(format!(
                "hardware address of device {} cannot change",
                device.id
            )));
        }
        self.devices.update(device)
    }

    async fn upsert_device_by_mac(&self, mut device: Device) -> Result<(Device, bool), CoreError> {
        match self.devices_by_mac.entry(device.mac.clone()) {
            Entry::Occupied(slot) => {
                let id = *slot.get();
                device.id = DeviceId(id);
                if let Some(existing) = self.devices.get(id) {
                    device.created_at = existing.created_at;
                }
                self.devices.rows.insert(id, device.clone());
                Ok((device, false))
            }
            Entry::Vacant(slot) => {
                let stored = self.devices.insert(device);
                slot.insert(stored.id.0);
                Ok((stored, true))
            }
        }
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, CoreError> {
        Ok(self.devices.get(id.0))
    }

    async fn find_device_by_mac(&self, mac: &MacAddress) -> Result<Option<Device>, CoreError> {
        let Some(id) = self.devices_by_mac.get(mac).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.devices.get(id))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, CoreError> {
        Ok(self.devices.all())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<bool, CoreError> {
        match self.devices.remove(id.0) {
            Some(device) => {
                self.devices_by_mac.remove(&device.mac);
                self.config_records.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Templates ────────────────────────────────────────────────────

    async fn insert_template(&self, template: ConfigTemplate) -> Result<ConfigTemplate, CoreError> {
        match self.templates_by_name.entry(template.name.clone()) {
            Entry::Occupied(_) => Err(duplicate("template", &template.name)),
            Entry::Vacant(slot) => {
                let stored = self.templates.insert(template);
                slot.insert(stored.id.0);
                Ok(stored)
            }
        }
    }

    async fn update_template(&self, template: ConfigTemplate) -> Result<ConfigTemplate, CoreError> {
        let existing = self
            .templates
            .get(template.id.0)
            .ok_or_else(|| CoreError::not_found("template", template.id))?;
        if existing.name != template.name {
            match self.templates_by_name.entry(template.name.clone()) {
                Entry::Occupied(_) => return Err(duplicate("template", &template.name)),
                Entry::Vacant(slot) => {
                    slot.insert(template.id.0);
                }
            }
            self.templates_by_name.remove(&existing.name);
        }
        self.templates.update(template)
    }

    async fn get_template(&self, id: TemplateId) -> Result<Option<ConfigTemplate>, CoreError> {
        Ok(self.templates.get(id.0))
    }

    async fn list_templates(&self) -> Result<Vec<ConfigTemplate>, CoreError> {
        Ok(self.templates.all())
    }

    async fn delete_template(&self, id: TemplateId) -> Result<bool, CoreError> {
        match self.templates.remove(id.0) {
            Some(template) => {
                self.templates_by_name.remove(&template.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ── Stored configuration ─────────────────────────────────────────

    async fn get_config_record(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<DeviceConfigRecord>, CoreError> {
        Ok(self.config_records.get(&device_id).map(|r| r.value().clone()))
    }

    async fn put_config_record(&self, record: DeviceConfigRecord) -> Result<(), CoreError> {
        self.config_records.insert(record.device_id, record);
        Ok(())
    }

    async fn insert_config_history(&self, entry: ConfigHistory) -> Result<ConfigHistory, CoreError> {
        Ok(self.config_history.insert(entry))
    }

    async fn list_config_history(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<ConfigHistory>, CoreError> {
        Ok(self.config_history.filter(|h| h.device_id == device_id))
    }

    // ── Drift scheduling ─────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: DriftSchedule) -> Result<DriftSchedule, CoreError> {
        Ok(self.schedules.insert(schedule))
    }

    async fn update_schedule(&self, schedule: DriftSchedule) -> Result<DriftSchedule, CoreError> {
        self.schedules.update(schedule)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<DriftSchedule>, CoreError> {
        Ok(self.schedules.get(id.0))
    }

    async fn list_schedules(&self) -> Result<Vec<DriftSchedule>, CoreError> {
        Ok(self.schedules.all())
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, CoreError> {
        Ok(self.schedules.remove(id.0).is_some())
    }

    async fn insert_run(&self, run: DriftRun) -> Result<DriftRun, CoreError> {
        Ok(self.runs.insert(run))
    }

    async fn get_run(&self, id: RunId) -> Result<Option<DriftRun>, CoreError> {
        Ok(self.runs.get(id.0))
    }

    async fn list_runs(&self, schedule_id: Option<ScheduleId>) -> Result<Vec<DriftRun>, CoreError> {
        Ok(self
            .runs
            .filter(|r| schedule_id.is_none_or(|s| r.schedule_id == Some(s))))
    }

    async fn insert_report(
        &self,
        report: DriftReportRecord,
    ) -> Result<DriftReportRecord, CoreError> {
        Ok(self.reports.insert(report))
    }

    async fn list_reports(&self, query: ReportQuery) -> Result<Vec<DriftReportRecord>, CoreError> {
        Ok(self.reports.filter(|r| query.matches(r)))
    }

    // ── Trends ───────────────────────────────────────────────────────

    async fn insert_trend(&self, trend: DriftTrend) -> Result<DriftTrend, CoreError> {
        Ok(self.trends.insert(trend))
    }

    async fn update_trend(&self, trend: DriftTrend) -> Result<DriftTrend, CoreError> {
        self.trends.update(trend)
    }

    async fn get_trend(&self, id: TrendId) -> Result<Option<DriftTrend>, CoreError> {
        Ok(self.trends.get(id.0))
    }

    async fn find_open_trend(
        &self,
        device_id: DeviceId,
        path: &str,
    ) -> Result<Option<DriftTrend>, CoreError> {
        Ok(self
            .trends
            .filter(|t| t.device_id == device_id && t.path == path && !t.resolved)
            .into_iter()
            .next())
    }

    async fn list_trends(&self, query: TrendQuery) -> Result<Vec<DriftTrend>, CoreError> {
        Ok(self.trends.filter(|t| query.matches(t)))
    }

    // ── Resolution ───────────────────────────────────────────────────

    async fn insert_policy(
        &self,
        policy: ResolutionPolicy,
    ) -> Result<ResolutionPolicy, CoreError> {
        Ok(self.policies.insert(policy))
    }

    async fn update_policy(
        &self,
        policy: ResolutionPolicy,
    ) -> Result<ResolutionPolicy, CoreError> {
        self.policies.update(policy)
    }

    async fn get_policy(&self, id: PolicyId) -> Result<Option<ResolutionPolicy>, CoreError> {
        Ok(self.policies.get(id.0))
    }

    async fn list_policies(&self) -> Result<Vec<ResolutionPolicy>, CoreError> {
        Ok(self.policies.all())
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<bool, CoreError> {
        Ok(self.policies.remove(id.0).is_some())
    }

    async fn insert_request(
        &self,
        request: ResolutionRequest,
    ) -> Result<ResolutionRequest, CoreError> {
        Ok(self.requests.insert(request))
    }

    async fn update_request(
        &self,
        request: ResolutionRequest,
    ) -> Result<ResolutionRequest, CoreError> {
        self.requests.update(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<ResolutionRequest>, CoreError> {
        Ok(self.requests.get(id.0))
    }

    async fn list_requests(&self) -> Result<Vec<ResolutionRequest>, CoreError> {
        Ok(self.requests.all())
    }

    async fn insert_resolution_history(
        &self,
        entry: ResolutionHistory,
    ) -> Result<ResolutionHistory, CoreError> {
        Ok(self.resolution_history.insert(entry))
    }

    async fn list_resolution_history(
        &self,
        request_id: Option<RequestId>,
    ) -> Result<Vec<ResolutionHistory>, CoreError> {
        Ok(self
            .resolution_history
            .filter(|h| request_id.is_none_or(|r| h.request_id == r)))
    }
}
