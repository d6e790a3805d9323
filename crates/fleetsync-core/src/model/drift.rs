// ── Drift reports, schedules and trends ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{DeviceId, ReportId, RunId, ScheduleId, TrendId};
use crate::error::ErrorKind;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeltaKind {
    /// Desired sets the field, the device does not report it.
    Missing,
    /// Both sides set the field to different values.
    Changed,
    /// Only the device reports the field. Informational.
    Extra,
}

/// One field-level difference between desired and live configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftDelta {
    /// Dotted field path, e.g. `relay.default_state`.
    pub path: String,
    pub kind: DeltaKind,
    pub desired: Option<Value>,
    pub live: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub device_id: DeviceId,
    pub device_name: String,
    pub deltas: Vec<DriftDelta>,
    pub checked_at: DateTime<Utc>,
    /// True iff no delta is `missing` or `changed`.
    pub in_sync: bool,
}

impl DriftReport {
    /// Deltas that count as drift (`missing` and `changed`).
    pub fn drifted_fields(&self) -> impl Iterator<Item = &DriftDelta> {
        self.deltas.iter().filter(|d| d.kind != DeltaKind::Extra)
    }
}

/// Per-device outcome inside a bulk check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriftOutcome {
    Report(DriftReport),
    Error {
        device_id: DeviceId,
        device_name: String,
        kind: ErrorKind,
        message: String,
    },
}

impl DriftOutcome {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Self::Report(report) => report.device_id,
            Self::Error { device_id, .. } => *device_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDriftReport {
    pub total: usize,
    pub in_sync: usize,
    pub drifted: usize,
    pub errors: usize,
    pub entries: Vec<DriftOutcome>,
}

impl BulkDriftReport {
    pub(crate) fn push(&mut self, outcome: DriftOutcome) {
        self.total += 1;
        match &outcome {
            DriftOutcome::Report(report) if report.in_sync => self.in_sync += 1,
            DriftOutcome::Report(_) => self.drifted += 1,
            DriftOutcome::Error { .. } => self.errors += 1,
        }
        self.entries.push(outcome);
    }
}

// ── Scheduling ──────────────────────────────────────────────────────

/// A recurring drift check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSchedule {
    pub id: ScheduleId,
    pub name: String,
    /// Devices to check; empty means every device.
    pub device_ids: Vec<DeviceId>,
    pub interval_secs: u64,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or replacing a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDraft {
    pub name: String,
    #[serde(default)]
    pub device_ids: Vec<DeviceId>,
    pub interval_secs: u64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// One invocation of a drift check, scheduled or ad hoc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftRun {
    pub id: RunId,
    pub schedule_id: Option<ScheduleId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub in_sync: usize,
    pub drifted: usize,
    pub errors: usize,
}

/// Stored per-device result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReportRecord {
    pub id: ReportId,
    pub run_id: RunId,
    pub schedule_id: Option<ScheduleId>,
    pub device_id: DeviceId,
    pub in_sync: bool,
    pub deltas: Vec<DriftDelta>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Longitudinal record of one drifting field on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftTrend {
    pub id: TrendId,
    pub device_id: DeviceId,
    pub path: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u32,
    pub last_kind: DeltaKind,
    pub last_desired: Option<Value>,
    pub last_live: Option<Value>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Filter for report queries. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportQuery {
    pub device_id: Option<DeviceId>,
    pub run_id: Option<RunId>,
    pub schedule_id: Option<ScheduleId>,
}

impl ReportQuery {
    pub fn matches(&self, record: &DriftReportRecord) -> bool {
        self.device_id.is_none_or(|d| d == record.device_id)
            && self.run_id.is_none_or(|r| r == record.run_id)
            && self.schedule_id.is_none_or(|s| record.schedule_id == Some(s))
    }
}

/// Filter for trend queries. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrendQuery {
    pub device_id: Option<DeviceId>,
    pub resolved: Option<bool>,
}

impl TrendQuery {
    pub fn matches(&self, trend: &DriftTrend) -> bool {
        self.device_id.is_none_or(|d| d == trend.device_id)
            && self.resolved.is_none_or(|r| r == trend.resolved)
    }
}
