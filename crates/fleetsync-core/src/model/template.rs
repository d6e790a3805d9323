// ── Templates and stored configuration records ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ConfigHistoryId, DeviceId, TemplateId};

/// Where a template is meant to apply. Informational: templates are only
/// ever applied to a device explicitly.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TemplateScope {
    #[default]
    Global,
    Group,
    DeviceType,
}

/// Named, reusable partial configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: TemplateId,
    pub name: String,
    pub description: Option<String>,
    pub scope: TemplateScope,
    /// Group name or device type the scope refers to.
    pub scope_key: Option<String>,
    /// Partial configuration in canonical shape.
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or replacing a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub description: Option<String>,
    pub scope: TemplateScope,
    pub scope_key: Option<String>,
    pub config: Value,
}

// ── Stored device configuration ─────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfigSource {
    /// Read back from the device.
    Imported,
    /// Written to the device by us.
    Pushed,
}

/// What produced a configuration history entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfigAction {
    Imported,
    Pushed,
    Applied,
    CapabilityUpdated,
    ResolutionApplied,
}

/// Last imported or pushed canonical configuration of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfigRecord {
    pub device_id: DeviceId,
    /// Starts at 1, bumped on every write.
    pub version: u32,
    pub source: ConfigSource,
    pub config: Value,
    pub updated_at: DateTime<Utc>,
}

/// Audit entry for a configuration record change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigHistory {
    pub id: ConfigHistoryId,
    pub device_id: DeviceId,
    pub version: u32,
    pub previous: Option<Value>,
    pub config: Value,
    pub action: ConfigAction,
    pub changed_by: String,
    pub at: DateTime<Utc>,
}
