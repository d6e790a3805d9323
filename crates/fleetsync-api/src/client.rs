// ── Uniform device client surface ──
//
// Both generations implement `DeviceClient`. Payloads that differ by
// generation (status, full configuration) are returned as raw JSON and
// normalized by `fleetsync-core`; writes go through the generation-
// neutral `SettingsWrite`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::Generation;
use crate::context::CallContext;
use crate::error::Error;

/// Identity reported by a device (`/shelly`, `Shelly.GetDeviceInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Hardware address as reported (not yet normalized).
    pub mac: String,
    /// Hardware model code (e.g. `SHSW-1`, `SNSW-001X16EU`).
    pub model: String,
    /// Declared device type (Gen1 `type`, Gen2 `app`).
    pub device_type: String,
    pub generation: Generation,
    pub firmware: Option<String>,
    /// User-assigned name stored on the device, if any.
    pub name: Option<String>,
    pub auth_enabled: bool,
}

impl DeviceInfo {
    /// Parse either generation's identify payload.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let obj = value.as_object().ok_or_else(|| Error::Deserialization {
            message: "identify payload is not an object".into(),
            body: value.to_string(),
        })?;
        let str_field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_owned);

        let mac = str_field("mac").ok_or_else(|| Error::Deserialization {
            message: "identify payload has no `mac`".into(),
            body: value.to_string(),
        })?;
        let generation = Generation::from_number(obj.get("gen").and_then(Value::as_u64));

        let info = match generation {
            Generation::Gen1 => {
                let device_type = str_field("type").unwrap_or_default();
                Self {
                    mac,
                    model: device_type.clone(),
                    device_type,
                    generation,
                    firmware: str_field("fw"),
                    name: str_field("name"),
                    auth_enabled: obj.get("auth").and_then(Value::as_bool).unwrap_or(false),
                }
            }
            Generation::Gen2 => {
                let model = str_field("model").unwrap_or_default();
                Self {
                    device_type: str_field("app").unwrap_or_else(|| model.clone()),
                    model,
                    mac,
                    generation,
                    firmware: str_field("ver").or_else(|| str_field("fw_id")),
                    name: str_field("name"),
                    auth_enabled: obj.get("auth_en").and_then(Value::as_bool).unwrap_or(false),
                }
            }
        };
        Ok(info)
    }
}

/// Addressable component on a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Relay,
    Light,
    Roller,
    Input,
    Color,
    /// Device-wide settings (Gen1 `/settings`, Gen2 `Sys`).
    Device,
    /// Front-panel UI settings (Gen2 `PLUGS_UI`; Gen1 folds these into `Device`).
    Ui,
}

/// Motion command for a roller/cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollerCommand {
    Open,
    Close,
    Stop,
    /// Go to a position in percent (0 = closed, 100 = open).
    Position(u8),
}

/// Desired live state for `set_component_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentValue {
    /// Switch the output on or off.
    Power(bool),
    /// Turn on at the given brightness (0-100).
    Brightness(u8),
    Roller(RollerCommand),
}

/// One generation-neutral configuration write.
///
/// `fields` already uses the target generation's key names; the client
/// only decides how to transport them.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsWrite {
    pub component: Component,
    pub channel: u8,
    pub fields: Map<String, Value>,
}

/// Result of a settings write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsOutcome {
    /// Device reports the change only takes effect after a reboot.
    pub restart_required: bool,
}

/// Capability interface shared by every device generation.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn generation(&self) -> Generation;

    /// Network address this client targets.
    fn address(&self) -> &str;

    async fn get_info(&self, ctx: &CallContext) -> Result<DeviceInfo, Error>;

    async fn get_status(&self, ctx: &CallContext) -> Result<Value, Error>;

    /// Full generation-specific configuration document.
    async fn get_full_configuration(&self, ctx: &CallContext) -> Result<Value, Error>;

    async fn set_component_state(
        &self,
        ctx: &CallContext,
        component: Component,
        channel: u8,
        value: ComponentValue,
    ) -> Result<(), Error>;

    async fn apply_settings(
        &self,
        ctx: &CallContext,
        write: &SettingsWrite,
    ) -> Result<SettingsOutcome, Error>;

    async fn reboot(&self, ctx: &CallContext) -> Result<(), Error>;

    /// Authenticated round-trip proving reachability and credentials.
    async fn test_connection(&self, ctx: &CallContext) -> Result<(), Error>;
}
