// ── Device inventory record ──
//
// A device is identified by its hardware address. The settings blob is
// stored loosely (unknown keys survive) and read through the typed
// `DeviceSettings` view.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use fleetsync_api::{Credentials, Generation};

use super::ids::{DeviceId, MacAddress, TemplateId};
use crate::error::CoreError;

/// Lifecycle status of a device.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    /// Added to the inventory but never seen by discovery.
    #[default]
    Unknown,
    Online,
    Offline,
}

/// A managed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub mac: MacAddress,
    pub name: String,
    /// Network address (host or host:port).
    pub address: String,
    /// Declared device type (`SHSW-25`, `Plus1PM`, ...).
    pub device_type: String,
    pub firmware: Option<String>,
    /// Loosely typed settings blob, read via [`DeviceSettings`].
    pub settings: Value,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    /// Templates applied to this device, in overlay order.
    pub template_ids: Vec<TemplateId>,
    /// Device-level override blob (canonical configuration shape).
    pub overrides: Value,
    /// Desired configuration as of the last successful apply.
    pub desired_snapshot: Option<Value>,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Typed view over the settings blob.
    pub fn settings_view(&self) -> Result<DeviceSettings, CoreError> {
        DeviceSettings::from_blob(&self.settings)
    }

    /// Label used in log lines and error context.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.mac)
    }
}

/// Fields supplied when adding a device by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDraft {
    pub name: String,
    pub address: String,
    pub mac: String,
    pub device_type: String,
    pub model: Option<String>,
    pub generation: Option<Generation>,
    pub firmware: Option<String>,
}

// ── Settings view ───────────────────────────────────────────────────

/// Credential pair saved on a device after it has been verified live.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub username: String,
    #[serde(serialize_with = "expose_secret", deserialize_with = "secret_from_string")]
    pub password: SecretString,
}

impl StoredCredential {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }

    pub fn to_credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn secret_from_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

/// Typed view of a device settings blob.
///
/// `model`, `generation` and `auth_enabled` are owned by discovery;
/// `credential` by the credential manager. Everything else is user data
/// kept in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<StoredCredential>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub(crate) const SETTINGS_MODEL: &str = "model";
pub(crate) const SETTINGS_GENERATION: &str = "generation";
pub(crate) const SETTINGS_AUTH_ENABLED: &str = "auth_enabled";
pub(crate) const SETTINGS_CREDENTIAL: &str = "credential";

impl DeviceSettings {
    /// Read and validate a settings blob. `null` reads as empty settings.
    pub fn from_blob(blob: &Value) -> Result<Self, CoreError> {
        match blob {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => serde_json::from_value(blob.clone())
                .map_err(|e| CoreError::validation(format!("invalid device settings: {e}"))),
            other => Err(CoreError::validation(format!(
                "device settings must be an object, got {}",
                json_type(other)
            ))),
        }
    }

    /// Saved credential as an API credential pair.
    pub fn credentials(&self) -> Option<Credentials> {
        self.credential.as_ref().map(StoredCredential::to_credentials)
    }
}

/// Replace (or clear) the saved credential in a settings blob, leaving
/// every other key untouched.
pub(crate) fn write_credential(
    blob: &mut Value,
    credentials: Option<&Credentials>,
) -> Result<(), CoreError> {
    if blob.is_null() {
        *blob = Value::Object(Map::new());
    }
    let Some(obj) = blob.as_object_mut() else {
        return Err(CoreError::validation(
            "device settings must be an object to store a credential",
        ));
    };
    match credentials {
        Some(creds) => {
            let stored = serde_json::to_value(StoredCredential::from_credentials(creds))?;
            obj.insert(SETTINGS_CREDENTIAL.to_owned(), stored);
        }
        None => {
            obj.remove(SETTINGS_CREDENTIAL);
        }
    }
    Ok(())
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn settings_view_keeps_unknown_keys() {
        let blob = json!({
            "model": "SHSW-1",
            "generation": "gen1",
            "auth_enabled": true,
            "credential": {"username": "admin", "password": "pw"},
            "room": "kitchen"
        });
        let view = DeviceSettings::from_blob(&blob).unwrap();
        assert_eq!(view.generation, Some(Generation::Gen1));
        assert_eq!(view.credentials().unwrap().username, "admin");
        assert_eq!(view.extra.get("room"), Some(&json!("kitchen")));
    }

    #[test]
    fn malformed_settings_rejected() {
        let err = DeviceSettings::from_blob(&json!(["nope"])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        let err = DeviceSettings::from_blob(&json!({"generation": "gen9"})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    #[test]
    fn credential_write_preserves_other_keys() {
        let mut blob = json!({"room": "hall"});
        write_credential(&mut blob, Some(&Credentials::new("admin", "pw"))).unwrap();
        assert_eq!(blob["credential"]["password"], "pw");
        assert_eq!(blob["room"], "hall");

        write_credential(&mut blob, None).unwrap();
        assert!(blob.get("credential").is_none());
        assert_eq!(blob["room"], "hall");
    }

    #[test]
    fn stored_credential_debug_is_redacted() {
        let stored = StoredCredential::from_credentials(&Credentials::new("admin", "hunter2"));
        assert!(!format!("{stored:?}").contains("hunter2"));
    }
}
