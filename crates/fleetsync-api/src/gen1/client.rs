// Gen1 REST HTTP client
//
// Wraps `reqwest::Client` with Gen1 URL construction and HTTP Basic auth.
// Credentials ride on every request; there is no session. All endpoints
// are GETs with query-string parameters.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::{Credentials, Generation};
use crate::client::{
    Component, ComponentValue, DeviceClient, DeviceInfo, RollerCommand, SettingsOutcome,
    SettingsWrite,
};
use crate::context::CallContext;
use crate::error::{Error, floor_char_boundary};
use crate::transport::{TransportConfig, device_base_url};

/// Raw HTTP client for a Gen1 device.
pub struct Gen1Client {
    http: reqwest::Client,
    base_url: Url,
    address: String,
    credentials: Option<Credentials>,
}

impl Gen1Client {
    /// Create a client for `address` from a `TransportConfig`.
    pub fn new(
        address: &str,
        credentials: Option<Credentials>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Self::with_client(http, address, credentials)
    }

    /// Create a client around a pre-built `reqwest::Client`.
    pub fn with_client(
        http: reqwest::Client,
        address: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, Error> {
        Ok(Self {
            http,
            base_url: device_base_url(address)?,
            address: address.to_owned(),
            credentials,
        })
    }

    /// The device base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Send an authenticated GET and decode the JSON body.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T, Error> {
        let url = self.base_url.join(path)?;
        debug!(address = %self.address, "GET {}", url);

        let mut builder = self.http.get(url).query(query);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }
        let resp = builder.send().await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: if self.credentials.is_some() {
                    "device rejected basic credentials".into()
                } else {
                    "device requires authentication".into()
                },
            });
        }

        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: body[..floor_char_boundary(&body, 200)].to_owned(),
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::decode(&e, &body))
    }

    fn settings_path(component: Component, channel: u8) -> String {
        match component {
            Component::Relay => format!("settings/relay/{channel}"),
            Component::Light | Component::Color => format!("settings/light/{channel}"),
            Component::Roller => format!("settings/roller/{channel}"),
            Component::Input => format!("settings/input/{channel}"),
            Component::Device | Component::Ui => "settings".to_owned(),
        }
    }
}

/// Render a JSON scalar as a Gen1 query-string value.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn control_query(
    component: Component,
    channel: u8,
    value: ComponentValue,
) -> Result<(String, Vec<(String, String)>), Error> {
    let on_off = |on: bool| if on { "on" } else { "off" }.to_owned();
    match (component, value) {
        (Component::Relay, ComponentValue::Power(on)) => Ok((
            format!("relay/{channel}"),
            vec![("turn".into(), on_off(on))],
        )),
        (Component::Light | Component::Color, ComponentValue::Power(on)) => Ok((
            format!("light/{channel}"),
            vec![("turn".into(), on_off(on))],
        )),
        (Component::Light | Component::Color, ComponentValue::Brightness(b)) => Ok((
            format!("light/{channel}"),
            vec![
                ("turn".into(), "on".into()),
                ("brightness".into(), b.min(100).to_string()),
            ],
        )),
        (Component::Roller, ComponentValue::Roller(cmd)) => {
            let query = match cmd {
                RollerCommand::Open => vec![("go".into(), "open".into())],
                RollerCommand::Close => vec![("go".into(), "close".into())],
                RollerCommand::Stop => vec![("go".into(), "stop".into())],
                RollerCommand::Position(pos) => vec![
                    ("go".into(), "to_pos".into()),
                    ("roller_pos".into(), pos.min(100).to_string()),
                ],
            };
            Ok((format!("roller/{channel}"), query))
        }
        _ => Err(Error::UnsupportedOperation(
            "component/value combination not supported on Gen1",
        )),
    }
}

#[async_trait]
impl DeviceClient for Gen1Client {
    fn generation(&self) -> Generation {
        Generation::Gen1
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn get_info(&self, ctx: &CallContext) -> Result<DeviceInfo, Error> {
        let raw: Value = ctx.run(self.get("shelly", &[])).await?;
        DeviceInfo::from_value(&raw)
    }

    async fn get_status(&self, ctx: &CallContext) -> Result<Value, Error> {
        ctx.run(self.get("status", &[])).await
    }

    async fn get_full_configuration(&self, ctx: &CallContext) -> Result<Value, Error> {
        ctx.run(self.get("settings", &[])).await
    }

    async fn set_component_state(
        &self,
        ctx: &CallContext,
        component: Component,
        channel: u8,
        value: ComponentValue,
    ) -> Result<(), Error> {
        let (path, query) = control_query(component, channel, value)?;
        let _: Value = ctx.run(self.get(&path, &query)).await?;
        Ok(())
    }

    async fn apply_settings(
        &self,
        ctx: &CallContext,
        write: &SettingsWrite,
    ) -> Result<SettingsOutcome, Error> {
        if write.fields.is_empty() {
            return Ok(SettingsOutcome::default());
        }
        let path = Self::settings_path(write.component, write.channel);
        let query: Vec<(String, String)> = write
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), query_value(v)))
            .collect();
        let _: Value = ctx.run(self.get(&path, &query)).await?;
        // Gen1 applies settings live; none of the supported keys need a reboot.
        Ok(SettingsOutcome::default())
    }

    async fn reboot(&self, ctx: &CallContext) -> Result<(), Error> {
        let _: Value = ctx.run(self.get("reboot", &[])).await?;
        Ok(())
    }

    async fn test_connection(&self, ctx: &CallContext) -> Result<(), Error> {
        // `/shelly` is unauthenticated; `/status` proves the credentials too.
        let _: Value = ctx.run(self.get("status", &[])).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn relay_control_query() {
        let (path, query) =
            control_query(Component::Relay, 1, ComponentValue::Power(true)).unwrap();
        assert_eq!(path, "relay/1");
        assert_eq!(query, vec![("turn".to_owned(), "on".to_owned())]);
    }

    #[test]
    fn roller_position_is_clamped() {
        let (path, query) = control_query(
            Component::Roller,
            0,
            ComponentValue::Roller(RollerCommand::Position(150)),
        )
        .unwrap();
        assert_eq!(path, "roller/0");
        assert!(query.contains(&("roller_pos".to_owned(), "100".to_owned())));
    }

    #[test]
    fn relay_brightness_is_unsupported() {
        let err = control_query(Component::Relay, 0, ComponentValue::Brightness(50)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation(_)));
    }

    #[test]
    fn query_values_render_scalars() {
        assert_eq!(query_value(&Value::Bool(true)), "true");
        assert_eq!(query_value(&serde_json::json!(30)), "30");
        assert_eq!(query_value(&serde_json::json!("off")), "off");
    }
}
