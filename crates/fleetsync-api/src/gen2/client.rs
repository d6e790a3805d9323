// Gen2 JSON-RPC HTTP client
//
// Every call is a `POST /rpc` carrying a JSON-RPC frame. Authentication
// is RFC 2617 Digest: the first request goes out bare, the 401 carries
// the challenge, and the request is resent with an `Authorization`
// header. The accepted challenge is kept for later calls with a
// running nonce counter. A stale-nonce rejection is retried exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use super::rpc::{RPC_SOURCE, RpcRequest, RpcResponse, is_channelled, namespace};
use crate::auth::{Credentials, Generation};
use crate::client::{
    Component, ComponentValue, DeviceClient, DeviceInfo, RollerCommand, SettingsOutcome,
    SettingsWrite,
};
use crate::context::CallContext;
use crate::digest::{DigestChallenge, new_cnonce};
use crate::error::{Error, floor_char_boundary};
use crate::transport::{TransportConfig, device_base_url};

/// Challenge currently in use plus its nonce counter.
struct DigestSession {
    challenge: DigestChallenge,
    nc: u32,
}

/// Raw HTTP client for a Gen2 (RPC) device.
pub struct Gen2Client {
    http: reqwest::Client,
    rpc_url: Url,
    address: String,
    credentials: Option<Credentials>,
    session: Mutex<Option<DigestSession>>,
    next_id: AtomicU64,
}

impl Gen2Client {
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
        let rpc_url = device_base_url(address)?.join("rpc")?;
        Ok(Self {
            http,
            rpc_url,
            address: address.to_owned(),
            credentials,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    // ── Digest session ───────────────────────────────────────────────

    /// Build the `Authorization` header for `challenge`, adopting it as the
    /// session challenge and bumping the nonce counter.
    fn authorize(&self, challenge: &DigestChallenge, creds: &Credentials) -> String {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let nc = match guard.as_mut() {
            Some(session) if session.challenge.nonce == challenge.nonce => {
                session.nc += 1;
                session.nc
            }
            _ => {
                *guard = Some(DigestSession {
                    challenge: challenge.clone(),
                    nc: 1,
                });
                1
            }
        };
        drop(guard);
        challenge.authorization(creds, "POST", self.rpc_url.path(), nc, &new_cnonce())
    }

    fn cached_challenge(&self) -> Option<DigestChallenge> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.challenge.clone())
    }

    fn clear_session(&self) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Execute one RPC method, handling the digest handshake.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            src: RPC_SOURCE,
            method,
            params: params.as_ref(),
        };
        debug!(address = %self.address, method, "POST {}", self.rpc_url);

        let mut challenge = self.cached_challenge();
        let mut from_cache = challenge.is_some();
        let mut stale_retry_used = false;

        loop {
            let authorization = match (&challenge, &self.credentials) {
                (Some(c), Some(creds)) => Some(self.authorize(c, creds)),
                _ => None,
            };

            let mut builder = self.http.post(self.rpc_url.clone()).json(&request);
            if let Some(value) = authorization {
                builder = builder.header(AUTHORIZATION, value);
            }
            let resp = builder.send().await?;

            if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
                return Self::parse_response(resp).await;
            }

            if self.credentials.is_none() {
                return Err(Error::Authentication {
                    message: "device requires authentication".into(),
                });
            }

            let header = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::Authentication {
                    message: "401 without a digest challenge".into(),
                })?;
            let fresh = DigestChallenge::parse(header)?;

            if challenge.is_none() || from_cache {
                // Bare request, or a cached nonce the device has forgotten.
                // A stale reply to a cached nonce spends the one stale retry.
                trace!(realm = %fresh.realm, stale = fresh.stale, "received digest challenge");
                stale_retry_used = from_cache && fresh.stale;
                from_cache = false;
                challenge = Some(fresh);
                continue;
            }

            if fresh.stale && !stale_retry_used {
                debug!(address = %self.address, "stale nonce, re-challenging once");
                stale_retry_used = true;
                challenge = Some(fresh);
                continue;
            }

            self.clear_session();
            return Err(Error::Authentication {
                message: "device rejected digest credentials".into(),
            });
        }
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value, Error> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            // Gen2 also reports RPC errors with non-2xx codes; prefer the frame.
            if let Ok(frame) = serde_json::from_str::<RpcResponse>(&body) {
                if frame.error.is_some() {
                    return frame.into_result();
                }
            }
            return Err(Error::Http {
                status: status.as_u16(),
                message: body[..floor_char_boundary(&body, 200)].to_owned(),
            });
        }

        let frame: RpcResponse = serde_json::from_str(&body).map_err(|e| Error::decode(&e, &body))?;
        frame.into_result()
    }
}

fn control_call(
    component: Component,
    channel: u8,
    value: ComponentValue,
) -> Result<(String, Value), Error> {
    let id = u64::from(channel);
    match (component, value) {
        (Component::Relay | Component::Light | Component::Color, ComponentValue::Power(on)) => Ok((
            format!("{}.Set", namespace(component)),
            json!({ "id": id, "on": on }),
        )),
        (Component::Light | Component::Color, ComponentValue::Brightness(b)) => Ok((
            format!("{}.Set", namespace(component)),
            json!({ "id": id, "on": true, "brightness": b.min(100) }),
        )),
        (Component::Roller, ComponentValue::Roller(cmd)) => Ok(match cmd {
            RollerCommand::Open => ("Cover.Open".into(), json!({ "id": id })),
            RollerCommand::Close => ("Cover.Close".into(), json!({ "id": id })),
            RollerCommand::Stop => ("Cover.Stop".into(), json!({ "id": id })),
            RollerCommand::Position(pos) => (
                "Cover.GoToPosition".into(),
                json!({ "id": id, "pos": pos.min(100) }),
            ),
        }),
        _ => Err(Error::UnsupportedOperation(
            "component/value combination not supported on Gen2",
        )),
    }
}

#[async_trait]
impl DeviceClient for Gen2Client {
    fn generation(&self) -> Generation {
        Generation::Gen2
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn get_info(&self, ctx: &CallContext) -> Result<DeviceInfo, Error> {
        let raw = ctx.run(self.call("Shelly.GetDeviceInfo", None)).await?;
        DeviceInfo::from_value(&raw)
    }

    async fn get_status(&self, ctx: &CallContext) -> Result<Value, Error> {
        ctx.run(self.call("Shelly.GetStatus", None)).await
    }

    async fn get_full_configuration(&self, ctx: &CallContext) -> Result<Value, Error> {
        ctx.run(self.call("Shelly.GetConfig", None)).await
    }

    async fn set_component_state(
        &self,
        ctx: &CallContext,
        component: Component,
        channel: u8,
        value: ComponentValue,
    ) -> Result<(), Error> {
        let (method, params) = control_call(component, channel, value)?;
        ctx.run(self.call(&method, Some(params))).await?;
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
        let method = format!("{}.SetConfig", namespace(write.component));
        let params = if is_channelled(write.component) {
            json!({ "id": write.channel, "config": write.fields })
        } else {
            json!({ "config": write.fields })
        };
        let result = ctx.run(self.call(&method, Some(params))).await?;
        Ok(SettingsOutcome {
            restart_required: result
                .get("restart_required")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    async fn reboot(&self, ctx: &CallContext) -> Result<(), Error> {
        ctx.run(self.call("Shelly.Reboot", None)).await?;
        Ok(())
    }

    async fn test_connection(&self, ctx: &CallContext) -> Result<(), Error> {
        ctx.run(self.call("Shelly.GetStatus", None)).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn switch_set_params() {
        let (method, params) =
            control_call(Component::Relay, 0, ComponentValue::Power(false)).unwrap();
        assert_eq!(method, "Switch.Set");
        assert_eq!(params, json!({"id": 0, "on": false}));
    }

    #[test]
    fn cover_position_params() {
        let (method, params) = control_call(
            Component::Roller,
            1,
            ComponentValue::Roller(RollerCommand::Position(40)),
        )
        .unwrap();
        assert_eq!(method, "Cover.GoToPosition");
        assert_eq!(params, json!({"id": 1, "pos": 40}));
    }

    #[test]
    fn input_control_is_unsupported() {
        assert!(control_call(Component::Input, 0, ComponentValue::Power(true)).is_err());
    }

    #[test]
    fn authorize_bumps_nonce_counter() {
        let client =
            Gen2Client::with_client(reqwest::Client::new(), "127.0.0.1", None).unwrap();
        let challenge = DigestChallenge::parse(
            r#"Digest realm="r", nonce="n1", qop="auth", algorithm=SHA-256"#,
        )
        .unwrap();
        let creds = Credentials::new("admin", "pw");
        assert!(client.authorize(&challenge, &creds).contains("nc=00000001"));
        assert!(client.authorize(&challenge, &creds).contains("nc=00000002"));
        client.clear_session();
        assert!(client.cached_challenge().is_none());
    }
}
