// Gen2 JSON-RPC frames
//
// Request: `{ "id": N, "src": "...", "method": "...", "params": {...} }`
// Response: `{ "id": N, "result": {...} }` or `{ "id": N, "error": { code, message } }`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::Component;
use crate::error::Error;

pub(crate) const RPC_SOURCE: &str = "fleetsync";

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    pub id: u64,
    pub src: &'a str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorFrame>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorFrame {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl RpcResponse {
    /// Unwrap the `result`, mapping an error frame into [`Error`].
    pub(crate) fn into_result(self) -> Result<Value, Error> {
        if let Some(err) = self.error {
            let message = err.message.unwrap_or_default();
            return Err(if err.code == 401 {
                Error::Authentication { message }
            } else {
                Error::Rpc {
                    code: err.code,
                    message,
                }
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// RPC namespace for a component (`Switch`, `Light`, `Cover`, ...).
pub(crate) fn namespace(component: Component) -> &'static str {
    match component {
        Component::Relay => "Switch",
        Component::Light => "Light",
        Component::Roller => "Cover",
        Component::Input => "Input",
        Component::Color => "RGB",
        Component::Device => "Sys",
        Component::Ui => "PLUGS_UI",
    }
}

/// Whether `<Namespace>.SetConfig` takes an `id` (per-channel components).
pub(crate) fn is_channelled(component: Component) -> bool {
    !matches!(component, Component::Device | Component::Ui)
}
