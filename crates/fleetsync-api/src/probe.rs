// Unauthenticated identify probe
//
// Both generations answer `GET /shelly` without credentials. The payload
// tells us the hardware address, model, generation, and whether auth is
// enabled, which is everything discovery needs to pick a client.

use serde_json::Value;
use tracing::trace;

use crate::client::DeviceInfo;
use crate::context::CallContext;
use crate::error::{Error, floor_char_boundary};
use crate::transport::device_base_url;

/// Probe `address` and parse its identity.
pub async fn identify(
    http: &reqwest::Client,
    address: &str,
    ctx: &CallContext,
) -> Result<DeviceInfo, Error> {
    let url = device_base_url(address)?.join("shelly")?;
    trace!("probing {}", url);

    ctx.run(async {
        let resp = http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: body[..floor_char_boundary(&body, 200)].to_owned(),
            });
        }
        let raw: Value = serde_json::from_str(&body).map_err(|e| Error::decode(&e, &body))?;
        DeviceInfo::from_value(&raw)
    })
    .await
}
