// Shared transport configuration for building reqwest::Client instances.
//
// Gen1 and Gen2 clients share timeout and user-agent settings through
// this module, avoiding duplicated builder logic. Devices speak plain
// HTTP on the local network, so there is no TLS knob here.

use std::time::Duration;

use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("fleetsync/", env!("CARGO_PKG_VERSION"));

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hard ceiling for a single HTTP exchange. Per-call budgets come from
    /// [`CallContext`](crate::CallContext) and are usually tighter.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(Error::Transport)
    }
}

/// Turn a device network address into a base URL.
///
/// Accepts bare hosts (`192.168.1.20`), host:port pairs, and full URLs.
/// The result always ends in `/` so relative joins behave.
pub fn device_base_url(address: &str) -> Result<Url, Error> {
    let trimmed = address.trim().trim_end_matches('/');
    let raw = if trimmed.contains("://") {
        format!("{trimmed}/")
    } else {
        format!("http://{trimmed}/")
    };
    Ok(Url::parse(&raw)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_http_scheme() {
        let url = device_base_url("192.168.1.20").unwrap();
        assert_eq!(url.as_str(), "http://192.168.1.20/");
    }

    #[test]
    fn host_port_is_preserved() {
        let url = device_base_url("10.0.0.5:8080").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/");
    }

    #[test]
    fn full_url_is_normalized() {
        let url = device_base_url("http://127.0.0.1:1234/").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:1234/");
    }
}
