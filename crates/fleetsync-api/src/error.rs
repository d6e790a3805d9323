use thiserror::Error;

/// Coarse classification of an API failure.
///
/// Callers above the transport layer branch only on this, never on
/// the individual [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials rejected or missing. Recoverable via credential fallback.
    Auth,
    /// Timeout, connection refused, DNS failure, or cancellation.
    Network,
    /// Malformed or unexpected response from the device.
    Protocol,
}

/// Top-level error type for the `fleetsync-api` crate.
///
/// Covers every failure mode across both device generations:
/// authentication, transport, RPC, and payload decoding.
/// `fleetsync-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Device rejected the credentials (HTTP 401, RPC 401) or demanded
    /// credentials that were not supplied.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The `WWW-Authenticate` challenge could not be parsed.
    #[error("Invalid digest challenge: {0}")]
    InvalidChallenge(String),

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The call context deadline elapsed.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The call context was cancelled.
    #[error("Request cancelled")]
    Cancelled,

    // ── Device responses ────────────────────────────────────────────
    /// Non-success HTTP status other than 401.
    #[error("Device returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Error frame from a Gen2 RPC call.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Operation not supported by this generation or component.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

impl Error {
    /// Classify this error for callers that only care about the broad kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Authentication { .. } => ErrorClass::Auth,
            Self::Rpc { code, .. } if *code == 401 => ErrorClass::Auth,
            Self::Transport(e) => {
                if e.is_decode() || (e.is_body() && !e.is_timeout()) {
                    ErrorClass::Protocol
                } else {
                    ErrorClass::Network
                }
            }
            Self::Timeout { .. } | Self::Cancelled => ErrorClass::Network,
            Self::Http { status, .. } if matches!(status, 502..=504) => ErrorClass::Network,
            Self::InvalidChallenge(_)
            | Self::InvalidUrl(_)
            | Self::Http { .. }
            | Self::Rpc { .. }
            | Self::Deserialization { .. }
            | Self::UnsupportedOperation(_) => ErrorClass::Protocol,
        }
    }

    /// Returns `true` if this error should trigger credential recovery.
    pub fn is_auth(&self) -> bool {
        self.class() == ErrorClass::Auth
    }

    /// Returns `true` if this is a network-level failure.
    pub fn is_network(&self) -> bool {
        self.class() == ErrorClass::Network
    }

    /// Build a [`Error::Deserialization`] carrying a truncated body preview.
    pub(crate) fn decode(err: &serde_json::Error, body: &str) -> Self {
        let preview = &body[..floor_char_boundary(body, 200)];
        Self::Deserialization {
            message: format!("{err} (body preview: {preview:?})"),
            body: body.to_owned(),
        }
    }
}

/// Largest char boundary at or below `max` (stable stand-in for
/// `str::floor_char_boundary`).
pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_401_classifies_as_auth() {
        let err = Error::Rpc {
            code: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(err.class(), ErrorClass::Auth);
        assert!(err.is_auth());
    }

    #[test]
    fn gateway_errors_are_network() {
        let err = Error::Http {
            status: 503,
            message: String::new(),
        };
        assert!(err.is_network());
    }

    #[test]
    fn malformed_payload_is_protocol() {
        let err = Error::Deserialization {
            message: "expected value".into(),
            body: "<html>".into(),
        };
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn floor_char_boundary_respects_multibyte() {
        let s = "aé";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 10), s.len());
    }
}
