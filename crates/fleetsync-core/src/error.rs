// ── Core error types ──
//
// Domain errors from fleetsync-core. Callers branch on `kind()`, never
// on transport details. The `From<fleetsync_api::Error>` impl maps the
// API crate's classification onto domain variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetsync_api::ErrorClass;

/// Coarse error classification callers are allowed to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    Protocol,
    Validation,
    NotFound,
    Store,
    Config,
    Cancelled,
    Internal,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device errors ────────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Device unreachable: {message}")]
    Network { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    /// Single-device failure carrying the device it happened on.
    #[error("{device}: {source}")]
    Device {
        device: String,
        #[source]
        source: Box<CoreError>,
    },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("Record store error: {message}")]
    Store { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication { .. } => ErrorKind::Auth,
            Self::Network { .. } => ErrorKind::Network,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Device { source, .. } => source.kind(),
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Store { .. } => ErrorKind::Store,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    pub fn is_network(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Attach device context, unless already attached.
    pub fn for_device(self, device: impl Into<String>) -> Self {
        match self {
            already @ Self::Device { .. } => already,
            other => Self::Device {
                device: device.into(),
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(entity_type: &str, identifier: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_owned(),
            identifier: identifier.to_string(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<fleetsync_api::Error> for CoreError {
    fn from(err: fleetsync_api::Error) -> Self {
        if matches!(err, fleetsync_api::Error::Cancelled) {
            return CoreError::Cancelled;
        }
        let message = err.to_string();
        match err.class() {
            ErrorClass::Auth => CoreError::Authentication { message },
            ErrorClass::Network => CoreError::Network { message },
            ErrorClass::Protocol => CoreError::Protocol { message },
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Validation {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_keep_their_class() {
        let auth: CoreError = fleetsync_api::Error::Authentication {
            message: "nope".into(),
        }
        .into();
        assert_eq!(auth.kind(), ErrorKind::Auth);

        let timeout: CoreError = fleetsync_api::Error::Timeout { timeout_ms: 5000 }.into();
        assert_eq!(timeout.kind(), ErrorKind::Network);

        let rpc: CoreError = fleetsync_api::Error::Rpc {
            code: -103,
            message: "bad".into(),
        }
        .into();
        assert_eq!(rpc.kind(), ErrorKind::Protocol);

        let cancelled: CoreError = fleetsync_api::Error::Cancelled.into();
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn device_context_wraps_once() {
        let err = CoreError::Network {
            message: "refused".into(),
        }
        .for_device("kitchen")
        .for_device("other");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.to_string(), "kitchen: Device unreachable: refused");
    }
}
