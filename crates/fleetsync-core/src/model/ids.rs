// ── Identity types ──
//
// Record ids are store-assigned integers wrapped in one newtype per
// record kind so they cannot be mixed up. `MacAddress` is the physical
// identity of a device and survives address changes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

record_id!(
    /// Inventory record id of a device.
    DeviceId
);
record_id!(TemplateId);
record_id!(ConfigHistoryId);
record_id!(ScheduleId);
record_id!(RunId);
record_id!(ReportId);
record_id!(TrendId);
record_id!(PolicyId);
record_id!(RequestId);
record_id!(ResolutionHistoryId);

// ── MacAddress ──────────────────────────────────────────────────────

/// Hardware address, normalized to lowercase colon-separated format
/// (`aa:bb:cc:dd:ee:ff`).
///
/// Devices report bare hex (`A4CF12F45B6E`); controllers and users tend
/// to type colon or dash forms. All of them normalize to the same value.
/// Input that is not a 48-bit address is kept lowercased as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn new(raw: impl AsRef<str>) -> Self {
        let lowered = raw.as_ref().trim().to_lowercase();
        let hex: String = lowered
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let pairs: Vec<&str> = (0..6).filter_map(|i| hex.get(i * 2..i * 2 + 2)).collect();
            Self(pairs.join(":"))
        } else {
            Self(lowered.replace('-', ":"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last three octets without separators, used in generated names.
    pub fn suffix(&self) -> String {
        let hex: String = self.0.chars().filter(|c| *c != ':').collect();
        let start = hex.len().saturating_sub(6);
        hex.get(start..).unwrap_or_default().to_owned()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MacAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}
