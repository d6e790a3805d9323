// ── Drift resolution policies and requests ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DeviceId, PolicyId, RequestId, ResolutionHistoryId};

/// Rule deciding how drift on matching fields gets resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPolicy {
    pub id: PolicyId,
    pub name: String,
    pub enabled: bool,
    /// Apply matching requests immediately (unless approval is required).
    pub auto_apply: bool,
    pub requires_approval: bool,
    /// Dotted path prefixes this policy covers; empty covers everything.
    pub field_prefixes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResolutionPolicy {
    /// Whether every path in `fields` falls under one of our prefixes.
    pub fn covers(&self, fields: &[String]) -> bool {
        if self.field_prefixes.is_empty() {
            return true;
        }
        fields.iter().all(|field| {
            self.field_prefixes.iter().any(|prefix| {
                field == prefix
                    || field
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            })
        })
    }
}

/// Input for creating or replacing a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,
    pub enabled: bool,
    pub auto_apply: bool,
    pub requires_approval: bool,
    pub field_prefixes: Vec<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum ResolutionStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Failed,
}

/// Request to push desired values for drifting fields to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub id: RequestId,
    pub device_id: DeviceId,
    pub fields: Vec<String>,
    pub status: ResolutionStatus,
    pub policy_id: Option<PolicyId>,
    /// Why the request was rejected or failed.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome log of resolution attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionHistory {
    pub id: ResolutionHistoryId,
    pub request_id: RequestId,
    pub device_id: DeviceId,
    pub outcome: ResolutionStatus,
    pub applied_groups: Vec<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Aggregate view over requests and trends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionMetrics {
    pub total_requests: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub applied: usize,
    pub failed: usize,
    pub open_trends: usize,
    pub resolved_trends: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(prefixes: &[&str]) -> ResolutionPolicy {
        ResolutionPolicy {
            id: PolicyId(1),
            name: "p".into(),
            enabled: true,
            auto_apply: false,
            requires_approval: false,
            field_prefixes: prefixes.iter().map(|p| (*p).to_owned()).collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn prefixes_match_on_segment_boundaries() {
        let p = policy(&["relay", "led.status_disabled"]);
        assert!(p.covers(&["relay.default_state".into()]));
        assert!(p.covers(&["led.status_disabled".into()]));
        assert!(!p.covers(&["relay_extra.x".into()]));
        assert!(!p.covers(&["relay.name".into(), "roller.swap_inputs".into()]));
    }

    #[test]
    fn empty_prefix_list_covers_everything() {
        assert!(policy(&[]).covers(&["color.red".into()]));
    }
}
