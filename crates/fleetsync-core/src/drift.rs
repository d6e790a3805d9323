// ── Drift detection ──
//
// Compares the desired configuration with the device's live one, field
// by field over dotted paths. Bulk checks run device by device and never
// let one failure hide the others.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::configuration::fetch_live;
use crate::convert;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{BulkDriftReport, DeltaKind, DeviceId, DriftDelta, DriftOutcome, DriftReport};

const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Field-level differences between `desired` and `live`.
///
/// Nulls count as absent. Arrays compare as whole values. Deltas are
/// sorted by path.
pub fn diff(desired: &Value, live: &Value) -> Vec<DriftDelta> {
    let mut wanted = BTreeMap::new();
    flatten("", desired, &mut wanted);
    let mut actual = BTreeMap::new();
    flatten("", live, &mut actual);

    let mut deltas = Vec::new();
    for (path, want) in &wanted {
        match actual.get(path) {
            None => deltas.push(DriftDelta {
                path: path.clone(),
                kind: DeltaKind::Missing,
                desired: Some((*want).clone()),
                live: None,
            }),
            Some(have) if !values_equal(want, have) => deltas.push(DriftDelta {
                path: path.clone(),
                kind: DeltaKind::Changed,
                desired: Some((*want).clone()),
                live: Some((*have).clone()),
            }),
            Some(_) => {}
        }
    }
    for (path, have) in &actual {
        if !wanted.contains_key(path) {
            deltas.push(DriftDelta {
                path: path.clone(),
                kind: DeltaKind::Extra,
                desired: None,
                live: Some((*have).clone()),
            });
        }
    }
    deltas.sort_by(|a, b| a.path.cmp(&b.path));
    deltas
}

fn flatten<'a>(prefix: &str, value: &'a Value, out: &mut BTreeMap<String, &'a Value>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_owned(), leaf);
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= NUMERIC_TOLERANCE,
        _ => a == b,
    }
}

impl Engine {
    /// Check one device against its desired configuration.
    pub async fn detect_drift(&self, id: DeviceId) -> Result<DriftReport, CoreError> {
        let device = self.get_device(id).await?;
        let desired = self.desired_configuration(id).await?;
        let timeout = self.config().timeouts.fetch;
        let (generation, live) = self
            .on_device(id, "detect_drift", timeout, |client, ctx| async move {
                let generation = client.generation();
                fetch_live(client, ctx).await.map(|live| (generation, live))
            })
            .await?;

        // Compare only what the device can report back.
        let wanted = convert::observable(generation, &desired.config);
        let deltas = diff(&wanted.to_value(), &live.to_value());
        let in_sync = deltas.iter().all(|d| d.kind == DeltaKind::Extra);
        debug!(
            device = %device.label(),
            in_sync,
            deltas = deltas.len(),
            "drift check finished"
        );
        Ok(DriftReport {
            device_id: id,
            device_name: device.name,
            deltas,
            checked_at: Utc::now(),
            in_sync,
        })
    }

    /// Check several devices one after another; an empty selection
    /// means every device. Per-device failures become error entries.
    ///
    /// Fails only when the selection itself cannot be read.
    pub async fn detect_drift_bulk(&self, ids: &[DeviceId]) -> Result<BulkDriftReport, CoreError> {
        let selection: Vec<DeviceId> = if ids.is_empty() {
            self.list_devices().await?.iter().map(|d| d.id).collect()
        } else {
            ids.to_vec()
        };

        let mut bulk = BulkDriftReport::default();
        for id in selection {
            let outcome = match self.detect_drift(id).await {
                Ok(report) => DriftOutcome::Report(report),
                Err(e) => {
                    let device_name = match self.inner.store.get_device(id).await {
                        Ok(Some(device)) => device.name,
                        _ => String::new(),
                    };
                    warn!(device = %id, error = %e, "drift check failed");
                    DriftOutcome::Error {
                        device_id: id,
                        device_name,
                        kind: e.kind(),
                        message: e.to_string(),
                    }
                }
            };
            bulk.push(outcome);
        }
        Ok(bulk)
    }
}
