// ── Discovery ──
//
// Folds observed devices into the inventory without touching user-owned
// state, and scans IPv4 ranges for devices to observe. Reconciling the
// same observation twice issues no second write.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use fleetsync_api::{CallContext, DeviceInfo, Generation};

use crate::engine::{Engine, default_name};
use crate::error::CoreError;
use crate::model::device::{SETTINGS_AUTH_ENABLED, SETTINGS_GENERATION, SETTINGS_MODEL};
use crate::model::{Device, DeviceId, DeviceStatus, MacAddress};

/// A device as seen on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDevice {
    pub address: String,
    pub device_type: String,
    pub firmware: Option<String>,
    pub status: DeviceStatus,
    /// Hardware address as reported; may be empty.
    pub mac: String,
    pub discovered_at: DateTime<Utc>,
    pub model: Option<String>,
    pub generation: Option<Generation>,
    pub auth_enabled: Option<bool>,
}

impl ObservedDevice {
    /// Observation from an identify probe that just answered.
    pub fn from_info(address: &str, info: &DeviceInfo, discovered_at: DateTime<Utc>) -> Self {
        Self {
            address: address.to_owned(),
            device_type: info.device_type.clone(),
            firmware: info.firmware.clone(),
            status: DeviceStatus::Online,
            mac: info.mac.clone(),
            discovered_at,
            model: Some(info.model.clone()).filter(|m| !m.is_empty()),
            generation: Some(info.generation),
            auth_enabled: Some(info.auth_enabled),
        }
    }
}

/// What reconciling one observation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "device", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created(Device),
    Updated(Device),
    Unchanged(Device),
    /// No hardware address; nothing was written.
    Skipped,
}

/// Result of a network scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub range: String,
    /// Hosts probed.
    pub scanned: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Hosts that did not answer the identify probe.
    pub probe_failures: usize,
    pub entries: Vec<ReconcileOutcome>,
}

impl DiscoveryResult {
    fn push(&mut self, outcome: ReconcileOutcome) {
        match &outcome {
            ReconcileOutcome::Created(_) => self.created += 1,
            ReconcileOutcome::Updated(_) => self.updated += 1,
            ReconcileOutcome::Unchanged(_) => self.unchanged += 1,
            ReconcileOutcome::Skipped => self.skipped += 1,
        }
        self.entries.push(outcome);
    }
}

// ── Merge ───────────────────────────────────────────────────────────

/// Fold discovery-owned settings into a settings blob. Other keys are
/// left alone; a blob that is not an object is not touched.
fn merge_discovered_settings(settings: &mut Value, observed: &ObservedDevice) {
    if settings.is_null() {
        *settings = Value::Object(Map::new());
    }
    let Some(obj) = settings.as_object_mut() else {
        warn!(mac = %observed.mac, "device settings are not an object; leaving them as-is");
        return;
    };
    if let Some(model) = &observed.model {
        obj.insert(SETTINGS_MODEL.into(), Value::from(model.as_str()));
    }
    if let Some(generation) = observed.generation {
        obj.insert(SETTINGS_GENERATION.into(), Value::from(generation.to_string()));
    }
    if let Some(auth_enabled) = observed.auth_enabled {
        obj.insert(SETTINGS_AUTH_ENABLED.into(), Value::Bool(auth_enabled));
    }
}

/// Apply `observed` to `existing`. `None` when nothing would change.
///
/// Only the address, type, firmware, status, last-seen time and the
/// discovery-owned settings keys are updated.
pub fn merge_observation(existing: &Device, observed: &ObservedDevice) -> Option<Device> {
    let mut merged = existing.clone();
    merged.address.clone_from(&observed.address);
    if !observed.device_type.is_empty() {
        merged.device_type.clone_from(&observed.device_type);
    }
    if observed.firmware.is_some() {
        merged.firmware.clone_from(&observed.firmware);
    }
    merged.status = observed.status;
    merged.last_seen = Some(observed.discovered_at);
    merge_discovered_settings(&mut merged.settings, observed);

    (merged != *existing).then_some(merged)
}

fn new_device(mac: MacAddress, observed: &ObservedDevice, name: String) -> Device {
    let mut settings = Value::Null;
    merge_discovered_settings(&mut settings, observed);
    let now = Utc::now();
    Device {
        id: DeviceId::default(),
        mac,
        name,
        address: observed.address.clone(),
        device_type: observed.device_type.clone(),
        firmware: observed.firmware.clone(),
        settings,
        status: observed.status,
        last_seen: Some(observed.discovered_at),
        template_ids: Vec::new(),
        overrides: Value::Null,
        desired_snapshot: None,
        applied: false,
        created_at: now,
        updated_at: now,
    }
}

// ── Scan targets ────────────────────────────────────────────────────

fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), CoreError> {
    let (host, prefix) = cidr.split_once('/').ok_or_else(|| {
        CoreError::validation(format!("invalid ipv4 host/prefix value '{cidr}'"))
    })?;
    let host_ip = host
        .parse::<Ipv4Addr>()
        .map_err(|_| CoreError::validation(format!("invalid IPv4 host address '{host}'")))?;
    let prefix_len = prefix
        .parse::<u8>()
        .map_err(|_| CoreError::validation(format!("invalid IPv4 prefix length '{prefix}'")))?;
    if prefix_len > 32 {
        return Err(CoreError::validation(format!(
            "IPv4 prefix length must be <= 32, got {prefix_len}"
        )));
    }
    Ok((host_ip, prefix_len))
}

/// Hosts to probe for `range` (a CIDR block or a single address).
/// Network and broadcast addresses are skipped for blocks larger than /31.
fn scan_targets(range: &str, min_prefix: u8) -> Result<Vec<Ipv4Addr>, CoreError> {
    let range = range.trim();
    if !range.contains('/') {
        let host = range
            .parse::<Ipv4Addr>()
            .map_err(|_| CoreError::validation(format!("invalid IPv4 host address '{range}'")))?;
        return Ok(vec![host]);
    }

    let (host, prefix) = parse_ipv4_cidr(range)?;
    if prefix < min_prefix {
        return Err(CoreError::validation(format!(
            "range /{prefix} is too large to scan (smallest allowed prefix is /{min_prefix})"
        )));
    }
    let host_bits = 32 - u32::from(prefix);
    let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
    let network = u64::from(u32::from(host) & mask);
    let size = 1u64 << host_bits;
    let (first, last) = if prefix >= 31 {
        (0, size)
    } else {
        (1, size - 1)
    };
    Ok((first..last)
        .filter_map(|offset| u32::try_from(network + offset).ok())
        .map(Ipv4Addr::from)
        .collect())
}

impl Engine {
    /// Fold one observation into the inventory.
    pub async fn reconcile(
        &self,
        observed: &ObservedDevice,
        initial_name: &str,
    ) -> Result<ReconcileOutcome, CoreError> {
        let mac = MacAddress::new(&observed.mac);
        if mac.is_empty() {
            debug!(address = %observed.address, "observation without hardware address skipped");
            return Ok(ReconcileOutcome::Skipped);
        }

        let _guard = self.inner.credentials.lock_mac(&mac).await;
        let store = &self.inner.store;

        let Some(existing) = store.find_device_by_mac(&mac).await? else {
            let name = if initial_name.trim().is_empty() {
                default_name(&observed.device_type, &mac)
            } else {
                initial_name.trim().to_owned()
            };
            let (device, created) = store
                .upsert_device_by_mac(new_device(mac, observed, name))
                .await?;
            info!(device = %device.label(), address = %device.address, "device discovered");
            return Ok(if created {
                ReconcileOutcome::Created(device)
            } else {
                ReconcileOutcome::Updated(device)
            });
        };

        let Some(mut merged) = merge_observation(&existing, observed) else {
            return Ok(ReconcileOutcome::Unchanged(existing));
        };
        merged.updated_at = Utc::now();
        let device = store.update_device(merged).await?;
        if device.address != existing.address {
            self.invalidate_client(&existing.address);
            info!(
                device = %device.label(),
                from = %existing.address,
                to = %device.address,
                "device address changed"
            );
        }
        Ok(ReconcileOutcome::Updated(device))
    }

    /// Probe every host in `range` and reconcile each device that answers.
    pub async fn discover(&self, range: &str) -> Result<DiscoveryResult, CoreError> {
        let hosts = scan_targets(range, self.config().discovery_min_prefix)?;
        let factory = Arc::clone(self.inner.credentials.cache().factory());
        let root = CallContext::new(self.inner.cancel.clone());
        let probe_timeout = self.config().timeouts.probe;
        let concurrency = self.config().discovery_concurrency.max(1);

        let mut result = DiscoveryResult {
            range: range.trim().to_owned(),
            scanned: hosts.len(),
            ..DiscoveryResult::default()
        };
        info!(range = %result.range, hosts = hosts.len(), "scanning for devices");

        let mut answers: Vec<(Ipv4Addr, Result<DeviceInfo, CoreError>)> = stream::iter(hosts)
            .map(|ip| {
                let factory = Arc::clone(&factory);
                let ctx = root.with_timeout(probe_timeout);
                async move {
                    let identified = factory.identify(&ip.to_string(), &ctx).await;
                    (ip, identified)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        answers.sort_by_key(|(ip, _)| *ip);

        let discovered_at = Utc::now();
        for (ip, answer) in answers {
            let info = match answer {
                Ok(info) => info,
                Err(e) => {
                    debug!(address = %ip, error = %e, "no device answered");
                    result.probe_failures += 1;
                    continue;
                }
            };
            let observed = ObservedDevice::from_info(&ip.to_string(), &info, discovered_at);
            let name = info.name.as_deref().unwrap_or_default();
            result.push(self.reconcile(&observed, name).await?);
        }

        info!(
            range = %result.range,
            created = result.created,
            updated = result.updated,
            unchanged = result.unchanged,
            probe_failures = result.probe_failures,
            "scan finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::model::device::write_credential;
    use crate::model::{DeviceDraft, DeviceSettings};
    use crate::store::{MemoryStore, RecordStore};
    use crate::test_support::{FakeDevice, FakeFactory};

    fn observed(address: &str, firmware: &str) -> ObservedDevice {
        ObservedDevice {
            address: address.into(),
            device_type: "SHSW-25".into(),
            firmware: Some(firmware.into()),
            status: DeviceStatus::Online,
            mac: "A4CF12F45B6E".into(),
            discovered_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            model: Some("SHSW-25".into()),
            generation: Some(Generation::Gen1),
            auth_enabled: Some(true),
        }
    }

    fn engine_with(factory: Arc<FakeFactory>) -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::with_factory(EngineConfig::default(), store.clone(), factory);
        (engine, store)
    }

    #[test]
    fn parse_ipv4_cidr_accepts_valid_input() {
        let (host, prefix) = parse_ipv4_cidr("192.168.10.1/24").unwrap();
        assert_eq!(host.to_string(), "192.168.10.1");
        assert_eq!(prefix, 24);
    }

    #[test]
    fn parse_ipv4_cidr_rejects_invalid_prefix() {
        assert!(parse_ipv4_cidr("192.168.10.1/40").is_err());
    }

    #[test]
    fn parse_ipv4_cidr_rejects_missing_prefix() {
        assert!(parse_ipv4_cidr("192.168.10.1").is_err());
    }

    #[test]
    fn scan_targets_skip_network_and_broadcast() {
        let hosts = scan_targets("10.0.0.77/29", 16).unwrap();
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(10, 0, 0, 73)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(10, 0, 0, 78)));
        assert_eq!(hosts.len(), 6);

        assert_eq!(scan_targets("10.0.0.5/32", 16).unwrap(), vec![Ipv4Addr::new(10, 0, 0, 5)]);
        assert_eq!(scan_targets("10.0.0.4/31", 16).unwrap().len(), 2);
        assert_eq!(scan_targets(" 10.0.0.9 ", 16).unwrap(), vec![Ipv4Addr::new(10, 0, 0, 9)]);
        assert!(scan_targets("10.0.0.0/8", 16).is_err());
        assert!(scan_targets("printer.local", 16).is_err());
    }

    #[test]
    fn identical_observation_merges_to_nothing() {
        let obs = observed("10.0.0.3", "1.14.0");
        let device = new_device(MacAddress::new(&obs.mac), &obs, "Garage".into());
        assert!(merge_observation(&device, &obs).is_none());

        let moved = merge_observation(&device, &observed("10.0.0.4", "1.14.0")).unwrap();
        assert_eq!(moved.address, "10.0.0.4");
        assert_eq!(moved.name, "Garage");
    }

    #[test]
    fn non_object_settings_are_left_alone() {
        let obs = observed("10.0.0.3", "1.14.0");
        let mut device = new_device(MacAddress::new(&obs.mac), &obs, "Garage".into());
        device.settings = json!("legacy");
        let merged = merge_observation(&device, &observed("10.0.0.3", "1.15.0")).unwrap();
        assert_eq!(merged.settings, json!("legacy"));
        assert_eq!(merged.firmware.as_deref(), Some("1.15.0"));
    }

    #[tokio::test]
    async fn rediscovery_keeps_user_state() {
        let (engine, store) = engine_with(Arc::new(FakeFactory::default()));
        let first = engine.reconcile(&observed("10.0.0.3", "1.14.0"), "Garage").await.unwrap();
        let ReconcileOutcome::Created(device) = first else {
            panic!("expected a new device");
        };

        // User edits: rename, custom settings key, override, credential.
        let mut edited = device.clone();
        edited.name = "Garage door".into();
        edited.settings["room"] = json!("garage");
        edited.overrides = json!({"roller": {"max_time_open_secs": 25}});
        write_credential(&mut edited.settings, Some(&fleetsync_api::Credentials::new("admin", "pw")))
            .unwrap();
        store.update_device(edited).await.unwrap();

        let again = engine.reconcile(&observed("10.0.0.3", "1.14.0"), "ignored").await.unwrap();
        assert!(matches!(again, ReconcileOutcome::Unchanged(_)));

        for n in 0..3 {
            let firmware = format!("1.15.{n}");
            engine
                .reconcile(&observed("10.0.0.8", &firmware), "ignored")
                .await
                .unwrap();
        }

        let devices = engine.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.name, "Garage door");
        assert_eq!(device.address, "10.0.0.8");
        assert_eq!(device.firmware.as_deref(), Some("1.15.2"));
        assert_eq!(device.overrides, json!({"roller": {"max_time_open_secs": 25}}));
        let settings = DeviceSettings::from_blob(&device.settings).unwrap();
        assert_eq!(settings.extra.get("room"), Some(&json!("garage")));
        assert_eq!(settings.credentials().unwrap().username, "admin");
        assert_eq!(settings.generation, Some(Generation::Gen1));
        assert_eq!(settings.auth_enabled, Some(true));
    }

    #[tokio::test]
    async fn manual_add_racing_discovery_keeps_one_record() {
        let (engine, _store) = engine_with(Arc::new(FakeFactory::default()));
        let draft = DeviceDraft {
            name: "Pump".into(),
            address: "10.0.0.3".into(),
            mac: "A4:CF:12:F4:5B:6E".into(),
            device_type: "SHSW-1".into(),
            ..DeviceDraft::default()
        };
        let obs = observed("10.0.0.3", "1.14.0");
        let (added, found) = tokio::join!(engine.add_device(draft), engine.reconcile(&obs, "Garage"));
        let found = found.unwrap();

        let devices = engine.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        match added {
            Ok(device) => {
                assert_eq!(devices[0].id, device.id);
                assert_eq!(devices[0].name, "Pump");
                assert!(!matches!(found, ReconcileOutcome::Created(_)));
            }
            Err(e) => {
                assert_eq!(e.kind(), crate::ErrorKind::Validation);
                assert_eq!(devices[0].name, "Garage");
            }
        }
    }

    #[tokio::test]
    async fn empty_hardware_address_is_skipped() {
        let (engine, store) = engine_with(Arc::new(FakeFactory::default()));
        let mut obs = observed("10.0.0.3", "1.14.0");
        obs.mac = "   ".into();
        let outcome = engine.reconcile(&obs, "Ghost").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn address_change_invalidates_cached_client() {
        let factory = Arc::new(FakeFactory::default());
        factory.add(FakeDevice::gen1("10.0.0.3", "a4cf12f45b6e"));
        let (engine, _store) = engine_with(factory);
        let ReconcileOutcome::Created(device) = engine
            .reconcile(&observed("10.0.0.3", "1.14.0"), "Garage")
            .await
            .unwrap()
        else {
            panic!("expected a new device");
        };
        engine.test_connection(device.id).await.unwrap();
        assert_eq!(engine.cached_clients(), 1);

        engine
            .reconcile(&observed("10.0.0.4", "1.14.0"), "Garage")
            .await
            .unwrap();
        assert_eq!(engine.cached_clients(), 0);
    }

    #[tokio::test]
    async fn scan_creates_then_refreshes() {
        let factory = Arc::new(FakeFactory::default());
        factory.add(FakeDevice::gen1("10.0.2.2", "a4cf12000002"));
        factory.add(FakeDevice::gen2("10.0.2.5", "a8032a000005"));
        let (engine, _store) = engine_with(factory);

        let first = engine.discover("10.0.2.0/29").await.unwrap();
        assert_eq!(first.scanned, 6);
        assert_eq!(first.created, 2);
        assert_eq!(first.probe_failures, 4);

        let second = engine.discover("10.0.2.0/29").await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(engine.list_devices().await.unwrap().len(), 2);
        let names: Vec<String> = engine
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["SHSW-1-000002", "Plus1PM-000005"]);
    }
}
