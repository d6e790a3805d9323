// Scripted devices for engine tests.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use fleetsync_api::{
    CallContext, Component, ComponentValue, Credentials, DeviceClient, DeviceInfo, Error,
    Generation, SettingsOutcome, SettingsWrite,
};

use crate::credentials::ClientFactory;
use crate::error::CoreError;
use crate::model::{Device, DeviceId, DeviceStatus, MacAddress};

/// In-memory stand-in for one physical device.
pub(crate) struct FakeDevice {
    pub info: DeviceInfo,
    pub address: String,
    /// Credential the device accepts; `None` means auth is disabled.
    accepted: Mutex<Option<Credentials>>,
    reachable: AtomicBool,
    config: Mutex<Value>,
    /// Calls that presented (or lacked) credentials to an auth-enabled device.
    pub auth_attempts: AtomicUsize,
    pub writes: Mutex<Vec<SettingsWrite>>,
    pub commands: Mutex<Vec<(Component, ComponentValue)>>,
    pub reboots: AtomicUsize,
}

impl FakeDevice {
    fn new(address: &str, mac: &str, generation: Generation, model: &str) -> Self {
        Self {
            info: DeviceInfo {
                mac: mac.to_uppercase(),
                model: model.to_owned(),
                device_type: model.to_owned(),
                generation,
                firmware: Some("1.0.0".into()),
                name: None,
                auth_enabled: false,
            },
            address: address.to_owned(),
            accepted: Mutex::new(None),
            reachable: AtomicBool::new(true),
            config: Mutex::new(json!({})),
            auth_attempts: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            reboots: AtomicUsize::new(0),
        }
    }

    pub fn gen1(address: &str, mac: &str) -> Self {
        Self::new(address, mac, Generation::Gen1, "SHSW-1")
    }

    pub fn gen2(address: &str, mac: &str) -> Self {
        Self::new(address, mac, Generation::Gen2, "Plus1PM")
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.info.auth_enabled = true;
        self.accepted = Mutex::new(Some(Credentials::new(username, password)));
        self
    }

    pub fn with_config(self, config: Value) -> Self {
        *self.config.lock().unwrap() = config;
        self
    }

    pub fn set_accepted(&self, credentials: Option<Credentials>) {
        *self.accepted.lock().unwrap() = credentials;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_config(&self, config: Value) {
        *self.config.lock().unwrap() = config;
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check(&self, presented: Option<&Credentials>) -> Result<(), Error> {
        if !self.is_reachable() {
            return Err(Error::Timeout { timeout_ms: 10 });
        }
        let accepted = self.accepted.lock().unwrap().clone();
        let Some(accepted) = accepted else {
            return Ok(());
        };
        self.auth_attempts.fetch_add(1, Ordering::SeqCst);
        match presented {
            Some(creds) if creds.same_as(&accepted) => Ok(()),
            _ => Err(Error::Authentication {
                message: "401 Unauthorized".into(),
            }),
        }
    }
}

struct FakeClient {
    device: Arc<FakeDevice>,
    credentials: Option<Credentials>,
}

#[async_trait]
impl DeviceClient for FakeClient {
    fn generation(&self) -> Generation {
        self.device.info.generation
    }

    fn address(&self) -> &str {
        &self.device.address
    }

    async fn get_info(&self, _ctx: &CallContext) -> Result<DeviceInfo, Error> {
        self.device.check(self.credentials.as_ref())?;
        Ok(self.device.info.clone())
    }

    async fn get_status(&self, _ctx: &CallContext) -> Result<Value, Error> {
        self.device.check(self.credentials.as_ref())?;
        Ok(json!({"uptime": 42}))
    }

    async fn get_full_configuration(&self, _ctx: &CallContext) -> Result<Value, Error> {
        self.device.check(self.credentials.as_ref())?;
        Ok(self.device.config.lock().unwrap().clone())
    }

    async fn set_component_state(
        &self,
        _ctx: &CallContext,
        component: Component,
        _channel: u8,
        value: ComponentValue,
    ) -> Result<(), Error> {
        self.device.check(self.credentials.as_ref())?;
        self.device.commands.lock().unwrap().push((component, value));
        Ok(())
    }

    async fn apply_settings(
        &self,
        _ctx: &CallContext,
        write: &SettingsWrite,
    ) -> Result<SettingsOutcome, Error> {
        self.device.check(self.credentials.as_ref())?;
        self.device.writes.lock().unwrap().push(write.clone());
        Ok(SettingsOutcome::default())
    }

    async fn reboot(&self, _ctx: &CallContext) -> Result<(), Error> {
        self.device.check(self.credentials.as_ref())?;
        self.device.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn test_connection(&self, _ctx: &CallContext) -> Result<(), Error> {
        self.device.check(self.credentials.as_ref())
    }
}

/// Factory resolving addresses to registered fake devices.
#[derive(Default)]
pub(crate) struct FakeFactory {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn add(&self, device: FakeDevice) -> Arc<FakeDevice> {
        let device = Arc::new(device);
        self.devices
            .lock()
            .unwrap()
            .insert(device.address.clone(), Arc::clone(&device));
        device
    }

    fn get(&self, address: &str) -> Option<Arc<FakeDevice>> {
        self.devices.lock().unwrap().get(address).cloned()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(
        &self,
        address: &str,
        _generation: Option<Generation>,
        credentials: Option<Credentials>,
        _ctx: &CallContext,
    ) -> Result<Arc<dyn DeviceClient>, CoreError> {
        let device = self.get(address).ok_or_else(|| CoreError::Network {
            message: format!("no route to {address}"),
        })?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeClient {
            device,
            credentials,
        }))
    }

    async fn identify(&self, address: &str, _ctx: &CallContext) -> Result<DeviceInfo, CoreError> {
        match self.get(address) {
            Some(device) if device.is_reachable() => Ok(device.info.clone()),
            _ => Err(CoreError::Network {
                message: format!("{address} did not answer"),
            }),
        }
    }
}

/// Inventory record for a Gen2 device at `address`.
pub(crate) fn device_record(mac: &str, address: &str) -> Device {
    let now = Utc::now();
    Device {
        id: DeviceId::default(),
        mac: MacAddress::new(mac),
        name: format!("device-{address}"),
        address: address.to_owned(),
        device_type: "Plus1PM".into(),
        firmware: Some("1.0.0".into()),
        settings: json!({"model": "Plus1PM", "generation": "gen2"}),
        status: DeviceStatus::Online,
        last_seen: Some(now),
        template_ids: Vec::new(),
        overrides: Value::Null,
        desired_snapshot: None,
        applied: false,
        created_at: now,
        updated_at: now,
    }
}
