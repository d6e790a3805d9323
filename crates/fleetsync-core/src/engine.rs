// ── Engine ──
//
// Entry point for embedders. Owns the record store handle, the
// credential manager (and with it the client cache), the root
// cancellation token and background task handles. Operations are split
// across modules by concern: discovery, configuration, drift,
// scheduler, resolution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fleetsync_api::{CallContext, DeviceClient};

use crate::config::EngineConfig;
use crate::credentials::{ClientFactory, CredentialManager, HttpClientFactory};
use crate::error::CoreError;
use crate::model::device::{SETTINGS_GENERATION, SETTINGS_MODEL};
use crate::model::{Device, DeviceDraft, DeviceId, DeviceStatus, MacAddress};
use crate::store::RecordStore;

/// Configuration reconciliation engine for a device fleet.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Every device call derives
/// its `CallContext` from the engine's root token, so
/// [`shutdown()`](Self::shutdown) cancels in-flight work.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) credentials: CredentialManager,
    pub(crate) cancel: CancellationToken,
    pub(crate) task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine talking to real devices over HTTP.
    pub fn new(config: EngineConfig, store: Arc<dyn RecordStore>) -> Result<Self, CoreError> {
        let factory = Arc::new(HttpClientFactory::new(&config.transport)?);
        Ok(Self::with_factory(config, store, factory))
    }

    /// Create an engine with a custom client factory.
    pub fn with_factory(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let credentials =
            CredentialManager::new(Arc::clone(&store), factory, config.fallback.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                credentials,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Context for one engine operation, bounded by `timeout`.
    pub(crate) fn context(&self, timeout: Duration) -> CallContext {
        CallContext::new(self.inner.cancel.clone()).with_timeout(timeout)
    }

    /// Run a device operation through the credential manager.
    pub(crate) async fn on_device<T, F, Fut>(
        &self,
        id: DeviceId,
        operation: &'static str,
        timeout: Duration,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceClient>, CallContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, fleetsync_api::Error>> + Send,
        T: Send,
    {
        let ctx = self.context(timeout);
        self.inner.credentials.execute(id, operation, &ctx, op).await
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Add a device by hand. The hardware address is required and unique.
    pub async fn add_device(&self, draft: DeviceDraft) -> Result<Device, CoreError> {
        let mac = MacAddress::new(&draft.mac);
        if mac.is_empty() {
            return Err(CoreError::validation("device hardware address is required"));
        }
        if draft.address.trim().is_empty() {
            return Err(CoreError::validation("device network address is required"));
        }

        let mut settings = serde_json::Map::new();
        if let Some(model) = draft.model {
            settings.insert(SETTINGS_MODEL.into(), model.into());
        }
        if let Some(generation) = draft.generation {
            settings.insert(SETTINGS_GENERATION.into(), serde_json::to_value(generation)?);
        }
        let name = if draft.name.trim().is_empty() {
            default_name(&draft.device_type, &mac)
        } else {
            draft.name
        };

        // Discovery creates records under the same lock.
        let _guard = self.inner.credentials.lock_mac(&mac).await;
        let now = Utc::now();
        let device = self
            .inner
            .store
            .insert_device(Device {
                id: DeviceId::default(),
                mac,
                name,
                address: draft.address.trim().to_owned(),
                device_type: draft.device_type,
                firmware: draft.firmware,
                settings: serde_json::Value::Object(settings),
                status: DeviceStatus::Unknown,
                last_seen: None,
                template_ids: Vec::new(),
                overrides: serde_json::Value::Null,
                desired_snapshot: None,
                applied: false,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(device = %device.label(), address = %device.address, "device added");
        Ok(device)
    }

    pub async fn get_device(&self, id: DeviceId) -> Result<Device, CoreError> {
        self.inner
            .store
            .get_device(id)
            .await?
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, CoreError> {
        self.inner.store.list_devices().await
    }

    /// Remove a device and drop its cached client.
    pub async fn delete_device(&self, id: DeviceId) -> Result<(), CoreError> {
        let device = self.get_device(id).await?;
        let _guard = self.inner.credentials.lock_device(&device).await;
        self.inner.store.delete_device(id).await?;
        self.inner.credentials.cache().invalidate(&device.address);
        info!(device = %device.label(), "device deleted");
        Ok(())
    }

    /// Read-modify-write one device under its lock.
    pub(crate) async fn mutate_device<F>(&self, id: DeviceId, mutate: F) -> Result<Device, CoreError>
    where
        F: FnOnce(&mut Device) -> Result<(), CoreError> + Send,
    {
        let device = self.get_device(id).await?;
        let _guard = self.inner.credentials.lock_device(&device).await;
        let mut device = self.get_device(id).await?;
        mutate(&mut device)?;
        device.updated_at = Utc::now();
        self.inner.store.update_device(device).await
    }

    // ── Client cache ─────────────────────────────────────────────────

    /// Drop the cached client for `address`.
    pub fn invalidate_client(&self, address: &str) -> bool {
        self.inner.credentials.cache().invalidate(address)
    }

    pub fn clear_clients(&self) {
        self.inner.credentials.cache().clear();
        debug!("client cache cleared");
    }

    pub fn cached_clients(&self) -> usize {
        self.inner.credentials.cache().len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Cancel in-flight operations and wait for background tasks.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.inner.credentials.cache().clear();
        debug!("engine shut down");
    }
}

/// Display name for a device nobody has named yet.
pub(crate) fn default_name(device_type: &str, mac: &MacAddress) -> String {
    let kind = if device_type.is_empty() {
        "device"
    } else {
        device_type
    };
    format!("{kind}-{}", mac.suffix())
}
