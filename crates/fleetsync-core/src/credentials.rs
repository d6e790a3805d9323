// ── Credentials and client cache ──
//
// Picks the credential for each device call, recovers once from a bad
// saved credential via the fleet-wide fallback, and caches one client
// per device address. Credential recovery and credential writes for one
// device are serialized through a per-device lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetsync_api::{
    CallContext, Credentials, DeviceClient, DeviceInfo, Gen1Client, Gen2Client, Generation,
    TransportConfig,
};

use crate::config::FallbackCredential;
use crate::error::CoreError;
use crate::model::device::write_credential;
use crate::model::{Device, DeviceId, MacAddress};
use crate::store::RecordStore;

// ── Client factory ──────────────────────────────────────────────────

/// Builds protocol clients. The HTTP implementation is the default;
/// tests substitute scripted devices.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create a client for `address`. When `generation` is unknown the
    /// device is identified first.
    async fn create(
        &self,
        address: &str,
        generation: Option<Generation>,
        credentials: Option<Credentials>,
        ctx: &CallContext,
    ) -> Result<Arc<dyn DeviceClient>, CoreError>;

    /// Unauthenticated identify probe.
    async fn identify(&self, address: &str, ctx: &CallContext) -> Result<DeviceInfo, CoreError>;
}

/// Factory backed by one shared `reqwest::Client` (connection pool).
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(transport: &TransportConfig) -> Result<Self, CoreError> {
        Ok(Self {
            http: transport.build_client()?,
        })
    }
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    async fn create(
        &self,
        address: &str,
        generation: Option<Generation>,
        credentials: Option<Credentials>,
        ctx: &CallContext,
    ) -> Result<Arc<dyn DeviceClient>, CoreError> {
        let generation = match generation {
            Some(generation) => generation,
            None => self.identify(address, ctx).await?.generation,
        };
        let client: Arc<dyn DeviceClient> = match generation {
            Generation::Gen1 => Arc::new(Gen1Client::with_client(
                self.http.clone(),
                address,
                credentials,
            )?),
            Generation::Gen2 => Arc::new(Gen2Client::with_client(
                self.http.clone(),
                address,
                credentials,
            )?),
        };
        Ok(client)
    }

    async fn identify(&self, address: &str, ctx: &CallContext) -> Result<DeviceInfo, CoreError> {
        Ok(fleetsync_api::identify(&self.http, address, ctx).await?)
    }
}

// ── Client cache ────────────────────────────────────────────────────

struct CachedClient {
    client: Arc<dyn DeviceClient>,
    credentials: Option<Credentials>,
}

impl CachedClient {
    fn serves(&self, generation: Option<Generation>, credentials: Option<&Credentials>) -> bool {
        let creds_match = match (&self.credentials, credentials) {
            (None, None) => true,
            (Some(cached), Some(wanted)) => cached.same_as(wanted),
            _ => false,
        };
        creds_match && generation.is_none_or(|g| g == self.client.generation())
    }
}

/// One client per device address.
///
/// Lookups take the read lock; creation happens outside any lock and is
/// re-checked under the write lock before insertion.
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, CachedClient>>,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &Arc<dyn ClientFactory> {
        &self.factory
    }

    /// Cached client for `address` holding `credentials`, creating (or
    /// replacing) the entry when none matches.
    pub async fn get_or_create(
        &self,
        address: &str,
        generation: Option<Generation>,
        credentials: Option<&Credentials>,
        ctx: &CallContext,
    ) -> Result<Arc<dyn DeviceClient>, CoreError> {
        if let Some(client) = self.lookup(address, generation, credentials) {
            return Ok(client);
        }

        let created = self
            .factory
            .create(address, generation, credentials.cloned(), ctx)
            .await?;

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = clients
            .get(address)
            .filter(|entry| entry.serves(generation, credentials))
        {
            return Ok(Arc::clone(&existing.client));
        }
        debug!(address, "caching device client");
        clients.insert(
            address.to_owned(),
            CachedClient {
                client: Arc::clone(&created),
                credentials: credentials.cloned(),
            },
        );
        Ok(created)
    }

    fn lookup(
        &self,
        address: &str,
        generation: Option<Generation>,
        credentials: Option<&Credentials>,
    ) -> Option<Arc<dyn DeviceClient>> {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        clients
            .get(address)
            .filter(|entry| entry.serves(generation, credentials))
            .map(|entry| Arc::clone(&entry.client))
    }

    /// Drop the entry for `address`. Returns whether one existed.
    pub fn invalidate(&self, address: &str) -> bool {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.remove(address).is_some()
    }

    pub fn clear(&self) {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Per-device locks ────────────────────────────────────────────────

/// Async mutexes keyed by device hardware address.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.entry(key.to_owned()).or_default().value());
        mutex.lock_owned().await
    }
}

// ── Credential state machine ────────────────────────────────────────

/// Which credential the current attempt uses, or how the chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CredentialState {
    NoCredential,
    UsingSaved,
    UsingFallback,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    AuthFailure,
}

impl CredentialState {
    pub fn start(has_saved: bool, fallback_enabled: bool) -> Self {
        if has_saved {
            Self::UsingSaved
        } else if fallback_enabled {
            Self::UsingFallback
        } else {
            Self::NoCredential
        }
    }

    /// Transition after one attempt. Only a saved credential can fall
    /// through to the fallback, so a chain makes at most two attempts.
    pub fn next(self, outcome: AttemptOutcome, fallback_enabled: bool) -> Self {
        match (self, outcome) {
            (Self::Verified | Self::Failed, _) => self,
            (_, AttemptOutcome::Success) => Self::Verified,
            (Self::UsingSaved, AttemptOutcome::AuthFailure) if fallback_enabled => {
                Self::UsingFallback
            }
            (_, AttemptOutcome::AuthFailure) => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

// ── Credential manager ──────────────────────────────────────────────

/// Runs device operations with the right credential and owns the
/// client cache.
pub struct CredentialManager {
    store: Arc<dyn RecordStore>,
    cache: ClientCache,
    locks: KeyedLocks,
    fallback: Option<FallbackCredential>,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        factory: Arc<dyn ClientFactory>,
        fallback: Option<FallbackCredential>,
    ) -> Self {
        Self {
            store,
            cache: ClientCache::new(factory),
            locks: KeyedLocks::default(),
            fallback,
        }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Serialize mutations of one device record.
    pub(crate) async fn lock_device(&self, device: &Device) -> OwnedMutexGuard<()> {
        self.lock_mac(&device.mac).await
    }

    pub(crate) async fn lock_mac(&self, mac: &MacAddress) -> OwnedMutexGuard<()> {
        self.locks.lock(mac.as_str()).await
    }

    fn active_fallback(&self) -> Option<Credentials> {
        self.fallback
            .as_ref()
            .filter(|f| f.enabled)
            .map(FallbackCredential::to_credentials)
    }

    async fn load(&self, id: DeviceId) -> Result<Device, CoreError> {
        self.store
            .get_device(id)
            .await?
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    /// Run `op` against device `id`, resolving credentials as needed.
    ///
    /// Auth failures with a saved credential clear it and retry once with
    /// the fallback; a fallback that works is saved on the device. Other
    /// errors propagate untouched (with device context).
    pub async fn execute<T, F, Fut>(
        &self,
        id: DeviceId,
        operation: &'static str,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, CoreError>
    where
        F: Fn(Arc<dyn DeviceClient>, CallContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, fleetsync_api::Error>> + Send,
        T: Send,
    {
        let device = self.load(id).await?;
        let _guard = self.lock_device(&device).await;
        // Re-read under the lock: another caller may have changed the credential.
        let mut device = self.load(id).await?;
        let label = device.label();
        let settings = device
            .settings_view()
            .map_err(|e| e.for_device(label.as_str()))?;
        let saved = settings.credentials();
        let fallback = self.active_fallback();
        let started = Instant::now();

        let mut state = CredentialState::start(saved.is_some(), fallback.is_some());
        while !state.is_terminal() {
            let credentials = match state {
                CredentialState::UsingSaved => saved.as_ref(),
                CredentialState::UsingFallback => fallback.as_ref(),
                _ => None,
            };
            let client = self
                .cache
                .get_or_create(&device.address, settings.generation, credentials, ctx)
                .await
                .map_err(|e| e.for_device(label.as_str()))?;

            let err = match op(client, ctx.clone()).await {
                Ok(value) => {
                    if state == CredentialState::UsingFallback && settings.auth_enabled != Some(false)
                    {
                        self.save_credential(&mut device, credentials).await?;
                    }
                    log_outcome(&device, operation, started.elapsed(), state, "ok");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_auth() {
                log_outcome(&device, operation, started.elapsed(), state, "error");
                return Err(CoreError::from(err).for_device(label));
            }

            let next = state.next(AttemptOutcome::AuthFailure, fallback.is_some());
            if state == CredentialState::UsingSaved {
                warn!(
                    device = %label,
                    address = %device.address,
                    operation,
                    "saved credential rejected; clearing it"
                );
                self.save_credential(&mut device, None).await?;
                self.cache.invalidate(&device.address);
            }
            if next == CredentialState::Failed {
                log_outcome(&device, operation, started.elapsed(), state, "auth_failed");
                return Err(CoreError::from(err).for_device(label));
            }
            state = next;
        }

        // Loop only exits through the returns above.
        Err(CoreError::Internal(format!(
            "credential resolution for {label} ended in {state}"
        )))
    }

    /// Verify `credentials` with a live connectivity test and save them
    /// only if it passes.
    pub async fn update_credential(
        &self,
        id: DeviceId,
        credentials: Credentials,
        ctx: &CallContext,
    ) -> Result<Device, CoreError> {
        let device = self.load(id).await?;
        let _guard = self.lock_device(&device).await;
        let mut device = self.load(id).await?;
        let label = device.label();
        let generation = device
            .settings_view()
            .map_err(|e| e.for_device(label.as_str()))?
            .generation;

        let verified = async {
            let client = self
                .cache
                .get_or_create(&device.address, generation, Some(&credentials), ctx)
                .await?;
            client.test_connection(ctx).await?;
            Ok::<(), CoreError>(())
        }
        .await;

        if let Err(e) = verified {
            self.cache.invalidate(&device.address);
            warn!(device = %label, error = %e, "new credential failed verification");
            return Err(e.for_device(label));
        }
        self.save_credential(&mut device, Some(&credentials)).await?;
        info!(device = %label, "credential verified and saved");
        Ok(device)
    }

    async fn save_credential(
        &self,
        device: &mut Device,
        credentials: Option<&Credentials>,
    ) -> Result<(), CoreError> {
        write_credential(&mut device.settings, credentials)?;
        device.updated_at = chrono::Utc::now();
        *device = self.store.update_device(device.clone()).await?;
        Ok(())
    }
}

fn log_outcome(
    device: &Device,
    operation: &'static str,
    elapsed: Duration,
    state: CredentialState,
    outcome: &'static str,
) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    if outcome == "ok" {
        info!(
            device = %device.label(),
            address = %device.address,
            operation,
            elapsed_ms,
            credential = %state,
            outcome,
            "device operation finished"
        );
    } else {
        warn!(
            device = %device.label(),
            address = %device.address,
            operation,
            elapsed_ms,
            credential = %state,
            outcome,
            "device operation failed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;
    use crate::model::DeviceSettings;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeDevice, FakeFactory, device_record};

    fn fallback(enabled: bool) -> FallbackCredential {
        FallbackCredential {
            username: "admin".into(),
            password: SecretString::from("fleet-pw".to_owned()),
            enabled,
        }
    }

    #[test]
    fn transitions_bound_attempts() {
        use AttemptOutcome::{AuthFailure, Success};
        use CredentialState::{Failed, NoCredential, UsingFallback, UsingSaved, Verified};

        assert_eq!(CredentialState::start(true, true), UsingSaved);
        assert_eq!(CredentialState::start(false, true), UsingFallback);
        assert_eq!(CredentialState::start(false, false), NoCredential);

        assert_eq!(UsingSaved.next(AuthFailure, true), UsingFallback);
        assert_eq!(UsingSaved.next(AuthFailure, false), Failed);
        assert_eq!(UsingFallback.next(AuthFailure, true), Failed);
        assert_eq!(NoCredential.next(AuthFailure, true), Failed);
        assert_eq!(UsingFallback.next(Success, true), Verified);
        assert_eq!(Failed.next(Success, true), Failed);

        // Longest chain: saved, then fallback, then terminal.
        let mut state = CredentialState::start(true, true);
        let mut attempts = 0;
        while !state.is_terminal() {
            attempts += 1;
            state = state.next(AuthFailure, true);
        }
        assert_eq!(attempts, 2);
    }

    struct Harness {
        store: Arc<MemoryStore>,
        factory: Arc<FakeFactory>,
        device: Arc<FakeDevice>,
        manager: CredentialManager,
        id: DeviceId,
    }

    async fn harness(saved: Option<Credentials>, fallback_cfg: Option<FallbackCredential>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeFactory::default());
        let device = factory.add(FakeDevice::gen2("10.0.0.5", "a8032ab10001").with_auth("admin", "fleet-pw"));
        let mut record = device_record("a8032ab10001", "10.0.0.5");
        if let Some(creds) = saved.as_ref() {
            write_credential(&mut record.settings, Some(creds)).unwrap();
        }
        let id = store.insert_device(record).await.unwrap().id;
        let manager = CredentialManager::new(store.clone(), factory.clone(), fallback_cfg);
        Harness {
            store,
            factory,
            device,
            manager,
            id,
        }
    }

    async fn saved_credential(h: &Harness) -> Option<Credentials> {
        let device = h.store.get_device(h.id).await.unwrap().unwrap();
        DeviceSettings::from_blob(&device.settings).unwrap().credentials()
    }

    #[tokio::test]
    async fn bad_saved_credential_recovers_once_with_fallback() {
        let h = harness(Some(Credentials::new("admin", "stale")), Some(fallback(true))).await;
        let ctx = CallContext::background();

        h.manager
            .execute(h.id, "test_connection", &ctx, |client, ctx| async move {
                client.test_connection(&ctx).await
            })
            .await
            .unwrap();

        assert_eq!(h.device.auth_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.manager.cache().len(), 1);
        let saved = saved_credential(&h).await.unwrap();
        assert!(saved.same_as(&Credentials::new("admin", "fleet-pw")));
    }

    #[tokio::test]
    async fn bad_saved_credential_without_fallback_fails_and_clears() {
        let h = harness(Some(Credentials::new("admin", "stale")), Some(fallback(false))).await;
        let ctx = CallContext::background();

        let err = h
            .manager
            .execute(h.id, "get_status", &ctx, |client, ctx| async move {
                client.get_status(&ctx).await
            })
            .await
            .unwrap_err();

        assert!(err.is_auth());
        assert!(matches!(err, CoreError::Device { .. }));
        assert_eq!(h.device.auth_attempts.load(Ordering::SeqCst), 1);
        assert!(saved_credential(&h).await.is_none());
        assert!(h.manager.cache().is_empty());
    }

    #[tokio::test]
    async fn failing_fallback_is_not_retried() {
        let h = harness(Some(Credentials::new("admin", "stale")), Some(fallback(true))).await;
        h.device.set_accepted(Some(Credentials::new("admin", "something-else")));
        let ctx = CallContext::background();

        let err = h
            .manager
            .execute(h.id, "get_status", &ctx, |client, ctx| async move {
                client.get_status(&ctx).await
            })
            .await
            .unwrap_err();

        assert!(err.is_auth());
        assert_eq!(h.device.auth_attempts.load(Ordering::SeqCst), 2);
        assert!(saved_credential(&h).await.is_none());
    }

    #[tokio::test]
    async fn network_errors_keep_saved_credential() {
        let good = Credentials::new("admin", "fleet-pw");
        let h = harness(Some(good), Some(fallback(true))).await;
        h.device.set_reachable(false);
        let ctx = CallContext::background();

        let err = h
            .manager
            .execute(h.id, "get_status", &ctx, |client, ctx| async move {
                client.get_status(&ctx).await
            })
            .await
            .unwrap_err();

        assert!(err.is_network());
        assert!(saved_credential(&h).await.is_some());
    }

    #[tokio::test]
    async fn fallback_not_saved_when_auth_disabled() {
        let h = harness(None, Some(fallback(true))).await;
        h.device.set_accepted(None);
        let mut record = h.store.get_device(h.id).await.unwrap().unwrap();
        record.settings["auth_enabled"] = serde_json::json!(false);
        h.store.update_device(record).await.unwrap();

        let ctx = CallContext::background();
        h.manager
            .execute(h.id, "get_status", &ctx, |client, ctx| async move {
                client.get_status(&ctx).await
            })
            .await
            .unwrap();
        assert!(saved_credential(&h).await.is_none());
    }

    #[tokio::test]
    async fn update_credential_persists_only_verified() {
        let h = harness(None, None).await;
        let ctx = CallContext::background();

        let err = h
            .manager
            .update_credential(h.id, Credentials::new("admin", "wrong"), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(saved_credential(&h).await.is_none());
        assert!(h.manager.cache().is_empty());

        h.manager
            .update_credential(h.id, Credentials::new("admin", "fleet-pw"), &ctx)
            .await
            .unwrap();
        assert!(saved_credential(&h).await.is_some());
    }

    #[tokio::test]
    async fn cache_replaces_entry_on_credential_change() {
        let factory = Arc::new(FakeFactory::default());
        factory.add(FakeDevice::gen1("10.0.0.9", "a4cf12f45b6e"));
        let cache = ClientCache::new(factory.clone());
        let ctx = CallContext::background();
        let a = Credentials::new("admin", "a");

        cache.get_or_create("10.0.0.9", None, Some(&a), &ctx).await.unwrap();
        cache.get_or_create("10.0.0.9", None, Some(&a), &ctx).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let b = Credentials::new("admin", "b");
        cache.get_or_create("10.0.0.9", None, Some(&b), &ctx).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate("10.0.0.9"));
        assert!(!cache.invalidate("10.0.0.9"));
    }
}
