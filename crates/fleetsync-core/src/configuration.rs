// ── Configuration operations ──
//
// Reading, pushing and recording device configuration, template
// management, overrides, credentials and control passthroughs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use fleetsync_api::{
    CallContext, Component, ComponentValue, Credentials, DeviceClient, SettingsOutcome,
};

use crate::convert;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{
    CapabilityGroup, ConfigAction, ConfigHistory, ConfigHistoryId, ConfigSource, ConfigTemplate,
    Device, DeviceConfigRecord, DeviceConfiguration, DeviceId, TemplateDraft, TemplateId,
};
use crate::resolver::{self, ResolvedConfiguration};

/// Fetch and normalize the live configuration through `client`.
pub(crate) async fn fetch_live(
    client: Arc<dyn DeviceClient>,
    ctx: CallContext,
) -> Result<DeviceConfiguration, fleetsync_api::Error> {
    let raw = client.get_full_configuration(&ctx).await?;
    convert::normalize(client.generation(), &raw).map_err(|e| fleetsync_api::Error::Deserialization {
        message: e.to_string(),
        body: String::new(),
    })
}

/// Push every group set in `config` through `client`.
pub(crate) async fn push_config(
    client: Arc<dyn DeviceClient>,
    ctx: CallContext,
    config: &DeviceConfiguration,
) -> Result<SettingsOutcome, fleetsync_api::Error> {
    let mut outcome = SettingsOutcome::default();
    for write in convert::to_writes(client.generation(), config) {
        let result = client.apply_settings(&ctx, &write).await?;
        outcome.restart_required |= result.restart_required;
    }
    Ok(outcome)
}

impl Engine {
    // ── Desired configuration ────────────────────────────────────────

    /// Resolve a device's desired configuration from system defaults,
    /// its templates and its overrides.
    pub async fn desired_configuration(
        &self,
        id: DeviceId,
    ) -> Result<ResolvedConfiguration, CoreError> {
        let device = self.get_device(id).await?;
        let mut templates = Vec::with_capacity(device.template_ids.len());
        for template_id in &device.template_ids {
            templates.push(self.get_template(*template_id).await?);
        }
        resolver::resolve(&self.config().system_defaults, &templates, &device.overrides)
            .map_err(|e| e.for_device(device.label()))
    }

    // ── Live configuration ───────────────────────────────────────────

    /// Read and normalize a device's live configuration.
    pub async fn get_device_configuration(
        &self,
        id: DeviceId,
    ) -> Result<DeviceConfiguration, CoreError> {
        let timeout = self.config().timeouts.fetch;
        self.on_device(id, "get_configuration", timeout, fetch_live)
            .await
    }

    /// Validate `blob` and push every group it sets to the device.
    pub async fn set_device_configuration(
        &self,
        id: DeviceId,
        blob: &Value,
    ) -> Result<SettingsOutcome, CoreError> {
        let config = DeviceConfiguration::from_blob(blob)?;
        if config.is_empty() {
            return Err(CoreError::validation("configuration sets no capability group"));
        }
        let timeout = self.config().timeouts.control;
        let outcome = self
            .on_device(id, "set_configuration", timeout, |client, ctx| {
                push_config(client, ctx, &config)
            })
            .await?;

        let mut stored = self.stored_configuration(id).await?;
        stored.overlay(&config);
        self.record_configuration(id, &stored, ConfigSource::Pushed, ConfigAction::Pushed)
            .await?;
        Ok(outcome)
    }

    /// Fetch the live configuration and store it as the device's record.
    pub async fn import_configuration(
        &self,
        id: DeviceId,
    ) -> Result<DeviceConfigRecord, CoreError> {
        let live = self.get_device_configuration(id).await?;
        self.record_configuration(id, &live, ConfigSource::Imported, ConfigAction::Imported)
            .await
    }

    /// One capability group of the live configuration, `None` when the
    /// device does not report it.
    pub async fn get_capability_config(
        &self,
        id: DeviceId,
        group: CapabilityGroup,
    ) -> Result<Option<Value>, CoreError> {
        Ok(self.get_device_configuration(id).await?.group_value(group))
    }

    /// Validate and push one capability group.
    pub async fn set_capability_config(
        &self,
        id: DeviceId,
        group: CapabilityGroup,
        blob: &Value,
    ) -> Result<SettingsOutcome, CoreError> {
        let mut config = DeviceConfiguration::default();
        config.set_group(group, blob)?;
        let timeout = self.config().timeouts.control;
        let outcome = self
            .on_device(id, "set_capability_config", timeout, |client, ctx| {
                push_config(client, ctx, &config)
            })
            .await?;

        let mut stored = self.stored_configuration(id).await?;
        stored.set_group(group, blob)?;
        self.record_configuration(
            id,
            &stored,
            ConfigSource::Pushed,
            ConfigAction::CapabilityUpdated,
        )
        .await?;
        Ok(outcome)
    }

    /// Push the desired configuration and mark the device applied.
    pub async fn apply_configuration(&self, id: DeviceId) -> Result<SettingsOutcome, CoreError> {
        let desired = self.desired_configuration(id).await?;
        let timeout = self.config().timeouts.control;
        let outcome = self
            .on_device(id, "apply_configuration", timeout, |client, ctx| {
                push_config(client, ctx, &desired.config)
            })
            .await?;

        let snapshot = desired.config.to_value();
        self.mutate_device(id, |device| {
            device.desired_snapshot = Some(snapshot);
            device.applied = true;
            Ok(())
        })
        .await?;
        self.record_configuration(id, &desired.config, ConfigSource::Pushed, ConfigAction::Applied)
            .await?;
        info!(device = %id, restart_required = outcome.restart_required, "configuration applied");
        Ok(outcome)
    }

    // ── Stored configuration ─────────────────────────────────────────

    /// Last stored configuration record, if any.
    pub async fn get_config_record(
        &self,
        id: DeviceId,
    ) -> Result<Option<DeviceConfigRecord>, CoreError> {
        self.get_device(id).await?;
        self.inner.store.get_config_record(id).await
    }

    pub async fn config_history(&self, id: DeviceId) -> Result<Vec<ConfigHistory>, CoreError> {
        self.get_device(id).await?;
        self.inner.store.list_config_history(id).await
    }

    pub(crate) async fn stored_configuration(&self, id: DeviceId) -> Result<DeviceConfiguration, CoreError> {
        match self.inner.store.get_config_record(id).await? {
            Some(record) => DeviceConfiguration::from_blob(&record.config),
            None => Ok(DeviceConfiguration::default()),
        }
    }

    /// Store `config` as the device's record, bumping its version and
    /// appending history.
    pub(crate) async fn record_configuration(
        &self,
        id: DeviceId,
        config: &DeviceConfiguration,
        source: ConfigSource,
        action: ConfigAction,
    ) -> Result<DeviceConfigRecord, CoreError> {
        let device = self.get_device(id).await?;
        let _guard = self.inner.credentials.lock_device(&device).await;

        let store = &self.inner.store;
        let previous = store.get_config_record(id).await?;
        let now = Utc::now();
        let record = DeviceConfigRecord {
            device_id: id,
            version: previous.as_ref().map_or(1, |r| r.version.saturating_add(1)),
            source,
            config: config.to_value(),
            updated_at: now,
        };
        store.put_config_record(record.clone()).await?;
        store
            .insert_config_history(ConfigHistory {
                id: ConfigHistoryId::default(),
                device_id: id,
                version: record.version,
                previous: previous.map(|r| r.config),
                config: record.config.clone(),
                action,
                changed_by: self.config().actor.clone(),
                at: now,
            })
            .await?;
        Ok(record)
    }

    // ── Templates ────────────────────────────────────────────────────

    pub async fn create_template(&self, draft: TemplateDraft) -> Result<ConfigTemplate, CoreError> {
        validate_template(&draft)?;
        let now = Utc::now();
        self.inner
            .store
            .insert_template(ConfigTemplate {
                id: TemplateId::default(),
                name: draft.name.trim().to_owned(),
                description: draft.description,
                scope: draft.scope,
                scope_key: draft.scope_key,
                config: draft.config,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn update_template(
        &self,
        id: TemplateId,
        draft: TemplateDraft,
    ) -> Result<ConfigTemplate, CoreError> {
        validate_template(&draft)?;
        let mut template = self.get_template(id).await?;
        template.name = draft.name.trim().to_owned();
        template.description = draft.description;
        template.scope = draft.scope;
        template.scope_key = draft.scope_key;
        template.config = draft.config;
        template.updated_at = Utc::now();
        self.inner.store.update_template(template).await
    }

    pub async fn get_template(&self, id: TemplateId) -> Result<ConfigTemplate, CoreError> {
        self.inner
            .store
            .get_template(id)
            .await?
            .ok_or_else(|| CoreError::not_found("template", id))
    }

    pub async fn list_templates(&self) -> Result<Vec<ConfigTemplate>, CoreError> {
        self.inner.store.list_templates().await
    }

    /// Delete a template and detach it from every device using it.
    pub async fn delete_template(&self, id: TemplateId) -> Result<(), CoreError> {
        self.get_template(id).await?;
        for device in self.list_devices().await? {
            if device.template_ids.contains(&id) {
                self.mutate_device(device.id, |d| {
                    d.template_ids.retain(|t| *t != id);
                    d.applied = false;
                    Ok(())
                })
                .await?;
            }
        }
        self.inner.store.delete_template(id).await?;
        Ok(())
    }

    /// Append a template to the device's ordered list. Applying the same
    /// template twice is a no-op.
    pub async fn apply_template(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
    ) -> Result<Device, CoreError> {
        self.get_template(template_id).await?;
        self.mutate_device(device_id, |device| {
            if !device.template_ids.contains(&template_id) {
                device.template_ids.push(template_id);
                device.applied = false;
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_template(
        &self,
        device_id: DeviceId,
        template_id: TemplateId,
    ) -> Result<Device, CoreError> {
        self.mutate_device(device_id, |device| {
            let before = device.template_ids.len();
            device.template_ids.retain(|t| *t != template_id);
            if device.template_ids.len() != before {
                device.applied = false;
            }
            Ok(())
        })
        .await
    }

    /// Validate and store the device's override blob.
    pub async fn set_device_override(&self, id: DeviceId, blob: Value) -> Result<Device, CoreError> {
        DeviceConfiguration::from_blob(&blob)?;
        self.mutate_device(id, |device| {
            device.overrides = blob;
            device.applied = false;
            Ok(())
        })
        .await
    }

    // ── Credentials ──────────────────────────────────────────────────

    /// Save a new credential after a successful connectivity test.
    pub async fn update_device_credential(
        &self,
        id: DeviceId,
        username: &str,
        password: &str,
    ) -> Result<Device, CoreError> {
        if username.trim().is_empty() {
            return Err(CoreError::validation("username is required"));
        }
        let ctx = self.context(self.config().timeouts.connect_test);
        self.inner
            .credentials
            .update_credential(id, Credentials::new(username, password), &ctx)
            .await
    }

    // ── Control ──────────────────────────────────────────────────────

    pub async fn set_component_state(
        &self,
        id: DeviceId,
        component: Component,
        channel: u8,
        value: ComponentValue,
    ) -> Result<(), CoreError> {
        let timeout = self.config().timeouts.control;
        self.on_device(id, "set_component_state", timeout, |client, ctx| async move {
            client
                .set_component_state(&ctx, component, channel, value)
                .await
        })
        .await
    }

    pub async fn reboot(&self, id: DeviceId) -> Result<(), CoreError> {
        let timeout = self.config().timeouts.control;
        self.on_device(id, "reboot", timeout, |client, ctx| async move {
            client.reboot(&ctx).await
        })
        .await
    }

    /// Authenticated round-trip. Any failure drops the cached client.
    pub async fn test_connection(&self, id: DeviceId) -> Result<(), CoreError> {
        let timeout = self.config().timeouts.connect_test;
        let result = self
            .on_device(id, "test_connection", timeout, |client, ctx| async move {
                client.test_connection(&ctx).await
            })
            .await;
        if let Err(e) = &result {
            if let Ok(device) = self.get_device(id).await {
                self.invalidate_client(&device.address);
                warn!(device = %device.label(), error = %e, "connectivity test failed");
            }
        }
        result
    }

    /// Raw generation-specific status document.
    pub async fn get_device_status(&self, id: DeviceId) -> Result<Value, CoreError> {
        let timeout = self.config().timeouts.fetch;
        self.on_device(id, "get_status", timeout, |client, ctx| async move {
            client.get_status(&ctx).await
        })
        .await
    }
}

fn validate_template(draft: &TemplateDraft) -> Result<(), CoreError> {
    if draft.name.trim().is_empty() {
        return Err(CoreError::validation("template name is required"));
    }
    DeviceConfiguration::from_blob(&draft.config)
        .map_err(|e| CoreError::validation(format!("template '{}': {e}", draft.name)))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::model::DeviceDraft;
    use crate::store::MemoryStore;
    use crate::test_support::{FakeDevice, FakeFactory};

    struct Fixture {
        engine: Engine,
        device: Arc<FakeDevice>,
        id: DeviceId,
    }

    async fn fixture() -> Fixture {
        let factory = Arc::new(FakeFactory::default());
        let device = factory.add(FakeDevice::gen2("10.0.0.7", "a8032ab10007").with_config(json!({
            "switch:0": {"name": "Heater", "initial_state": "off", "auto_on": false, "auto_off": false}
        })));
        let engine = Engine::with_factory(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            factory,
        );
        let id = engine
            .add_device(DeviceDraft {
                name: "Heater".into(),
                address: "10.0.0.7".into(),
                mac: "a8032ab10007".into(),
                device_type: "Plus1PM".into(),
                generation: Some(fleetsync_api::Generation::Gen2),
                ..DeviceDraft::default()
            })
            .await
            .unwrap()
            .id;
        Fixture { engine, device, id }
    }

    fn draft(name: &str, config: Value) -> TemplateDraft {
        TemplateDraft {
            name: name.into(),
            config,
            ..TemplateDraft::default()
        }
    }

    #[tokio::test]
    async fn import_stores_versioned_record_and_history() {
        let f = fixture().await;
        let first = f.engine.import_configuration(f.id).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.source, ConfigSource::Imported);
        assert_eq!(first.config["relay"]["name"], "Heater");

        let second = f.engine.import_configuration(f.id).await.unwrap();
        assert_eq!(second.version, 2);
        let history = f.engine.config_history(f.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].previous.as_ref(), Some(&first.config));
        assert_eq!(history[1].changed_by, "fleetsync");
    }

    #[tokio::test]
    async fn apply_pushes_desired_and_marks_applied() {
        let f = fixture().await;
        let t = f
            .engine
            .create_template(draft("night", json!({"relay": {"default_state": "off"}})))
            .await
            .unwrap();
        f.engine.apply_template(f.id, t.id).await.unwrap();
        let device = f.engine.apply_template(f.id, t.id).await.unwrap();
        assert_eq!(device.template_ids, vec![t.id]);

        f.engine
            .set_device_override(f.id, json!({"led": {"status_disabled": true}}))
            .await
            .unwrap();
        f.engine.apply_configuration(f.id).await.unwrap();

        let writes = f.device.writes.lock().unwrap().clone();
        let components: Vec<Component> = writes.iter().map(|w| w.component).collect();
        assert_eq!(components, vec![Component::Relay, Component::Ui]);

        let device = f.engine.get_device(f.id).await.unwrap();
        assert!(device.applied);
        assert_eq!(
            device.desired_snapshot,
            Some(json!({"relay": {"default_state": "off"}, "led": {"status_disabled": true}}))
        );
        let record = f.engine.get_config_record(f.id).await.unwrap().unwrap();
        assert_eq!(record.source, ConfigSource::Pushed);
    }

    #[tokio::test]
    async fn override_is_validated_before_storing() {
        let f = fixture().await;
        let err = f
            .engine
            .set_device_override(f.id, json!({"relay": {"auto_off_secs": "soon"}}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert_eq!(f.engine.get_device(f.id).await.unwrap().overrides, Value::Null);
    }

    #[tokio::test]
    async fn capability_write_pushes_one_group() {
        let f = fixture().await;
        f.engine
            .set_capability_config(f.id, CapabilityGroup::Relay, &json!({"auto_off_secs": 60}))
            .await
            .unwrap();
        let writes = f.device.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].fields.get("auto_off_delay"), Some(&json!(60.0)));

        let relay = f
            .engine
            .get_capability_config(f.id, CapabilityGroup::Relay)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay["name"], "Heater");
        let missing = f
            .engine
            .get_capability_config(f.id, CapabilityGroup::Roller)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn deleting_template_detaches_it() {
        let f = fixture().await;
        let t = f
            .engine
            .create_template(draft("eco", json!({"led": {"status_disabled": true}})))
            .await
            .unwrap();
        f.engine.apply_template(f.id, t.id).await.unwrap();
        f.engine.delete_template(t.id).await.unwrap();

        assert!(f.engine.get_device(f.id).await.unwrap().template_ids.is_empty());
        let err = f.engine.get_template(t.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn template_names_are_unique_and_config_validated() {
        let f = fixture().await;
        f.engine.create_template(draft("base", json!({}))).await.unwrap();
        let dup = f.engine.create_template(draft("base", json!({}))).await.unwrap_err();
        assert_eq!(dup.kind(), crate::ErrorKind::Validation);
        let bad = f
            .engine
            .create_template(draft("bad", json!({"roller": {"default_state": "up"}})))
            .await
            .unwrap_err();
        assert_eq!(bad.kind(), crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn failed_connectivity_test_drops_cached_client() {
        let f = fixture().await;
        f.engine.test_connection(f.id).await.unwrap();
        assert_eq!(f.engine.cached_clients(), 1);

        f.device.set_reachable(false);
        let err = f.engine.test_connection(f.id).await.unwrap_err();
        assert!(err.is_network());
        assert_eq!(f.engine.cached_clients(), 0);
    }

    #[tokio::test]
    async fn control_passthroughs_reach_the_device() {
        let f = fixture().await;
        f.engine
            .set_component_state(f.id, Component::Relay, 0, ComponentValue::Power(true))
            .await
            .unwrap();
        f.engine.reboot(f.id).await.unwrap();
        assert_eq!(f.device.commands.lock().unwrap().len(), 1);
        assert_eq!(f.device.reboots.load(Ordering::SeqCst), 1);
    }
}
