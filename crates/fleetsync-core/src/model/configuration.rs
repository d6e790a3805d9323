// ── Canonical device configuration ──
//
// Generation-neutral configuration, keyed by capability group. Every
// group has explicit optional fields plus a bag for keys we do not
// model, so blobs written by newer tooling round-trip untouched. Groups
// describe the device's primary channel (0).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::device::json_type;
use crate::error::CoreError;

/// Power-on behaviour of a switched or dimmed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputDefaultState {
    Off,
    On,
    /// Restore the state from before power loss.
    Last,
    /// Follow the physical input.
    MatchInput,
}

/// Power-on behaviour of a roller/cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RollerDefaultState {
    Stop,
    Open,
    Close,
}

/// Top-level capability groups.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityGroup {
    Relay,
    Dimming,
    Roller,
    PowerMetering,
    Input,
    Led,
    Color,
}

impl CapabilityGroup {
    pub const ALL: [Self; 7] = [
        Self::Relay,
        Self::Dimming,
        Self::Roller,
        Self::PowerMetering,
        Self::Input,
        Self::Led,
        Self::Color,
    ];
}

// ── Groups ──────────────────────────────────────────────────────────

/// Overlay `other` onto `self` field by field: set fields in `other`
/// win, unset fields leave `self` alone, bag entries are merged.
macro_rules! overlay_fields {
    ($target:ident, $layer:ident; $($field:ident),+ $(,)?) => {
        $(
            if $layer.$field.is_some() {
                $target.$field.clone_from(&$layer.$field);
            }
        )+
        for (key, value) in &$layer.extra {
            $target.extra.insert(key.clone(), value.clone());
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<OutputDefaultState>,
    /// Seconds until the output turns back on; 0 disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_on_secs: Option<f64>,
    /// Seconds until the output turns back off; 0 disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_off_secs: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelayConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(self, layer; name, default_state, auto_on_secs, auto_off_secs);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimmingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<OutputDefaultState>,
    /// Brightness applied when turned on, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_on_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_off_secs: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DimmingConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(
            self, layer;
            default_state, default_brightness, min_brightness, transition_ms,
            auto_on_secs, auto_off_secs,
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_state: Option<RollerDefaultState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_open_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_close_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_directions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_inputs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstacle_detection: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RollerConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(
            self, layer;
            default_state, max_time_open_secs, max_time_close_secs, swap_directions,
            swap_inputs, obstacle_detection,
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerMeteringConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limit_watts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_limit_volts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_limit_amps: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PowerMeteringConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(self, layer; power_limit_watts, voltage_limit_volts, current_limit_amps);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Input behaviour (`momentary`, `toggle`, `edge`, `detached`, `button`, `switch`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invert: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(self, layer; mode, invert);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_indication_disabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LedConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(self, layer; status_disabled, power_indication_disabled);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub green: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub white: Option<u8>,
    /// Overall output gain, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ColorConfig {
    fn overlay(&mut self, layer: &Self) {
        overlay_fields!(self, layer; mode, red, green, blue, white, gain);
    }
}

// ── DeviceConfiguration ─────────────────────────────────────────────

/// Canonical configuration of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimming: Option<DimmingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roller: Option<RollerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_metering: Option<PowerMeteringConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led: Option<LedConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorConfig>,
    /// Unknown top-level keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn overlay_group<T: Default>(target: &mut Option<T>, layer: Option<&T>, apply: fn(&mut T, &T)) {
    if let Some(layer) = layer {
        apply(target.get_or_insert_with(T::default), layer);
    }
}

impl DeviceConfiguration {
    /// Read and validate a configuration blob. `null` reads as empty.
    pub fn from_blob(blob: &Value) -> Result<Self, CoreError> {
        match blob {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => {
                let config: Self = serde_json::from_value(blob.clone())
                    .map_err(|e| CoreError::validation(format!("invalid configuration: {e}")))?;
                config.check_percentages()?;
                Ok(config)
            }
            other => Err(CoreError::validation(format!(
                "configuration must be an object, got {}",
                json_type(other)
            ))),
        }
    }

    fn check_percentages(&self) -> Result<(), CoreError> {
        let dimming = self.dimming.as_ref();
        let fields = [
            ("dimming.default_brightness", dimming.and_then(|d| d.default_brightness)),
            ("dimming.min_brightness", dimming.and_then(|d| d.min_brightness)),
            ("color.gain", self.color.as_ref().and_then(|c| c.gain)),
        ];
        for (path, value) in fields {
            if let Some(v) = value.filter(|v| *v > 100) {
                return Err(CoreError::validation(format!("{path} must be 0-100, got {v}")));
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        // Plain structs with string keys always serialize.
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.present_groups().is_empty() && self.extra.is_empty()
    }

    /// Overlay `layer` onto this configuration, group by group and
    /// field by field. Unknown top-level keys in `layer` replace ours.
    pub fn overlay(&mut self, layer: &Self) {
        overlay_group(&mut self.relay, layer.relay.as_ref(), RelayConfig::overlay);
        overlay_group(&mut self.dimming, layer.dimming.as_ref(), DimmingConfig::overlay);
        overlay_group(&mut self.roller, layer.roller.as_ref(), RollerConfig::overlay);
        overlay_group(
            &mut self.power_metering,
            layer.power_metering.as_ref(),
            PowerMeteringConfig::overlay,
        );
        overlay_group(&mut self.input, layer.input.as_ref(), InputConfig::overlay);
        overlay_group(&mut self.led, layer.led.as_ref(), LedConfig::overlay);
        overlay_group(&mut self.color, layer.color.as_ref(), ColorConfig::overlay);
        for (key, value) in &layer.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// Groups that are set, in canonical order.
    pub fn present_groups(&self) -> Vec<CapabilityGroup> {
        CapabilityGroup::ALL
            .into_iter()
            .filter(|g| self.has_group(*g))
            .collect()
    }

    pub fn has_group(&self, group: CapabilityGroup) -> bool {
        match group {
            CapabilityGroup::Relay => self.relay.is_some(),
            CapabilityGroup::Dimming => self.dimming.is_some(),
            CapabilityGroup::Roller => self.roller.is_some(),
            CapabilityGroup::PowerMetering => self.power_metering.is_some(),
            CapabilityGroup::Input => self.input.is_some(),
            CapabilityGroup::Led => self.led.is_some(),
            CapabilityGroup::Color => self.color.is_some(),
        }
    }

    /// JSON value of one group, `None` when unset.
    pub fn group_value(&self, group: CapabilityGroup) -> Option<Value> {
        let value = self.to_value();
        value.get(group.to_string()).cloned()
    }

    /// Replace one group from a JSON blob, validating it.
    pub fn set_group(&mut self, group: CapabilityGroup, blob: &Value) -> Result<(), CoreError> {
        if !blob.is_object() {
            return Err(CoreError::validation(format!(
                "{group} configuration must be an object, got {}",
                json_type(blob)
            )));
        }
        let mut wrapper = Map::new();
        wrapper.insert(group.to_string(), blob.clone());
        let parsed = Self::from_blob(&Value::Object(wrapper))?;
        match group {
            CapabilityGroup::Relay => self.relay = parsed.relay,
            CapabilityGroup::Dimming => self.dimming = parsed.dimming,
            CapabilityGroup::Roller => self.roller = parsed.roller,
            CapabilityGroup::PowerMetering => self.power_metering = parsed.power_metering,
            CapabilityGroup::Input => self.input = parsed.input,
            CapabilityGroup::Led => self.led = parsed.led,
            CapabilityGroup::Color => self.color = parsed.color,
        }
        Ok(())
    }

    /// Copy keeping only `groups`; unknown top-level keys are dropped.
    pub fn restricted_to(&self, groups: &[CapabilityGroup]) -> Self {
        let keep = |g: CapabilityGroup| groups.contains(&g);
        Self {
            relay: self.relay.clone().filter(|_| keep(CapabilityGroup::Relay)),
            dimming: self.dimming.clone().filter(|_| keep(CapabilityGroup::Dimming)),
            roller: self.roller.clone().filter(|_| keep(CapabilityGroup::Roller)),
            power_metering: self
                .power_metering
                .clone()
                .filter(|_| keep(CapabilityGroup::PowerMetering)),
            input: self.input.clone().filter(|_| keep(CapabilityGroup::Input)),
            led: self.led.clone().filter(|_| keep(CapabilityGroup::Led)),
            color: self.color.clone().filter(|_| keep(CapabilityGroup::Color)),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_fields_round_trip() {
        let blob = json!({
            "relay": {"default_state": "on", "schedule_rules": ["0 0 * * *"]},
            "scripts": {"enabled": true}
        });
        let cfg = DeviceConfiguration::from_blob(&blob).unwrap();
        assert_eq!(cfg.relay.as_ref().unwrap().default_state, Some(OutputDefaultState::On));
        assert_eq!(cfg.to_value(), blob);
    }

    #[test]
    fn malformed_blob_is_validation_error() {
        let err = DeviceConfiguration::from_blob(&json!({"relay": {"default_state": 3}}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(DeviceConfiguration::from_blob(&json!("relay")).is_err());
        assert!(DeviceConfiguration::from_blob(&json!({"dimming": {"default_brightness": 900}}))
            .is_err());
    }

    #[test]
    fn percentages_above_hundred_are_rejected() {
        let err = DeviceConfiguration::from_blob(&json!({"dimming": {"default_brightness": 150}}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(err.to_string().contains("dimming.default_brightness must be 0-100, got 150"));
        assert!(DeviceConfiguration::from_blob(&json!({"dimming": {"min_brightness": 101}}))
            .is_err());
        assert!(DeviceConfiguration::from_blob(&json!({"color": {"gain": 255}})).is_err());

        let edge = DeviceConfiguration::from_blob(&json!({
            "dimming": {"default_brightness": 100, "min_brightness": 0},
            "color": {"gain": 100, "red": 255}
        }))
        .unwrap();
        assert_eq!(edge.color.unwrap().red, Some(255));
    }

    #[test]
    fn overlay_is_field_wise_within_group() {
        let mut base = DeviceConfiguration::from_blob(&json!({
            "relay": {"name": "Pump", "default_state": "off", "auto_off_secs": 30}
        }))
        .unwrap();
        let layer = DeviceConfiguration::from_blob(&json!({
            "relay": {"default_state": "last"},
            "led": {"status_disabled": true}
        }))
        .unwrap();
        base.overlay(&layer);
        assert_eq!(
            base.to_value(),
            json!({
                "relay": {"name": "Pump", "default_state": "last", "auto_off_secs": 30.0},
                "led": {"status_disabled": true}
            })
        );
    }

    #[test]
    fn set_group_validates_and_replaces() {
        let mut cfg = DeviceConfiguration::default();
        cfg.set_group(CapabilityGroup::Roller, &json!({"default_state": "open"}))
            .unwrap();
        assert_eq!(cfg.present_groups(), vec![CapabilityGroup::Roller]);
        assert!(cfg.set_group(CapabilityGroup::Roller, &json!(5)).is_err());
        assert!(cfg
            .set_group(CapabilityGroup::Roller, &json!({"default_state": "sideways"}))
            .is_err());
    }

    #[test]
    fn group_names_parse() {
        assert_eq!(
            "power_metering".parse::<CapabilityGroup>().unwrap(),
            CapabilityGroup::PowerMetering
        );
        assert!("bogus".parse::<CapabilityGroup>().is_err());
    }
}
