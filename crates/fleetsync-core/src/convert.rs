// ── Generation payload <-> canonical configuration ──
//
// Gen1 `/settings` and Gen2 `Shelly.GetConfig` documents are normalized
// into `DeviceConfiguration`; canonical groups are turned back into
// generation-specific `SettingsWrite`s. Only channel 0 is mapped.
//
// Value vocabularies differ per generation:
//
//   canonical      Gen1            Gen2
//   last           last            restore_last
//   match_input    switch          match_input
//   stop/close     stop/close      stopped/closed
//   auto_on_secs   auto_on (0=off) auto_on + auto_on_delay

use std::time::Duration;

use serde_json::{Map, Value, json};

use fleetsync_api::{Component, Generation, SettingsWrite};

use crate::error::CoreError;
use crate::model::device::json_type;
use crate::model::{
    ColorConfig, DeviceConfiguration, DimmingConfig, InputConfig, LedConfig,
    OutputDefaultState, PowerMeteringConfig, RelayConfig, RollerConfig, RollerDefaultState,
};

/// Normalize a full configuration document into the canonical schema.
pub fn normalize(generation: Generation, raw: &Value) -> Result<DeviceConfiguration, CoreError> {
    let obj = raw.as_object().ok_or_else(|| CoreError::Protocol {
        message: format!(
            "{generation} configuration must be an object, got {}",
            json_type(raw)
        ),
    })?;
    Ok(match generation {
        Generation::Gen1 => gen1_to_canonical(obj),
        Generation::Gen2 => gen2_to_canonical(obj),
    })
}

/// Translate canonical groups into the writes that set them on a device.
pub fn to_writes(generation: Generation, config: &DeviceConfiguration) -> Vec<SettingsWrite> {
    let mut writes = WriteSet::default();
    match generation {
        Generation::Gen1 => gen1_writes(config, &mut writes),
        Generation::Gen2 => gen2_writes(config, &mut writes),
    }
    writes.0
}

/// The part of `desired` that [`normalize`] can read back from a device
/// of `generation`.
///
/// Unknown-field bags are written through but never read back, and some
/// canonical fields have no counterpart on one generation.
pub fn observable(generation: Generation, desired: &DeviceConfiguration) -> DeviceConfiguration {
    let mut cfg = desired.clone();
    cfg.extra.clear();
    macro_rules! clear_extra {
        ($($group:ident),+) => {
            $(
                if let Some(group) = cfg.$group.as_mut() {
                    group.extra.clear();
                }
            )+
        };
    }
    clear_extra!(relay, dimming, roller, power_metering, input, led, color);

    match generation {
        Generation::Gen1 => {
            if let Some(dim) = cfg.dimming.as_mut() {
                dim.min_brightness = None;
            }
            if let Some(power) = cfg.power_metering.as_mut() {
                power.voltage_limit_volts = None;
                power.current_limit_amps = None;
            }
        }
        Generation::Gen2 => {
            if let Some(color) = cfg.color.as_mut() {
                color.mode = None;
                // The default colour is written only as a full triple.
                if color.red.is_none() || color.green.is_none() || color.blue.is_none() {
                    color.red = None;
                    color.green = None;
                    color.blue = None;
                }
            }
        }
    }
    cfg
}

// ── Field helpers ───────────────────────────────────────────────────

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn f64_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

fn u8_field(obj: &Map<String, Value>, key: &str) -> Option<u8> {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
}

/// Gen1 reports booleans as either `true`/`false` or `1`/`0`.
fn flag_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }
}

fn object<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// First element of a Gen1 channel array (`relays`, `lights`, `rollers`).
fn first_channel<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key)
        .and_then(Value::as_array)
        .and_then(|channels| channels.first())
        .and_then(Value::as_object)
}

/// Gen2 auto timers: a flag plus a delay. Disabled reads as 0.
fn gen2_timer(obj: &Map<String, Value>, flag: &str, delay: &str) -> Option<f64> {
    let enabled = obj.get(flag).and_then(Value::as_bool)?;
    Some(if enabled {
        f64_field(obj, delay).unwrap_or(0.0)
    } else {
        0.0
    })
}

fn secs_to_ms(secs: f64) -> Option<u32> {
    let millis = Duration::try_from_secs_f64(secs).ok()?.as_millis();
    u32::try_from(millis).ok()
}

// ── Vocabulary ──────────────────────────────────────────────────────

fn gen1_output_state(raw: &str) -> Option<OutputDefaultState> {
    match raw {
        "off" => Some(OutputDefaultState::Off),
        "on" => Some(OutputDefaultState::On),
        "last" => Some(OutputDefaultState::Last),
        "switch" => Some(OutputDefaultState::MatchInput),
        _ => None,
    }
}

fn gen1_output_state_name(state: OutputDefaultState) -> &'static str {
    match state {
        OutputDefaultState::Off => "off",
        OutputDefaultState::On => "on",
        OutputDefaultState::Last => "last",
        OutputDefaultState::MatchInput => "switch",
    }
}

fn gen2_output_state(raw: &str) -> Option<OutputDefaultState> {
    match raw {
        "off" => Some(OutputDefaultState::Off),
        "on" => Some(OutputDefaultState::On),
        "restore_last" => Some(OutputDefaultState::Last),
        "match_input" => Some(OutputDefaultState::MatchInput),
        _ => None,
    }
}

fn gen2_output_state_name(state: OutputDefaultState) -> &'static str {
    match state {
        OutputDefaultState::Off => "off",
        OutputDefaultState::On => "on",
        OutputDefaultState::Last => "restore_last",
        OutputDefaultState::MatchInput => "match_input",
    }
}

fn gen1_roller_state(raw: &str) -> Option<RollerDefaultState> {
    match raw {
        "stop" => Some(RollerDefaultState::Stop),
        "open" => Some(RollerDefaultState::Open),
        "close" => Some(RollerDefaultState::Close),
        _ => None,
    }
}

fn gen2_roller_state(raw: &str) -> Option<RollerDefaultState> {
    match raw {
        "stopped" => Some(RollerDefaultState::Stop),
        "open" => Some(RollerDefaultState::Open),
        "closed" => Some(RollerDefaultState::Close),
        _ => None,
    }
}

fn gen2_roller_state_name(state: RollerDefaultState) -> &'static str {
    match state {
        RollerDefaultState::Stop => "stopped",
        RollerDefaultState::Open => "open",
        RollerDefaultState::Close => "closed",
    }
}

/// Gen2 plug UI has one LED mode instead of two flags.
fn gen2_led_mode(led: &LedConfig) -> &'static str {
    let status_off = led.status_disabled.unwrap_or(false);
    let power_off = led.power_indication_disabled.unwrap_or(false);
    match (status_off, power_off) {
        (true, true) => "off",
        (_, false) => "power",
        (false, true) => "switch",
    }
}

// ── Gen1 → canonical ────────────────────────────────────────────────

fn gen1_to_canonical(obj: &Map<String, Value>) -> DeviceConfiguration {
    let mut cfg = DeviceConfiguration::default();

    if let Some(relay) = first_channel(obj, "relays") {
        cfg.relay = Some(RelayConfig {
            name: str_field(relay, "name"),
            default_state: str_field(relay, "default_state")
                .as_deref()
                .and_then(gen1_output_state),
            auto_on_secs: f64_field(relay, "auto_on"),
            auto_off_secs: f64_field(relay, "auto_off"),
            extra: Map::new(),
        });
        if relay.contains_key("btn_type") || relay.contains_key("btn_reverse") {
            cfg.input = Some(InputConfig {
                mode: str_field(relay, "btn_type"),
                invert: flag_field(relay, "btn_reverse"),
                extra: Map::new(),
            });
        }
    }

    if let Some(light) = first_channel(obj, "lights") {
        if light.contains_key("brightness") {
            cfg.dimming = Some(DimmingConfig {
                default_state: str_field(light, "default_state")
                    .as_deref()
                    .and_then(gen1_output_state),
                default_brightness: u8_field(light, "brightness"),
                min_brightness: None,
                transition_ms: obj
                    .get("transition")
                    .or_else(|| light.get("transition"))
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
                auto_on_secs: f64_field(light, "auto_on"),
                auto_off_secs: f64_field(light, "auto_off"),
                extra: Map::new(),
            });
        }
        if light.contains_key("red") {
            cfg.color = Some(ColorConfig {
                mode: str_field(obj, "mode"),
                red: u8_field(light, "red"),
                green: u8_field(light, "green"),
                blue: u8_field(light, "blue"),
                white: u8_field(light, "white"),
                gain: u8_field(light, "gain"),
                extra: Map::new(),
            });
        }
    }

    if let Some(roller) = first_channel(obj, "rollers") {
        cfg.roller = Some(RollerConfig {
            default_state: str_field(roller, "default_state")
                .as_deref()
                .and_then(gen1_roller_state),
            max_time_open_secs: f64_field(roller, "maxtime_open"),
            max_time_close_secs: f64_field(roller, "maxtime_close"),
            swap_directions: flag_field(roller, "swap"),
            swap_inputs: flag_field(roller, "swap_inputs"),
            obstacle_detection: str_field(roller, "obstacle_mode").map(|m| m != "disabled"),
            extra: Map::new(),
        });
    }

    if let Some(max_power) = f64_field(obj, "max_power") {
        cfg.power_metering = Some(PowerMeteringConfig {
            power_limit_watts: Some(max_power),
            ..PowerMeteringConfig::default()
        });
    }

    if obj.contains_key("led_status_disable") || obj.contains_key("led_power_disable") {
        cfg.led = Some(LedConfig {
            status_disabled: flag_field(obj, "led_status_disable"),
            power_indication_disabled: flag_field(obj, "led_power_disable"),
            extra: Map::new(),
        });
    }

    cfg
}

// ── Gen2 → canonical ────────────────────────────────────────────────

fn gen2_to_canonical(obj: &Map<String, Value>) -> DeviceConfiguration {
    let mut cfg = DeviceConfiguration::default();

    if let Some(switch) = object(obj, "switch:0") {
        cfg.relay = Some(RelayConfig {
            name: str_field(switch, "name"),
            default_state: str_field(switch, "initial_state")
                .as_deref()
                .and_then(gen2_output_state),
            auto_on_secs: gen2_timer(switch, "auto_on", "auto_on_delay"),
            auto_off_secs: gen2_timer(switch, "auto_off", "auto_off_delay"),
            extra: Map::new(),
        });
    }

    if let Some(light) = object(obj, "light:0") {
        cfg.dimming = Some(DimmingConfig {
            default_state: str_field(light, "initial_state")
                .as_deref()
                .and_then(gen2_output_state),
            default_brightness: object(light, "default").and_then(|d| u8_field(d, "brightness")),
            min_brightness: u8_field(light, "min_brightness_on_toggle"),
            transition_ms: f64_field(light, "transition_duration").and_then(secs_to_ms),
            auto_on_secs: gen2_timer(light, "auto_on", "auto_on_delay"),
            auto_off_secs: gen2_timer(light, "auto_off", "auto_off_delay"),
            extra: Map::new(),
        });
    }

    if let Some(cover) = object(obj, "cover:0") {
        cfg.roller = Some(RollerConfig {
            default_state: str_field(cover, "initial_state")
                .as_deref()
                .and_then(gen2_roller_state),
            max_time_open_secs: f64_field(cover, "maxtime_open"),
            max_time_close_secs: f64_field(cover, "maxtime_close"),
            swap_directions: flag_field(cover, "invert_directions"),
            swap_inputs: flag_field(cover, "swap_inputs"),
            obstacle_detection: object(cover, "obstacle_detection")
                .and_then(|o| flag_field(o, "enable")),
            extra: Map::new(),
        });
    }

    let metered = ["switch:0", "cover:0", "light:0"]
        .into_iter()
        .filter_map(|key| object(obj, key))
        .find(|c| c.contains_key("power_limit"));
    if let Some(component) = metered {
        cfg.power_metering = Some(PowerMeteringConfig {
            power_limit_watts: f64_field(component, "power_limit"),
            voltage_limit_volts: f64_field(component, "voltage_limit"),
            current_limit_amps: f64_field(component, "current_limit"),
            extra: Map::new(),
        });
    }

    if let Some(input) = object(obj, "input:0") {
        cfg.input = Some(InputConfig {
            mode: str_field(input, "type"),
            invert: flag_field(input, "invert"),
            extra: Map::new(),
        });
    }

    if let Some(mode) = object(obj, "plugs_ui")
        .and_then(|ui| object(ui, "leds"))
        .and_then(|leds| str_field(leds, "mode"))
    {
        cfg.led = Some(LedConfig {
            status_disabled: Some(mode == "off"),
            power_indication_disabled: Some(mode != "power"),
            extra: Map::new(),
        });
    }

    if let Some(rgb) = object(obj, "rgb:0").or_else(|| object(obj, "rgbw:0")) {
        let defaults = object(rgb, "default");
        let channel = |idx: usize| {
            defaults
                .and_then(|d| d.get("rgb"))
                .and_then(Value::as_array)
                .and_then(|a| a.get(idx))
                .and_then(Value::as_u64)
                .and_then(|n| u8::try_from(n).ok())
        };
        cfg.color = Some(ColorConfig {
            mode: Some("color".into()),
            red: channel(0),
            green: channel(1),
            blue: channel(2),
            white: defaults.and_then(|d| u8_field(d, "white")),
            gain: defaults.and_then(|d| u8_field(d, "brightness")),
            extra: Map::new(),
        });
    }

    cfg
}

// ── Canonical → writes ──────────────────────────────────────────────

/// Writes grouped by component, channel 0, in first-touched order.
#[derive(Default)]
struct WriteSet(Vec<SettingsWrite>);

impl WriteSet {
    fn fields(&mut self, component: Component) -> &mut Map<String, Value> {
        let idx = match self.0.iter().position(|w| w.component == component) {
            Some(idx) => idx,
            None => {
                self.0.push(SettingsWrite {
                    component,
                    channel: 0,
                    fields: Map::new(),
                });
                self.0.len() - 1
            }
        };
        &mut self.0[idx].fields
    }

    fn set(&mut self, component: Component, key: &str, value: Option<Value>) {
        if let Some(value) = value {
            self.fields(component).insert(key.to_owned(), value);
        }
    }

    /// Forward keys we do not model verbatim.
    fn passthrough(&mut self, component: Component, extra: &Map<String, Value>) {
        if extra.is_empty() {
            return;
        }
        let fields = self.fields(component);
        for (key, value) in extra {
            fields.insert(key.clone(), value.clone());
        }
    }
}

fn gen1_writes(cfg: &DeviceConfiguration, w: &mut WriteSet) {
    if let Some(relay) = &cfg.relay {
        w.set(Component::Relay, "name", relay.name.clone().map(Value::from));
        w.set(
            Component::Relay,
            "default_state",
            relay.default_state.map(|s| json!(gen1_output_state_name(s))),
        );
        w.set(Component::Relay, "auto_on", relay.auto_on_secs.map(Value::from));
        w.set(Component::Relay, "auto_off", relay.auto_off_secs.map(Value::from));
        w.passthrough(Component::Relay, &relay.extra);
    }

    if let Some(input) = &cfg.input {
        w.set(Component::Relay, "btn_type", input.mode.clone().map(Value::from));
        w.set(
            Component::Relay,
            "btn_reverse",
            input.invert.map(|b| json!(u8::from(b))),
        );
        w.passthrough(Component::Relay, &input.extra);
    }

    if let Some(dim) = &cfg.dimming {
        w.set(
            Component::Light,
            "default_state",
            dim.default_state.map(|s| json!(gen1_output_state_name(s))),
        );
        w.set(Component::Light, "brightness", dim.default_brightness.map(Value::from));
        w.set(Component::Light, "transition", dim.transition_ms.map(Value::from));
        w.set(Component::Light, "auto_on", dim.auto_on_secs.map(Value::from));
        w.set(Component::Light, "auto_off", dim.auto_off_secs.map(Value::from));
        w.passthrough(Component::Light, &dim.extra);
    }

    if let Some(color) = &cfg.color {
        w.set(Component::Device, "mode", color.mode.clone().map(Value::from));
        w.set(Component::Light, "red", color.red.map(Value::from));
        w.set(Component::Light, "green", color.green.map(Value::from));
        w.set(Component::Light, "blue", color.blue.map(Value::from));
        w.set(Component::Light, "white", color.white.map(Value::from));
        w.set(Component::Light, "gain", color.gain.map(Value::from));
        w.passthrough(Component::Light, &color.extra);
    }

    if let Some(roller) = &cfg.roller {
        w.set(
            Component::Roller,
            "default_state",
            roller.default_state.map(|s| json!(s.to_string())),
        );
        w.set(Component::Roller, "maxtime_open", roller.max_time_open_secs.map(Value::from));
        w.set(Component::Roller, "maxtime_close", roller.max_time_close_secs.map(Value::from));
        w.set(Component::Roller, "swap", roller.swap_directions.map(Value::from));
        w.set(Component::Roller, "swap_inputs", roller.swap_inputs.map(Value::from));
        w.set(
            Component::Roller,
            "obstacle_mode",
            roller
                .obstacle_detection
                .map(|on| json!(if on { "while_moving" } else { "disabled" })),
        );
        w.passthrough(Component::Roller, &roller.extra);
    }

    if let Some(power) = &cfg.power_metering {
        // Gen1 only knows a power limit.
        w.set(Component::Device, "max_power", power.power_limit_watts.map(Value::from));
        w.passthrough(Component::Device, &power.extra);
    }

    if let Some(led) = &cfg.led {
        w.set(Component::Device, "led_status_disable", led.status_disabled.map(Value::from));
        w.set(
            Component::Device,
            "led_power_disable",
            led.power_indication_disabled.map(Value::from),
        );
        w.passthrough(Component::Device, &led.extra);
    }
}

fn gen2_timer_fields(w: &mut WriteSet, component: Component, prefix: &str, secs: Option<f64>) {
    let Some(secs) = secs else {
        return;
    };
    let enabled = secs > 0.0;
    w.set(component, prefix, Some(json!(enabled)));
    if enabled {
        w.set(component, &format!("{prefix}_delay"), Some(json!(secs)));
    }
}

fn gen2_writes(cfg: &DeviceConfiguration, w: &mut WriteSet) {
    if let Some(relay) = &cfg.relay {
        w.set(Component::Relay, "name", relay.name.clone().map(Value::from));
        w.set(
            Component::Relay,
            "initial_state",
            relay.default_state.map(|s| json!(gen2_output_state_name(s))),
        );
        gen2_timer_fields(w, Component::Relay, "auto_on", relay.auto_on_secs);
        gen2_timer_fields(w, Component::Relay, "auto_off", relay.auto_off_secs);
        w.passthrough(Component::Relay, &relay.extra);
    }

    if let Some(dim) = &cfg.dimming {
        w.set(
            Component::Light,
            "initial_state",
            dim.default_state.map(|s| json!(gen2_output_state_name(s))),
        );
        w.set(
            Component::Light,
            "default",
            dim.default_brightness.map(|b| json!({ "brightness": b })),
        );
        w.set(
            Component::Light,
            "min_brightness_on_toggle",
            dim.min_brightness.map(Value::from),
        );
        w.set(
            Component::Light,
            "transition_duration",
            dim.transition_ms.map(|ms| json!(f64::from(ms) / 1000.0)),
        );
        gen2_timer_fields(w, Component::Light, "auto_on", dim.auto_on_secs);
        gen2_timer_fields(w, Component::Light, "auto_off", dim.auto_off_secs);
        w.passthrough(Component::Light, &dim.extra);
    }

    if let Some(roller) = &cfg.roller {
        w.set(
            Component::Roller,
            "initial_state",
            roller.default_state.map(|s| json!(gen2_roller_state_name(s))),
        );
        w.set(Component::Roller, "maxtime_open", roller.max_time_open_secs.map(Value::from));
        w.set(Component::Roller, "maxtime_close", roller.max_time_close_secs.map(Value::from));
        w.set(Component::Roller, "invert_directions", roller.swap_directions.map(Value::from));
        w.set(Component::Roller, "swap_inputs", roller.swap_inputs.map(Value::from));
        w.set(
            Component::Roller,
            "obstacle_detection",
            roller.obstacle_detection.map(|on| json!({ "enable": on })),
        );
        w.passthrough(Component::Roller, &roller.extra);
    }

    if let Some(power) = &cfg.power_metering {
        // Limits live on whichever output component meters power.
        let target = if cfg.roller.is_some() {
            Component::Roller
        } else {
            Component::Relay
        };
        w.set(target, "power_limit", power.power_limit_watts.map(Value::from));
        w.set(target, "voltage_limit", power.voltage_limit_volts.map(Value::from));
        w.set(target, "current_limit", power.current_limit_amps.map(Value::from));
        w.passthrough(target, &power.extra);
    }

    if let Some(input) = &cfg.input {
        w.set(Component::Input, "type", input.mode.clone().map(Value::from));
        w.set(Component::Input, "invert", input.invert.map(Value::from));
        w.passthrough(Component::Input, &input.extra);
    }

    if let Some(led) = &cfg.led {
        w.set(Component::Ui, "leds", Some(json!({ "mode": gen2_led_mode(led) })));
        w.passthrough(Component::Ui, &led.extra);
    }

    if let Some(color) = &cfg.color {
        let mut defaults = Map::new();
        if let (Some(r), Some(g), Some(b)) = (color.red, color.green, color.blue) {
            defaults.insert("rgb".into(), json!([r, g, b]));
        }
        if let Some(white) = color.white {
            defaults.insert("white".into(), json!(white));
        }
        if let Some(gain) = color.gain {
            defaults.insert("brightness".into(), json!(gain));
        }
        if !defaults.is_empty() {
            w.set(Component::Color, "default", Some(Value::Object(defaults)));
        }
        w.passthrough(Component::Color, &color.extra);
    }
}
