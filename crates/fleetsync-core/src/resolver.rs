// ── Hierarchy resolver ──
//
// Desired configuration = system defaults, then each applied template in
// order, then the device's own overrides. Layers merge per capability
// group and field by field. Pure; the engine supplies the layers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{ConfigTemplate, DeviceConfiguration, TemplateId};

/// Layer that last set a top-level key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    System,
    Template(TemplateId),
    Override,
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Template(id) => write!(f, "template:{id}"),
            Self::Override => f.write_str("override"),
        }
    }
}

impl Serialize for ConfigLayer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Resolver output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfiguration {
    pub config: DeviceConfiguration,
    /// Per top-level key (group name or unknown key), the winning layer.
    pub sources: BTreeMap<String, ConfigLayer>,
}

/// Resolve the desired configuration from its layers.
pub fn resolve(
    system: &DeviceConfiguration,
    templates: &[ConfigTemplate],
    overrides: &Value,
) -> Result<ResolvedConfiguration, CoreError> {
    let mut resolved = ResolvedConfiguration {
        config: DeviceConfiguration::default(),
        sources: BTreeMap::new(),
    };

    apply_layer(&mut resolved, system, ConfigLayer::System);
    for template in templates {
        let layer = DeviceConfiguration::from_blob(&template.config).map_err(|e| {
            CoreError::validation(format!("template '{}': {e}", template.name))
        })?;
        apply_layer(&mut resolved, &layer, ConfigLayer::Template(template.id));
    }
    let overrides = DeviceConfiguration::from_blob(overrides)
        .map_err(|e| CoreError::validation(format!("device overrides: {e}")))?;
    apply_layer(&mut resolved, &overrides, ConfigLayer::Override);

    Ok(resolved)
}

fn apply_layer(resolved: &mut ResolvedConfiguration, layer: &DeviceConfiguration, source: ConfigLayer) {
    for group in layer.present_groups() {
        resolved.sources.insert(group.to_string(), source);
    }
    for key in layer.extra.keys() {
        resolved.sources.insert(key.clone(), source);
    }
    resolved.config.overlay(layer);
}
