use crate::api::Registry;
use crate::errors::ControllerError;
use anyhow::{Context, Result};
use common::{ConfigMap, NamespacedName};
use log::LevelFilter;
use serde::Deserialize;

/// Data key holding the override YAML inside the override ConfigMap.
pub const OVERRIDE_KEY: &str = "override-config";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GlobalOverrides {
    #[serde(rename = "logLevel", default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PauseOverride {
    #[serde(default)]
    pub paused: bool,
}

/// Operator-supplied switches for debugging a live installation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OverrideConfig {
    #[serde(default)]
    pub global: GlobalOverrides,
    #[serde(default)]
    pub tracing: PauseOverride,
    #[serde(default)]
    pub metrics: PauseOverride,
    #[serde(default)]
    pub logging: PauseOverride,
    #[serde(default)]
    pub telemetry: PauseOverride,
}

pub struct OverridesHandler {
    registry: Registry,
    config_map: NamespacedName,
    default_level: LevelFilter,
}

impl OverridesHandler {
    pub fn new(registry: Registry, config_map: NamespacedName, default_level: LevelFilter) -> Self {
        Self {
            registry,
            config_map,
            default_level,
        }
    }

    /// Read the override ConfigMap and apply its log level.
    ///
    /// A missing ConfigMap or key means no overrides and restores the default level.
    pub async fn load_overrides(&self) -> Result<OverrideConfig> {
        let overrides = match self.registry.get::<ConfigMap>(&self.config_map).await? {
            Some(cm) => match cm.object.data.get(OVERRIDE_KEY) {
                Some(raw) if !raw.trim().is_empty() => serde_yaml::from_str(raw)
                    .with_context(|| format!("failed to parse override config {}", self.config_map))?,
                _ => OverrideConfig::default(),
            },
            None => OverrideConfig::default(),
        };

        let level = match overrides.global.log_level.as_deref() {
            Some(raw) => raw.parse::<LevelFilter>().map_err(|_| {
                ControllerError::ConfigurationInvalid(format!("unknown log level {raw:?}"))
            })?,
            None => self.default_level,
        };
        if log::max_level() != level {
            log::info!("switching log level to {level}");
            log::set_max_level(level);
        }
        Ok(overrides)
    }
}
