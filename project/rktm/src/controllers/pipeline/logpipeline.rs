use crate::api::Registry;
use crate::conditions::*;
use crate::controllers::pipeline::PipelineKind;
use crate::controllers::pipeline::status::LegacyReasons;
use crate::overrides::OverrideConfig;
use crate::ports;
use crate::protocol::config::LogConfig;
use crate::render::fluentbit::make_fluent_bit_config;
use crate::resources::fluentbit::{FluentBitApplyConfig, apply_fluent_bit_resources};
use crate::resources::owner_reference;
use anyhow::Result;
use async_trait::async_trait;
use common::{LogPipeline, NamespacedName};

pub const LOCK_NAME: &str = "telemetry-logpipeline-lock";

/// Log pipelines are all served by the Fluent Bit DaemonSet.
pub struct LogPipelineKind {
    registry: Registry,
    namespace: String,
    config: LogConfig,
}

impl LogPipelineKind {
    pub fn new(registry: Registry, namespace: impl Into<String>, config: LogConfig) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            config,
        }
    }
}

#[async_trait]
impl PipelineKind for LogPipelineKind {
    type Pipeline = LogPipeline;

    const SIGNAL: Signal = Signal::Log;
    const CONTROLLER_NAME: &'static str = "logpipeline";

    fn paused(overrides: &OverrideConfig) -> bool {
        overrides.logging.paused
    }

    fn configured_reason(&self) -> &'static str {
        REASON_AGENT_CONFIGURED
    }

    fn legacy_reasons(&self) -> LegacyReasons {
        LegacyReasons {
            ready: REASON_FLUENT_BIT_DS_READY,
            not_ready: REASON_FLUENT_BIT_DS_NOT_READY,
        }
    }

    fn gateway(&self) -> Option<NamespacedName> {
        None
    }

    fn agent(&self, _pipeline: &LogPipeline) -> Option<NamespacedName> {
        Some(NamespacedName::new(
            self.namespace.clone(),
            self.config.daemon_set.clone(),
        ))
    }

    async fn deploy(&self, owner: &LogPipeline, reconcilable: &[LogPipeline]) -> Result<()> {
        let config = make_fluent_bit_config(&self.registry, reconcilable).await?;
        let cfg = FluentBitApplyConfig {
            log: &self.config,
            namespace: &self.namespace,
            config,
            allowed_ports: vec![ports::FLUENT_BIT_HTTP, ports::FLUENT_BIT_EXPORTER_METRICS],
        };
        apply_fluent_bit_resources(&self.registry, &owner_reference(owner), &cfg).await?;
        log::info!("fluent bit configured with {} pipelines", reconcilable.len());
        Ok(())
    }
}
