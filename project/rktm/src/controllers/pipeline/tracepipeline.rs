use crate::api::Registry;
use crate::conditions::*;
use crate::controllers::pipeline::status::LegacyReasons;
use crate::controllers::pipeline::{PipelineKind, gateway_replicas};
use crate::mesh::IstioStatusChecker;
use crate::overrides::OverrideConfig;
use crate::ports;
use crate::protocol::config::TraceConfig;
use crate::render::otel::make_trace_gateway_config;
use crate::resources::otelcollector::{GatewayApplyConfig, IstioConfig, apply_gateway_resources};
use crate::resources::owner_reference;
use anyhow::Result;
use async_trait::async_trait;
use common::{NamespacedName, TracePipeline};

pub const LOCK_NAME: &str = "telemetry-tracepipeline-lock";

/// Trace pipelines feed a single OTLP gateway Deployment.
pub struct TracePipelineKind {
    registry: Registry,
    namespace: String,
    config: TraceConfig,
    istio: IstioStatusChecker,
}

impl TracePipelineKind {
    pub fn new(registry: Registry, namespace: impl Into<String>, config: TraceConfig) -> Self {
        Self {
            istio: IstioStatusChecker::new(registry.clone()),
            registry,
            namespace: namespace.into(),
            config,
        }
    }
}

#[async_trait]
impl PipelineKind for TracePipelineKind {
    type Pipeline = TracePipeline;

    const SIGNAL: Signal = Signal::Trace;
    const CONTROLLER_NAME: &'static str = "tracepipeline";

    fn paused(overrides: &OverrideConfig) -> bool {
        overrides.tracing.paused
    }

    fn configured_reason(&self) -> &'static str {
        REASON_GATEWAY_CONFIGURED
    }

    fn legacy_reasons(&self) -> LegacyReasons {
        LegacyReasons {
            ready: REASON_TRACE_GATEWAY_DEPLOYMENT_READY,
            not_ready: REASON_TRACE_GATEWAY_DEPLOYMENT_NOT_READY,
        }
    }

    fn gateway(&self) -> Option<NamespacedName> {
        Some(NamespacedName::new(
            self.namespace.clone(),
            self.config.gateway.name.clone(),
        ))
    }

    fn agent(&self, _pipeline: &TracePipeline) -> Option<NamespacedName> {
        None
    }

    async fn deploy(&self, owner: &TracePipeline, reconcilable: &[TracePipeline]) -> Result<()> {
        let (collector_config, env) = make_trace_gateway_config(&self.registry, reconcilable).await?;
        let istio_active = self.istio.is_istio_active().await;

        let mut allowed_ports = vec![
            ports::OTLP_HTTP,
            ports::OTLP_GRPC,
            ports::METRICS,
            ports::HEALTH_CHECK,
        ];
        if istio_active {
            allowed_ports.push(ports::ISTIO_ENVOY);
        }

        let cfg = GatewayApplyConfig {
            gateway: &self.config.gateway,
            namespace: &self.namespace,
            replicas: gateway_replicas(&self.registry, Self::SIGNAL).await,
            resource_multiplier: reconcilable.len() as u32,
            collector_config: collector_config.to_yaml()?,
            env,
            allowed_ports,
            istio: IstioConfig {
                active: istio_active,
                exclude_ports: ports::METRICS.to_string(),
            },
        };
        apply_gateway_resources(&self.registry, &owner_reference(owner), &cfg).await?;
        log::info!(
            "trace gateway configured with {} pipelines",
            reconcilable.len()
        );
        Ok(())
    }
}
