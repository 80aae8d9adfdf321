use crate::api::Registry;
use crate::conditions::*;
use crate::controllers::pipeline::status::LegacyReasons;
use crate::controllers::pipeline::{PipelineKind, gateway_replicas};
use crate::mesh::IstioStatusChecker;
use crate::overrides::OverrideConfig;
use crate::ports;
use crate::protocol::config::MetricConfig;
use crate::render::otel::{make_metric_agent_config, make_metric_gateway_config};
use crate::resources::otelcollector::{
    AgentApplyConfig, GatewayApplyConfig, IstioConfig, apply_agent_resources,
    apply_gateway_resources,
};
use crate::resources::owner_reference;
use anyhow::Result;
use async_trait::async_trait;
use common::{MetricPipeline, NamespacedName};

pub const LOCK_NAME: &str = "telemetry-metricpipeline-lock";

/// The agent is only needed for inputs collected on the nodes.
pub fn is_agent_required(pipeline: &MetricPipeline) -> bool {
    let input = &pipeline.spec.input;
    input.runtime_enabled() || input.prometheus_enabled() || input.istio_enabled()
}

/// Metric pipelines feed a gateway Deployment and, for node inputs, an agent DaemonSet.
pub struct MetricPipelineKind {
    registry: Registry,
    namespace: String,
    config: MetricConfig,
    istio: IstioStatusChecker,
}

impl MetricPipelineKind {
    pub fn new(registry: Registry, namespace: impl Into<String>, config: MetricConfig) -> Self {
        Self {
            istio: IstioStatusChecker::new(registry.clone()),
            registry,
            namespace: namespace.into(),
            config,
        }
    }
}

#[async_trait]
impl PipelineKind for MetricPipelineKind {
    type Pipeline = MetricPipeline;

    const SIGNAL: Signal = Signal::Metric;
    const CONTROLLER_NAME: &'static str = "metricpipeline";

    fn paused(overrides: &OverrideConfig) -> bool {
        overrides.metrics.paused
    }

    fn configured_reason(&self) -> &'static str {
        REASON_GATEWAY_CONFIGURED
    }

    fn legacy_reasons(&self) -> LegacyReasons {
        LegacyReasons {
            ready: REASON_METRIC_GATEWAY_DEPLOYMENT_READY,
            not_ready: REASON_METRIC_GATEWAY_DEPLOYMENT_NOT_READY,
        }
    }

    fn gateway(&self) -> Option<NamespacedName> {
        Some(NamespacedName::new(
            self.namespace.clone(),
            self.config.gateway.name.clone(),
        ))
    }

    fn agent(&self, pipeline: &MetricPipeline) -> Option<NamespacedName> {
        is_agent_required(pipeline)
            .then(|| NamespacedName::new(self.namespace.clone(), self.config.agent.name.clone()))
    }

    async fn deploy(&self, owner: &MetricPipeline, reconcilable: &[MetricPipeline]) -> Result<()> {
        let owner_ref = owner_reference(owner);
        let istio_active = self.istio.is_istio_active().await;
        let istio = IstioConfig {
            active: istio_active,
            exclude_ports: ports::METRICS.to_string(),
        };

        let (gateway_config, env) =
            make_metric_gateway_config(&self.registry, reconcilable).await?;
        let mut gateway_ports = vec![
            ports::METRICS,
            ports::HEALTH_CHECK,
            ports::OTLP_HTTP,
            ports::OTLP_GRPC,
        ];
        if istio_active {
            gateway_ports.push(ports::ISTIO_ENVOY);
        }
        let gateway = GatewayApplyConfig {
            gateway: &self.config.gateway,
            namespace: &self.namespace,
            replicas: gateway_replicas(&self.registry, Self::SIGNAL).await,
            resource_multiplier: reconcilable.len() as u32,
            collector_config: gateway_config.to_yaml()?,
            env,
            allowed_ports: gateway_ports,
            istio: istio.clone(),
        };
        apply_gateway_resources(&self.registry, &owner_ref, &gateway).await?;

        if !reconcilable.iter().any(is_agent_required) {
            log::info!(
                "metric gateway configured with {} pipelines, no agent required",
                reconcilable.len()
            );
            return Ok(());
        }

        let gateway_service = NamespacedName::new(
            self.namespace.clone(),
            self.config.gateway.otlp_service_name.clone(),
        );
        let agent_config = make_metric_agent_config(&gateway_service, reconcilable, istio_active);
        let mut agent_ports = vec![ports::METRICS, ports::HEALTH_CHECK];
        if istio_active {
            agent_ports.push(ports::ISTIO_ENVOY);
        }
        let agent = AgentApplyConfig {
            agent: &self.config.agent,
            namespace: &self.namespace,
            collector_config: agent_config.to_yaml()?,
            allowed_ports: agent_ports,
            istio,
        };
        apply_agent_resources(&self.registry, &owner_ref, &agent).await?;
        log::info!(
            "metric gateway and agent configured with {} pipelines",
            reconcilable.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MetricInputToggle, MetricPipelineInput, MetricPipelineSpec};

    #[test]
    fn test_agent_required_for_node_inputs() {
        let mut pipeline = MetricPipeline::new("p1", MetricPipelineSpec::default());
        assert!(!is_agent_required(&pipeline));
        pipeline.spec.input = MetricPipelineInput {
            prometheus: Some(MetricInputToggle { enabled: true }),
            ..Default::default()
        };
        assert!(is_agent_required(&pipeline));
    }
}
