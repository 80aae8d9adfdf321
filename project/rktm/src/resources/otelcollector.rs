//! OpenTelemetry collector gateway (Deployment) and agent (DaemonSet).

use crate::api::Registry;
use crate::ports;
use crate::protocol::config::{AgentConfig, GatewayConfig};
use crate::render::EnvVars;
use crate::resources::{
    CHECKSUM_ANNOTATION, apply_owned, config_checksum, resource_requirements, selector_labels,
};
use anyhow::{Context, Result};
use common::{
    ConfigMap, ContainerPort, ContainerSpec, DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec,
    LabelSelector, NetworkPolicy, NetworkPolicySpec, ObjectMeta, OwnerReference, PodSpec,
    PodTemplateSpec, Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use std::collections::BTreeMap;

pub const CONFIG_FILE: &str = "relay.conf";
const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT: &str = "/conf";

pub const ISTIO_EXCLUDE_INBOUND_PORTS: &str = "traffic.sidecar.istio.io/excludeInboundPorts";
pub const ISTIO_INJECT: &str = "sidecar.istio.io/inject";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IstioConfig {
    pub active: bool,
    /// Ports the sidecar must not intercept, comma separated.
    pub exclude_ports: String,
}

#[derive(Debug, Clone)]
pub struct GatewayApplyConfig<'a> {
    pub gateway: &'a GatewayConfig,
    pub namespace: &'a str,
    pub replicas: i32,
    pub resource_multiplier: u32,
    pub collector_config: String,
    pub env: EnvVars,
    pub allowed_ports: Vec<i32>,
    pub istio: IstioConfig,
}

#[derive(Debug, Clone)]
pub struct AgentApplyConfig<'a> {
    pub agent: &'a AgentConfig,
    pub namespace: &'a str,
    pub collector_config: String,
    pub allowed_ports: Vec<i32>,
    pub istio: IstioConfig,
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    let mut meta = ObjectMeta::namespaced(namespace, name);
    meta.labels = selector_labels(name);
    meta
}

fn pod_annotations(checksum: String, istio: &IstioConfig) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([(CHECKSUM_ANNOTATION.to_string(), checksum)]);
    if istio.active {
        annotations.insert(ISTIO_INJECT.to_string(), "true".to_string());
        annotations.insert(
            ISTIO_EXCLUDE_INBOUND_PORTS.to_string(),
            istio.exclude_ports.clone(),
        );
    } else {
        annotations.insert(ISTIO_INJECT.to_string(), "false".to_string());
    }
    annotations
}

fn collector_container(
    image: &str,
    env_secret: Option<String>,
    ports: Vec<ContainerPort>,
    resources: common::ResourceRequirements,
) -> ContainerSpec {
    ContainerSpec {
        name: "collector".to_string(),
        image: image.to_string(),
        args: vec![format!("--config={CONFIG_MOUNT}/{CONFIG_FILE}")],
        ports,
        env_from_secret: env_secret,
        resources,
        volume_mounts: vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT.to_string(),
        }],
    }
}

fn port(name: &str, number: i32) -> ContainerPort {
    ContainerPort {
        name: name.to_string(),
        container_port: number,
        protocol: "TCP".to_string(),
    }
}

fn service_port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: name.to_string(),
        port: number,
        target_port: number,
        protocol: "TCP".to_string(),
    }
}

async fn apply_network_policy(
    registry: &Registry,
    namespace: &str,
    name: &str,
    allowed_ports: &[i32],
    owner: &OwnerReference,
) -> Result<()> {
    let mut ports = allowed_ports.to_vec();
    ports.sort_unstable();
    ports.dedup();
    let policy = NetworkPolicy::new(
        meta(namespace, name),
        NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: selector_labels(name),
            },
            ingress_ports: ports,
        },
    );
    apply_owned(registry, policy, owner)
        .await
        .with_context(|| format!("failed to apply network policy {namespace}/{name}"))?;
    Ok(())
}

/// Config map, env secret, deployment, services and network policy of a gateway.
pub async fn apply_gateway_resources(
    registry: &Registry,
    owner: &OwnerReference,
    cfg: &GatewayApplyConfig<'_>,
) -> Result<()> {
    let name = cfg.gateway.name.as_str();
    let ns = cfg.namespace;

    let config = BTreeMap::from([(CONFIG_FILE.to_string(), cfg.collector_config.clone())]);
    apply_owned(registry, ConfigMap::new(meta(ns, name), config.clone()), owner)
        .await
        .with_context(|| format!("failed to apply config map {ns}/{name}"))?;
    apply_owned(registry, Secret::new(meta(ns, name), cfg.env.clone()), owner)
        .await
        .with_context(|| format!("failed to apply env secret {ns}/{name}"))?;

    let checksum = config_checksum(&config, &cfg.env);
    let mut template_meta = ObjectMeta::named(name);
    template_meta.labels = selector_labels(name);
    template_meta.annotations = pod_annotations(checksum, &cfg.istio);
    let deployment = Deployment::new(
        meta(ns, name),
        DeploymentSpec {
            replicas: cfg.replicas,
            selector: LabelSelector {
                match_labels: selector_labels(name),
            },
            template: PodTemplateSpec {
                metadata: template_meta,
                spec: PodSpec {
                    containers: vec![collector_container(
                        &cfg.gateway.image,
                        Some(name.to_string()),
                        vec![
                            port("grpc-collector", ports::OTLP_GRPC),
                            port("http-collector", ports::OTLP_HTTP),
                            port("http-metrics", ports::METRICS),
                            port("health-check", ports::HEALTH_CHECK),
                        ],
                        resource_requirements(&cfg.gateway.resources, cfg.resource_multiplier),
                    )],
                    volumes: vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(name.to_string()),
                        secret: None,
                    }],
                    priority_class_name: cfg.gateway.priority_class_name.clone(),
                },
            },
        },
    );
    apply_owned(registry, deployment, owner)
        .await
        .with_context(|| format!("failed to apply deployment {ns}/{name}"))?;

    let otlp = Service::new(
        meta(ns, &cfg.gateway.otlp_service_name),
        ServiceSpec {
            selector: selector_labels(name),
            ports: vec![
                service_port("grpc-collector", ports::OTLP_GRPC),
                service_port("http-collector", ports::OTLP_HTTP),
            ],
        },
    );
    apply_owned(registry, otlp, owner)
        .await
        .with_context(|| format!("failed to apply otlp service of {ns}/{name}"))?;

    let metrics = Service::new(
        meta(ns, &format!("{name}-metrics")),
        ServiceSpec {
            selector: selector_labels(name),
            ports: vec![service_port("http-metrics", ports::METRICS)],
        },
    );
    apply_owned(registry, metrics, owner)
        .await
        .with_context(|| format!("failed to apply metrics service of {ns}/{name}"))?;

    apply_network_policy(registry, ns, name, &cfg.allowed_ports, owner).await
}

/// Config map, daemonset, metrics service and network policy of an agent.
pub async fn apply_agent_resources(
    registry: &Registry,
    owner: &OwnerReference,
    cfg: &AgentApplyConfig<'_>,
) -> Result<()> {
    let name = cfg.agent.name.as_str();
    let ns = cfg.namespace;

    let config = BTreeMap::from([(CONFIG_FILE.to_string(), cfg.collector_config.clone())]);
    apply_owned(registry, ConfigMap::new(meta(ns, name), config.clone()), owner)
        .await
        .with_context(|| format!("failed to apply config map {ns}/{name}"))?;

    let checksum = config_checksum(&config, &BTreeMap::new());
    let mut template_meta = ObjectMeta::named(name);
    template_meta.labels = selector_labels(name);
    template_meta.annotations = pod_annotations(checksum, &cfg.istio);
    let daemon_set = DaemonSet::new(
        meta(ns, name),
        DaemonSetSpec {
            selector: LabelSelector {
                match_labels: selector_labels(name),
            },
            template: PodTemplateSpec {
                metadata: template_meta,
                spec: PodSpec {
                    containers: vec![collector_container(
                        &cfg.agent.image,
                        None,
                        vec![
                            port("http-metrics", ports::METRICS),
                            port("health-check", ports::HEALTH_CHECK),
                        ],
                        resource_requirements(&cfg.agent.resources, 1),
                    )],
                    volumes: vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(name.to_string()),
                        secret: None,
                    }],
                    priority_class_name: cfg.agent.priority_class_name.clone(),
                },
            },
        },
    );
    apply_owned(registry, daemon_set, owner)
        .await
        .with_context(|| format!("failed to apply daemonset {ns}/{name}"))?;

    let metrics = Service::new(
        meta(ns, &format!("{name}-metrics")),
        ServiceSpec {
            selector: selector_labels(name),
            ports: vec![service_port("http-metrics", ports::METRICS)],
        },
    );
    apply_owned(registry, metrics, owner)
        .await
        .with_context(|| format!("failed to apply metrics service of {ns}/{name}"))?;

    apply_network_policy(registry, ns, name, &cfg.allowed_ports, owner).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::config::TraceConfig;
    use crate::resources::owner_reference;
    use common::{NamespacedName, TracePipeline, TracePipelineSpec};

    #[tokio::test]
    async fn test_gateway_checksum_changes_with_config() {
        let registry = Registry::in_memory();
        let owner = registry
            .create(TracePipeline::new("p1", TracePipelineSpec::default()))
            .await
            .unwrap()
            .object;
        let trace = TraceConfig::default();
        let mut cfg = GatewayApplyConfig {
            gateway: &trace.gateway,
            namespace: "kyma-system",
            replicas: 2,
            resource_multiplier: 1,
            collector_config: "a: 1\n".to_string(),
            env: EnvVars::new(),
            allowed_ports: vec![ports::METRICS, ports::OTLP_GRPC, ports::METRICS],
            istio: IstioConfig {
                active: true,
                exclude_ports: ports::METRICS.to_string(),
            },
        };
        let owner = owner_reference(&owner);
        apply_gateway_resources(&registry, &owner, &cfg).await.unwrap();

        let key = NamespacedName::new("kyma-system", "telemetry-trace-collector");
        let first = registry.get::<Deployment>(&key).await.unwrap().unwrap().object;
        let annotations = &first.spec.template.metadata.annotations;
        assert_eq!(annotations[ISTIO_EXCLUDE_INBOUND_PORTS], "8888");
        assert_eq!(first.spec.replicas, 2);

        let policy = registry
            .get::<NetworkPolicy>(&key)
            .await
            .unwrap()
            .unwrap()
            .object;
        assert_eq!(policy.spec.ingress_ports, vec![4317, 8888]);
        assert!(
            registry
                .get::<Service>(&NamespacedName::new("kyma-system", "telemetry-otlp-traces"))
                .await
                .unwrap()
                .is_some()
        );

        cfg.collector_config = "a: 2\n".to_string();
        apply_gateway_resources(&registry, &owner, &cfg).await.unwrap();
        let second = registry.get::<Deployment>(&key).await.unwrap().unwrap().object;
        assert_ne!(
            first.spec.template.metadata.annotations[CHECKSUM_ANNOTATION],
            second.spec.template.metadata.annotations[CHECKSUM_ANNOTATION]
        );
    }
}
